//! Projective (homography) transform and the quadratic-correction variants
//! layered on a projective base.

use super::{fit_params, get_projective_inverse, solve_quad, Transform, TransformError};
use crate::optimize::optimize;
use crate::transform::linear::AffineTransform;
use nalgebra::{DVector, Matrix3, Matrix3x5, Vector2, Vector3, Vector5};
use serde_json::Value;

/// Pre-conditioning factor applied to target coordinates while fitting
/// [`QuadraticTransform2`]. Mercator meters span ~1e7, so dividing by this
/// keeps the fitted parameters near unit magnitude. Empirically chosen.
pub const QUADRATIC2_SCALE: f64 = 1e7;

fn projective_apply(matrix: &Matrix3<f64>, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
    let v0 = matrix * Vector3::new(pt.x, pt.y, 1.0);
    // projective rescaling: divide by z and truncate
    let v = Vector2::new(v0.x / v0.z, v0.y / v0.z);
    if v.x.is_finite() && v.y.is_finite() {
        Some(v)
    } else {
        None
    }
}

/// Homography with 8 free parameters (bottom-right entry fixed at 1).
///
/// See <http://www.corrmap.com/features/homography_transformation.php>.
#[derive(Debug, Clone)]
pub struct ProjectiveTransform {
    pub matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl ProjectiveTransform {
    pub fn new(matrix: Matrix3<f64>) -> Self {
        let inverse = get_projective_inverse(&matrix);
        Self { matrix, inverse }
    }

    fn from_params(params: &DVector<f64>) -> Self {
        Self::new(Matrix3::new(
            params[0], params[1], params[2], //
            params[3], params[4], params[5], //
            params[6], params[7], 1.0,
        ))
    }

    /// Initial guess: the affine fit, whose matrix already has the right
    /// bottom row up to the two projective terms.
    fn init_params(
        to_pts: &[Vector2<f64>],
        from_pts: &[Vector2<f64>],
    ) -> Result<DVector<f64>, TransformError> {
        let tmat = AffineTransform::fit_matrix(to_pts, from_pts)?;
        Ok(DVector::from_vec(vec![
            tmat[(0, 0)],
            tmat[(0, 1)],
            tmat[(0, 2)],
            tmat[(1, 0)],
            tmat[(1, 1)],
            tmat[(1, 2)],
            tmat[(2, 0)],
            tmat[(2, 1)],
        ]))
    }

    pub fn fit(
        to_pts: &[Vector2<f64>],
        from_pts: &[Vector2<f64>],
    ) -> Result<Self, TransformError> {
        if to_pts.len() < 4 || to_pts.len() != from_pts.len() {
            return Err(TransformError::NotEnoughTiePoints);
        }
        let params0 = Self::init_params(to_pts, from_pts)?;
        Ok(fit_params(to_pts, from_pts, params0, Self::from_params))
    }
}

impl Transform for ProjectiveTransform {
    fn forward(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        projective_apply(&self.matrix, pt)
    }

    fn reverse(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        projective_apply(&self.inverse, pt)
    }
}

/// Quadratic surrogate: a 3x5 matrix applied to the monomial basis
/// `[x^2, y^2, x, y, 1]` with a homogeneous divide.
#[derive(Debug, Clone)]
pub struct QuadraticTransform {
    pub matrix: Matrix3x5<f64>,
    // there's a projective transform hiding in the quadratic transform if
    // we drop the first two columns. we use it to estimate an initial
    // value when calculating the inverse.
    proj: ProjectiveTransform,
}

impl QuadraticTransform {
    pub fn new(matrix: Matrix3x5<f64>) -> Self {
        let proj = ProjectiveTransform::new(matrix.fixed_view::<3, 3>(0, 2).into_owned());
        Self { matrix, proj }
    }

    pub(crate) fn matrix_rows(&self) -> Vec<Vec<f64>> {
        (0..3)
            .map(|r| (0..5).map(|c| self.matrix[(r, c)]).collect())
            .collect()
    }

    pub(crate) fn from_rows(v: Option<&Value>) -> Result<Self, TransformError> {
        let rows = v
            .and_then(Value::as_array)
            .ok_or_else(|| TransformError::MalformedRecord("missing 'matrix'".to_string()))?;
        if rows.len() != 3 {
            return Err(TransformError::MalformedRecord(format!(
                "expected 3 matrix rows, got {}",
                rows.len()
            )));
        }
        let mut m = Matrix3x5::zeros();
        for (r, row) in rows.iter().enumerate() {
            let row = row.as_array().ok_or_else(|| {
                TransformError::MalformedRecord("matrix row is not an array".to_string())
            })?;
            if row.len() != 5 {
                return Err(TransformError::MalformedRecord(format!(
                    "expected 5 matrix columns, got {}",
                    row.len()
                )));
            }
            for (c, val) in row.iter().enumerate() {
                m[(r, c)] = val.as_f64().ok_or_else(|| {
                    TransformError::MalformedRecord("matrix entry is not a number".to_string())
                })?;
            }
        }
        Ok(Self::new(m))
    }

    fn from_params(params: &DVector<f64>) -> Self {
        let mut matrix = Matrix3x5::zeros();
        for c in 0..5 {
            matrix[(0, c)] = params[c];
            matrix[(1, c)] = params[5 + c];
        }
        matrix[(2, 2)] = params[10];
        matrix[(2, 3)] = params[11];
        matrix[(2, 4)] = 1.0;
        Self::new(matrix)
    }

    fn init_params(
        to_pts: &[Vector2<f64>],
        from_pts: &[Vector2<f64>],
    ) -> Result<DVector<f64>, TransformError> {
        let tmat = AffineTransform::fit_matrix(to_pts, from_pts)?;
        let mut params = DVector::zeros(12);
        for c in 0..3 {
            params[2 + c] = tmat[(0, c)];
            params[7 + c] = tmat[(1, c)];
        }
        params[10] = tmat[(2, 0)];
        params[11] = tmat[(2, 1)];
        Ok(params)
    }

    pub fn fit(
        to_pts: &[Vector2<f64>],
        from_pts: &[Vector2<f64>],
    ) -> Result<Self, TransformError> {
        if to_pts.len() < 6 || to_pts.len() != from_pts.len() {
            return Err(TransformError::NotEnoughTiePoints);
        }
        let params0 = Self::init_params(to_pts, from_pts)?;
        Ok(fit_params(to_pts, from_pts, params0, Self::from_params))
    }
}

impl Transform for QuadraticTransform {
    fn forward(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        let u = Vector5::new(pt.x * pt.x, pt.y * pt.y, pt.x, pt.y, 1.0);
        let v0 = self.matrix * u;
        let v = Vector2::new(v0.x / v0.z, v0.y / v0.z);
        if v.x.is_finite() && v.y.is_finite() {
            Some(v)
        } else {
            None
        }
    }

    fn reverse(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        // a rough initial value from the inverse of the simpler projective
        // transform; exact already if the quadratic terms happen to be 0.
        let u0 = self.proj.reverse(pt)?;

        // refine to an exact inverse
        let y = DVector::from_vec(vec![pt.x, pt.y]);
        let umin = optimize(
            &y,
            |u| {
                let p = Vector2::new(u[0], u[1]);
                match self.forward(&p) {
                    Some(q) => DVector::from_vec(vec![q.x, q.y]),
                    None => DVector::from_element(2, super::INVALID_PROJECTION_RESIDUAL),
                }
            },
            DVector::from_vec(vec![u0.x, u0.y]),
        );
        Some(Vector2::new(umin[0], umin[1]))
    }
}

/// Projective base plus four scalar quadratic correction terms, fit against
/// target coordinates divided by [`QUADRATIC2_SCALE`] for conditioning.
///
/// Forward chains `p = x + a*x^2`, `q = y + b*y^2`, `r = p + c*q^2`,
/// `s = q + d*r^2` then multiplies the scale back in; reverse unwinds the
/// chain exactly, using [`solve_quad`] for the two scalar quadratics.
#[derive(Debug, Clone)]
pub struct QuadraticTransform2 {
    pub matrix: Matrix3<f64>,
    pub quadratic_terms: [f64; 4],
    proj_inverse: Matrix3<f64>,
}

impl QuadraticTransform2 {
    pub fn new(matrix: Matrix3<f64>, quadratic_terms: [f64; 4]) -> Self {
        let proj_inverse = get_projective_inverse(&matrix);
        Self {
            matrix,
            quadratic_terms,
            proj_inverse,
        }
    }

    fn from_params(params: &DVector<f64>) -> Self {
        let matrix = Matrix3::new(
            params[0], params[1], params[2], //
            params[3], params[4], params[5], //
            params[6], params[7], 1.0,
        );
        let terms = [params[8], params[9], params[10], params[11]];
        Self::new(matrix, terms)
    }

    fn init_params(
        to_pts: &[Vector2<f64>],
        from_pts: &[Vector2<f64>],
    ) -> Result<DVector<f64>, TransformError> {
        // pre-conditioning by the scale improves numerical stability
        let scaled: Vec<Vector2<f64>> = to_pts.iter().map(|p| p / QUADRATIC2_SCALE).collect();
        let tmat = AffineTransform::fit_matrix(&scaled, from_pts)?;
        let mut params = DVector::zeros(12);
        let mut k = 0;
        for r in 0..3 {
            for c in 0..3 {
                if k < 8 {
                    params[k] = tmat[(r, c)];
                    k += 1;
                }
            }
        }
        Ok(params)
    }

    pub fn fit(
        to_pts: &[Vector2<f64>],
        from_pts: &[Vector2<f64>],
    ) -> Result<Self, TransformError> {
        if to_pts.len() < 7 || to_pts.len() != from_pts.len() {
            return Err(TransformError::NotEnoughTiePoints);
        }
        let params0 = Self::init_params(to_pts, from_pts)?;
        Ok(fit_params(to_pts, from_pts, params0, Self::from_params))
    }
}

impl Transform for QuadraticTransform2 {
    fn forward(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        let v = projective_apply(&self.matrix, pt)?;
        let (x, y) = (v.x, v.y);
        let [a, b, c, d] = self.quadratic_terms;

        let p = x + a * x * x;
        let q = y + b * y * y;
        let r = p + c * q * q;
        let s = q + d * r * r;

        // correct for pre-conditioning
        Some(Vector2::new(r * QUADRATIC2_SCALE, s * QUADRATIC2_SCALE))
    }

    fn reverse(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        // correct for pre-conditioning
        let r = pt.x / QUADRATIC2_SCALE;
        let s = pt.y / QUADRATIC2_SCALE;

        let [a, b, c, d] = self.quadratic_terms;

        let q = s - d * r * r;
        let p = r - c * q * q;
        let x0 = solve_quad(a, p)?;
        let y0 = solve_quad(b, q)?;

        projective_apply(&self.proj_inverse, &Vector2::new(x0, y0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{split_points, test_data};
    use approx::assert_relative_eq;

    #[test]
    fn test_projective_fit_reference_points() {
        let (to_pts, from_pts) = split_points(&test_data::POINTS);
        let tform = ProjectiveTransform::fit(&to_pts[..5], &from_pts[..5]).unwrap();
        // Five points overdetermine the 8-parameter model only slightly;
        // the fit should land close to interpolating.
        let residual = test_data::fit_residual(&tform, &to_pts[..5], &from_pts[..5]);
        assert!(residual < 10.0, "residual {residual} too large");
    }

    #[test]
    fn test_projective_forward_reverse_round_trip() {
        let m = Matrix3::new(2.0, 0.1, 50.0, -0.2, 1.8, -30.0, 1e-5, -2e-5, 1.0);
        let tform = ProjectiveTransform::new(m);
        let p = Vector2::new(120.0, 340.0);
        let fwd = tform.forward(&p).unwrap();
        let back = tform.reverse(&fwd).unwrap();
        assert_relative_eq!(back.x, p.x, epsilon = 1e-8);
        assert_relative_eq!(back.y, p.y, epsilon = 1e-8);
    }

    #[test]
    fn test_quadratic_without_quadratic_terms_matches_projective() {
        // With zero x^2/y^2 columns the quadratic transform degenerates to
        // its embedded projective transform.
        let mut m = Matrix3x5::zeros();
        m[(0, 2)] = 1.5;
        m[(0, 4)] = 10.0;
        m[(1, 3)] = 2.0;
        m[(1, 4)] = -5.0;
        m[(2, 4)] = 1.0;
        let tform = QuadraticTransform::new(m);
        let p = Vector2::new(4.0, 9.0);
        let fwd = tform.forward(&p).unwrap();
        assert_relative_eq!(fwd.x, 1.5 * 4.0 + 10.0, epsilon = 1e-12);
        assert_relative_eq!(fwd.y, 2.0 * 9.0 - 5.0, epsilon = 1e-12);
        let back = tform.reverse(&fwd).unwrap();
        assert_relative_eq!(back.x, p.x, epsilon = 1e-6);
        assert_relative_eq!(back.y, p.y, epsilon = 1e-6);
    }

    #[test]
    fn test_quadratic_reverse_with_curvature() {
        let mut m = Matrix3x5::zeros();
        m[(0, 0)] = 1e-4; // x^2 term
        m[(0, 2)] = 1.0;
        m[(1, 1)] = -2e-4; // y^2 term
        m[(1, 3)] = 1.0;
        m[(2, 4)] = 1.0;
        let tform = QuadraticTransform::new(m);
        let p = Vector2::new(50.0, 80.0);
        let fwd = tform.forward(&p).unwrap();
        let back = tform.reverse(&fwd).unwrap();
        assert_relative_eq!(back.x, p.x, epsilon = 1e-4);
        assert_relative_eq!(back.y, p.y, epsilon = 1e-4);
    }

    #[test]
    fn test_quadratic2_fit_seven_points() {
        let (to_pts, from_pts) = split_points(&test_data::POINTS);
        let tform = QuadraticTransform2::fit(&to_pts, &from_pts).unwrap();
        let residual = test_data::fit_residual(&tform, &to_pts, &from_pts);
        assert!(residual < 1.0, "normalized residual {residual} too large");
    }

    #[test]
    fn test_quadratic2_forward_reverse_round_trip() {
        let (to_pts, from_pts) = split_points(&test_data::POINTS);
        let tform = QuadraticTransform2::fit(&to_pts, &from_pts).unwrap();
        for from in &from_pts {
            let fwd = tform.forward(from).unwrap();
            let back = tform.reverse(&fwd).unwrap();
            assert_relative_eq!(back.x, from.x, epsilon = 1e-4);
            assert_relative_eq!(back.y, from.y, epsilon = 1e-4);
        }
    }
}
