//! Linear transform family: translation, similarity, and affine, all backed
//! by a 3x3 homogeneous matrix whose bottom row is `[0, 0, 1]`.

use super::{fit_params, Transform, TransformError};
use nalgebra::{DMatrix, DVector, Matrix3, Vector2, Vector3};

fn linear_forward(matrix: &Matrix3<f64>, pt: &Vector2<f64>) -> Vector2<f64> {
    let v = matrix * Vector3::new(pt.x, pt.y, 1.0);
    Vector2::new(v.x, v.y)
}

fn linear_reverse(inverse: Option<&Matrix3<f64>>, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
    inverse.map(|m| linear_forward(m, pt))
}

/// Pure 2D translation. Fits with a single tie point (or averages several).
#[derive(Debug, Clone)]
pub struct TranslateTransform {
    pub matrix: Matrix3<f64>,
    inverse: Option<Matrix3<f64>>,
}

impl TranslateTransform {
    pub fn new(matrix: Matrix3<f64>) -> Self {
        let inverse = matrix.try_inverse();
        Self { matrix, inverse }
    }

    /// Closed-form fit: the offset is the mean difference between target
    /// and source points.
    pub fn fit(
        to_pts: &[Vector2<f64>],
        from_pts: &[Vector2<f64>],
    ) -> Result<Self, TransformError> {
        if to_pts.is_empty() || to_pts.len() != from_pts.len() {
            return Err(TransformError::NotEnoughTiePoints);
        }
        let n = to_pts.len() as f64;
        let mut offset = Vector2::zeros();
        for (to, from) in to_pts.iter().zip(from_pts) {
            offset += to - from;
        }
        offset /= n;
        Ok(Self::new(Matrix3::new(
            1.0, 0.0, offset.x, //
            0.0, 1.0, offset.y, //
            0.0, 0.0, 1.0,
        )))
    }
}

impl Transform for TranslateTransform {
    fn forward(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        Some(linear_forward(&self.matrix, pt))
    }

    fn reverse(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        linear_reverse(self.inverse.as_ref(), pt)
    }
}

/// Similarity transform: rotation, uniform scale, and translation
/// (4 parameters), refined iteratively from an affine seed.
#[derive(Debug, Clone)]
pub struct RotateScaleTranslateTransform {
    pub matrix: Matrix3<f64>,
    inverse: Option<Matrix3<f64>>,
}

impl RotateScaleTranslateTransform {
    pub fn new(matrix: Matrix3<f64>) -> Self {
        let inverse = matrix.try_inverse();
        Self { matrix, inverse }
    }

    /// Recover `[tx, ty, scale, theta]` from a linear matrix. The scale
    /// extracted from an arbitrary affine matrix is the determinant of its
    /// upper-left block; for a true similarity that equals the squared
    /// scale, which is close enough for an initial guess.
    fn params_from_matrix(matrix: &Matrix3<f64>) -> DVector<f64> {
        let tx = matrix[(0, 2)];
        let ty = matrix[(1, 2)];
        let scale = matrix[(0, 0)] * matrix[(1, 1)] - matrix[(1, 0)] * matrix[(0, 1)];
        let theta = (-matrix[(0, 1)]).atan2(matrix[(0, 0)]);
        DVector::from_vec(vec![tx, ty, scale, theta])
    }

    fn matrix_from_params(params: &DVector<f64>) -> Matrix3<f64> {
        let (tx, ty, scale, theta) = (params[0], params[1], params[2], params[3]);
        let translate = Matrix3::new(
            1.0, 0.0, tx, //
            0.0, 1.0, ty, //
            0.0, 0.0, 1.0,
        );
        let scale_m = Matrix3::new(
            scale, 0.0, 0.0, //
            0.0, scale, 0.0, //
            0.0, 0.0, 1.0,
        );
        let rotate = Matrix3::new(
            theta.cos(),
            -theta.sin(),
            0.0,
            theta.sin(),
            theta.cos(),
            0.0,
            0.0,
            0.0,
            1.0,
        );
        translate * scale_m * rotate
    }

    pub fn fit(
        to_pts: &[Vector2<f64>],
        from_pts: &[Vector2<f64>],
    ) -> Result<Self, TransformError> {
        if to_pts.len() < 2 || to_pts.len() != from_pts.len() {
            return Err(TransformError::NotEnoughTiePoints);
        }
        let affine = AffineTransform::fit_matrix(to_pts, from_pts)?;
        let params0 = Self::params_from_matrix(&affine);
        Ok(fit_params(to_pts, from_pts, params0, |p| {
            Self::new(Self::matrix_from_params(p))
        }))
    }
}

impl Transform for RotateScaleTranslateTransform {
    fn forward(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        Some(linear_forward(&self.matrix, pt))
    }

    fn reverse(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        linear_reverse(self.inverse.as_ref(), pt)
    }
}

/// Full 2D affine transform (6 parameters), fit in closed form by linear
/// least squares.
#[derive(Debug, Clone)]
pub struct AffineTransform {
    pub matrix: Matrix3<f64>,
    inverse: Option<Matrix3<f64>>,
}

impl AffineTransform {
    pub fn new(matrix: Matrix3<f64>) -> Self {
        let inverse = matrix.try_inverse();
        Self { matrix, inverse }
    }

    /// Stack each tie point into two rows of an overdetermined 2n x 6
    /// system and solve it by SVD.
    pub(crate) fn fit_matrix(
        to_pts: &[Vector2<f64>],
        from_pts: &[Vector2<f64>],
    ) -> Result<Matrix3<f64>, TransformError> {
        let n = to_pts.len();
        if n < 2 || n != from_pts.len() {
            return Err(TransformError::NotEnoughTiePoints);
        }
        let mut u = DMatrix::zeros(2 * n, 6);
        let mut b = DVector::zeros(2 * n);
        for (i, (to, from)) in to_pts.iter().zip(from_pts).enumerate() {
            u[(2 * i, 0)] = from.x;
            u[(2 * i, 1)] = from.y;
            u[(2 * i, 2)] = 1.0;
            u[(2 * i + 1, 3)] = from.x;
            u[(2 * i + 1, 4)] = from.y;
            u[(2 * i + 1, 5)] = 1.0;
            b[2 * i] = to.x;
            b[2 * i + 1] = to.y;
        }
        let p = u
            .svd(true, true)
            .solve(&b, 1e-15)
            .map_err(|e| TransformError::DegenerateFit(e.to_string()))?;
        Ok(Matrix3::new(
            p[0], p[1], p[2], //
            p[3], p[4], p[5], //
            0.0, 0.0, 1.0,
        ))
    }

    pub fn fit(
        to_pts: &[Vector2<f64>],
        from_pts: &[Vector2<f64>],
    ) -> Result<Self, TransformError> {
        Ok(Self::new(Self::fit_matrix(to_pts, from_pts)?))
    }
}

impl Transform for AffineTransform {
    fn forward(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        Some(linear_forward(&self.matrix, pt))
    }

    fn reverse(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        linear_reverse(self.inverse.as_ref(), pt)
    }
}
