//! Coordinate transforms fitted from tie points.
//!
//! A tie point pairs a location in the target (projected Mercator meters)
//! coordinate system with the corresponding pixel location in the source
//! image. Given a set of tie points, [`get_transform`] picks a transform
//! family appropriate for the number of points and fits it; the resulting
//! transform maps source pixels forward into meters and meters back into
//! source pixels.
//!
//! The available families, from least to most flexible:
//! - [`TranslateTransform`]: pure 2D offset
//! - [`RotateScaleTranslateTransform`]: similarity (4 parameters)
//! - [`AffineTransform`]: full linear + offset (6 parameters)
//! - [`ProjectiveTransform`]: homography (8 parameters)
//! - [`QuadraticTransform`] / [`QuadraticTransform2`]: projective base with
//!   quadratic correction terms
//! - [`CameraModelTransform`]: physical pinhole camera model
//!
//! Fitted transforms serialize to tagged JSON records (a `type` field plus
//! the numeric parameters) and round-trip through [`make_transform`].

pub mod camera;
pub mod linear;
pub mod projective;

pub use camera::{CameraFixedParams, CameraModelTransform, CameraParamSource, CameraTelemetry};
pub use linear::{AffineTransform, RotateScaleTranslateTransform, TranslateTransform};
pub use projective::{ProjectiveTransform, QuadraticTransform, QuadraticTransform2};

use crate::optimize::optimize;
use nalgebra::{DVector, Matrix3, Vector2};
use serde_json::{json, Value};

#[derive(thiserror::Error, Debug)]
pub enum TransformError {
    #[error("not enough tie points")]
    NotEnoughTiePoints,
    #[error(
        "unknown transform type {0}, expected one of: \
         translate, rotate_scale, projective, quadratic, quadratic2, CameraModelTransform"
    )]
    UnknownTransformType(String),
    #[error("malformed transform record: {0}")]
    MalformedRecord(String),
    #[error("camera metadata required for image {0}")]
    MissingCameraMetadata(String),
    #[error("degenerate fit: {0}")]
    DegenerateFit(String),
}

/// A fitted mapping between two 2D coordinate systems.
///
/// `forward` maps source-image pixels to projected meters; `reverse` maps
/// projected meters back to source pixels. Both return `None` for points
/// where the mapping is undefined (no real root of a quadratic inverse, a
/// camera ray that misses the Earth, a singular matrix). Those are expected
/// boundary conditions, not errors.
pub trait Transform {
    fn forward(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>>;
    fn reverse(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>>;
}

/// Closed set of transform variants, used wherever a fitted transform is
/// stored or deserialized.
#[derive(Debug, Clone)]
pub enum AnyTransform {
    Translate(TranslateTransform),
    RotateScaleTranslate(RotateScaleTranslateTransform),
    Affine(AffineTransform),
    Projective(ProjectiveTransform),
    Quadratic(QuadraticTransform),
    Quadratic2(QuadraticTransform2),
    Camera(CameraModelTransform),
}

impl Transform for AnyTransform {
    fn forward(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        match self {
            AnyTransform::Translate(t) => t.forward(pt),
            AnyTransform::RotateScaleTranslate(t) => t.forward(pt),
            AnyTransform::Affine(t) => t.forward(pt),
            AnyTransform::Projective(t) => t.forward(pt),
            AnyTransform::Quadratic(t) => t.forward(pt),
            AnyTransform::Quadratic2(t) => t.forward(pt),
            AnyTransform::Camera(t) => t.forward(pt),
        }
    }

    fn reverse(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        match self {
            AnyTransform::Translate(t) => t.reverse(pt),
            AnyTransform::RotateScaleTranslate(t) => t.reverse(pt),
            AnyTransform::Affine(t) => t.reverse(pt),
            AnyTransform::Projective(t) => t.reverse(pt),
            AnyTransform::Quadratic(t) => t.reverse(pt),
            AnyTransform::Quadratic2(t) => t.reverse(pt),
            AnyTransform::Camera(t) => t.reverse(pt),
        }
    }
}

impl AnyTransform {
    /// Serialize to the persisted tagged-JSON record format.
    ///
    /// The affine family serializes under the `projective` tag: its matrix
    /// is a plain 3x3 and reads back as a projective transform with the
    /// same mapping.
    pub fn to_json(&self) -> Value {
        match self {
            AnyTransform::Translate(t) => json!({
                "type": "translate",
                "matrix": matrix3_to_rows(&t.matrix),
            }),
            AnyTransform::RotateScaleTranslate(t) => json!({
                "type": "rotate_scale",
                "matrix": matrix3_to_rows(&t.matrix),
            }),
            AnyTransform::Affine(t) => json!({
                "type": "projective",
                "matrix": matrix3_to_rows(&t.matrix),
            }),
            AnyTransform::Projective(t) => json!({
                "type": "projective",
                "matrix": matrix3_to_rows(&t.matrix),
            }),
            AnyTransform::Quadratic(t) => json!({
                "type": "quadratic",
                "matrix": t.matrix_rows(),
            }),
            AnyTransform::Quadratic2(t) => json!({
                "type": "quadratic2",
                "matrix": matrix3_to_rows(&t.matrix),
                "quadraticTerms": t.quadratic_terms.to_vec(),
            }),
            AnyTransform::Camera(t) => json!({
                "type": "CameraModelTransform",
                "params": t.params.to_vec(),
                "imageId": t.image_id,
            }),
        }
    }

    /// Deserialize a tagged record. `CameraModelTransform` records need
    /// external camera metadata; use [`AnyTransform::from_json_with_camera`]
    /// for those.
    pub fn from_json(record: &Value) -> Result<Self, TransformError> {
        Self::from_json_impl(record, None)
    }

    /// Deserialize a tagged record, resolving camera metadata for
    /// `CameraModelTransform` records through `source`.
    pub fn from_json_with_camera(
        record: &Value,
        source: &dyn CameraParamSource,
    ) -> Result<Self, TransformError> {
        Self::from_json_impl(record, Some(source))
    }

    fn from_json_impl(
        record: &Value,
        camera_source: Option<&dyn CameraParamSource>,
    ) -> Result<Self, TransformError> {
        let transform_type = record
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TransformError::MalformedRecord("missing 'type' tag".to_string()))?;

        match transform_type {
            "CameraModelTransform" => {
                let image_id = record
                    .get("imageId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        TransformError::MalformedRecord("missing 'imageId'".to_string())
                    })?;
                let params = parse_number_array::<6>(record.get("params"), "params")?;
                let fixed = camera_source
                    .and_then(|s| s.lookup(image_id))
                    .ok_or_else(|| {
                        TransformError::MissingCameraMetadata(image_id.to_string())
                    })?;
                Ok(AnyTransform::Camera(CameraModelTransform::new(
                    params,
                    fixed,
                    image_id.to_string(),
                )))
            }
            "translate" => Ok(AnyTransform::Translate(TranslateTransform::new(
                parse_matrix3(record.get("matrix"))?,
            ))),
            "rotate_scale" => Ok(AnyTransform::RotateScaleTranslate(
                RotateScaleTranslateTransform::new(parse_matrix3(record.get("matrix"))?),
            )),
            "projective" => Ok(AnyTransform::Projective(ProjectiveTransform::new(
                parse_matrix3(record.get("matrix"))?,
            ))),
            "quadratic" => Ok(AnyTransform::Quadratic(QuadraticTransform::from_rows(
                record.get("matrix"),
            )?)),
            "quadratic2" => {
                let matrix = parse_matrix3(record.get("matrix"))?;
                let terms = parse_number_array::<4>(record.get("quadraticTerms"), "quadraticTerms")?;
                Ok(AnyTransform::Quadratic2(QuadraticTransform2::new(
                    matrix, terms,
                )))
            }
            other => Err(TransformError::UnknownTransformType(other.to_string())),
        }
    }
}

/// Make a transform from its persisted tagged-JSON record.
pub fn make_transform(record: &Value) -> Result<AnyTransform, TransformError> {
    AnyTransform::from_json(record)
}

/// Transform family chosen for a given number of tie points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    RotateScaleTranslate,
    Affine,
    Projective,
    Quadratic2,
}

/// Given the number of available tie points, decide which transform family
/// to fit. More points unlock higher-order (more flexible) models.
pub fn get_transform_class(n: usize) -> Result<TransformKind, TransformError> {
    if n < 2 {
        Err(TransformError::NotEnoughTiePoints)
    } else if n == 2 {
        Ok(TransformKind::RotateScaleTranslate)
    } else if n == 3 {
        Ok(TransformKind::Affine)
    } else if n < 7 {
        Ok(TransformKind::Projective)
    } else {
        Ok(TransformKind::Quadratic2)
    }
}

/// Find the best transform describing the input/output point pairs.
pub fn get_transform(
    to_pts: &[Vector2<f64>],
    from_pts: &[Vector2<f64>],
) -> Result<AnyTransform, TransformError> {
    match get_transform_class(to_pts.len())? {
        TransformKind::RotateScaleTranslate => Ok(AnyTransform::RotateScaleTranslate(
            RotateScaleTranslateTransform::fit(to_pts, from_pts)?,
        )),
        TransformKind::Affine => Ok(AnyTransform::Affine(AffineTransform::fit(
            to_pts, from_pts,
        )?)),
        TransformKind::Projective => Ok(AnyTransform::Projective(ProjectiveTransform::fit(
            to_pts, from_pts,
        )?)),
        TransformKind::Quadratic2 => Ok(AnyTransform::Quadratic2(QuadraticTransform2::fit(
            to_pts, from_pts,
        )?)),
    }
}

/// Separate a merged tie-point list (`[toX, toY, fromX, fromY]` per entry)
/// into target and source point lists.
pub fn split_points(points: &[[f64; 4]]) -> (Vec<Vector2<f64>>, Vec<Vector2<f64>>) {
    let to_pts = points.iter().map(|p| Vector2::new(p[0], p[1])).collect();
    let from_pts = points.iter().map(|p| Vector2::new(p[2], p[3])).collect();
    (to_pts, from_pts)
}

/// Apply a forward transform to each input point.
pub fn forward_pts<T: Transform + ?Sized>(
    tform: &T,
    from_pts: &[Vector2<f64>],
) -> Vec<Option<Vector2<f64>>> {
    from_pts.iter().map(|p| tform.forward(p)).collect()
}

/// Residual used when a trial transform cannot project a point; large enough
/// to push the optimizer away from the degenerate parameter region.
pub(crate) const INVALID_PROJECTION_RESIDUAL: f64 = 1e6;

/// Flatten points row-major into the vector form the optimizer works on.
pub(crate) fn flatten_pts(pts: &[Vector2<f64>]) -> DVector<f64> {
    let mut v = DVector::zeros(pts.len() * 2);
    for (i, p) in pts.iter().enumerate() {
        v[2 * i] = p.x;
        v[2 * i + 1] = p.y;
    }
    v
}

/// Forward-map and flatten, substituting the invalid-projection residual
/// where the mapping is undefined.
pub(crate) fn flatten_forward<T: Transform>(tform: &T, from_pts: &[Vector2<f64>]) -> DVector<f64> {
    let mut v = DVector::zeros(from_pts.len() * 2);
    for (i, p) in from_pts.iter().enumerate() {
        match tform.forward(p) {
            Some(q) => {
                v[2 * i] = q.x;
                v[2 * i + 1] = q.y;
            }
            None => {
                v[2 * i] = INVALID_PROJECTION_RESIDUAL;
                v[2 * i + 1] = INVALID_PROJECTION_RESIDUAL;
            }
        }
    }
    v
}

/// Shared fit harness: minimize the tie-point reprojection error over the
/// parameter vector, reconstructing a transform per trial via `from_params`.
pub(crate) fn fit_params<T, F>(
    to_pts: &[Vector2<f64>],
    from_pts: &[Vector2<f64>],
    params0: DVector<f64>,
    from_params: F,
) -> T
where
    T: Transform,
    F: Fn(&DVector<f64>) -> T,
{
    let y = flatten_pts(to_pts);
    let params = optimize(
        &y,
        |p| flatten_forward(&from_params(p), from_pts),
        params0,
    );
    from_params(&params)
}

/// Compute the inverse of a projective transform matrix via the cofactor
/// formula, normalized so the bottom-right entry is 1.
pub(crate) fn get_projective_inverse(matrix: &Matrix3<f64>) -> Matrix3<f64> {
    let c0 = matrix[(0, 0)];
    let c1 = matrix[(0, 1)];
    let c2 = matrix[(0, 2)];
    let c3 = matrix[(1, 0)];
    let c4 = matrix[(1, 1)];
    let c5 = matrix[(1, 2)];
    let c6 = matrix[(2, 0)];
    let c7 = matrix[(2, 1)];
    let result = Matrix3::new(
        c4 - c5 * c7,
        c2 * c7 - c1,
        c1 * c5 - c2 * c4,
        c5 * c6 - c3,
        c0 - c2 * c6,
        c3 * c2 - c0 * c5,
        c3 * c7 - c4 * c6,
        c1 * c6 - c0 * c7,
        c0 * c4 - c1 * c3,
    );
    result / result[(2, 2)]
}

/// Solve `p = x + a*x^2` for x. Over the region of interest there are
/// generally two real roots with one much closer to p than the other; prefer
/// that one. Returns `None` when the discriminant is negative (no real
/// solution) and `p` itself when `a` is effectively zero.
pub fn solve_quad(a: f64, p: f64) -> Option<f64> {
    if a * a > 1e-20 {
        let discriminant = 4.0 * a * p + 1.0;
        if discriminant < 0.0 {
            return None;
        }
        let h = discriminant.sqrt();
        let r1 = (-1.0 + h) / (2.0 * a);
        let r2 = (-1.0 - h) / (2.0 * a);
        if (p - r1).abs() <= (p - r2).abs() {
            Some(r1)
        } else {
            Some(r2)
        }
    } else {
        // avoid divide by zero
        Some(p)
    }
}

fn matrix3_to_rows(m: &Matrix3<f64>) -> Vec<Vec<f64>> {
    (0..3)
        .map(|r| (0..3).map(|c| m[(r, c)]).collect())
        .collect()
}

pub(crate) fn parse_matrix3(v: Option<&Value>) -> Result<Matrix3<f64>, TransformError> {
    let rows = v
        .and_then(Value::as_array)
        .ok_or_else(|| TransformError::MalformedRecord("missing 'matrix'".to_string()))?;
    if rows.len() != 3 {
        return Err(TransformError::MalformedRecord(format!(
            "expected 3 matrix rows, got {}",
            rows.len()
        )));
    }
    let mut m = Matrix3::zeros();
    for (r, row) in rows.iter().enumerate() {
        let row = row.as_array().ok_or_else(|| {
            TransformError::MalformedRecord("matrix row is not an array".to_string())
        })?;
        if row.len() != 3 {
            return Err(TransformError::MalformedRecord(format!(
                "expected 3 matrix columns, got {}",
                row.len()
            )));
        }
        for (c, val) in row.iter().enumerate() {
            m[(r, c)] = val.as_f64().ok_or_else(|| {
                TransformError::MalformedRecord("matrix entry is not a number".to_string())
            })?;
        }
    }
    Ok(m)
}

pub(crate) fn parse_number_array<const N: usize>(
    v: Option<&Value>,
    field: &str,
) -> Result<[f64; N], TransformError> {
    let values = v
        .and_then(Value::as_array)
        .ok_or_else(|| TransformError::MalformedRecord(format!("missing '{field}'")))?;
    if values.len() != N {
        return Err(TransformError::MalformedRecord(format!(
            "expected {N} values in '{field}', got {}",
            values.len()
        )));
    }
    let mut out = [0.0; N];
    for (i, val) in values.iter().enumerate() {
        out[i] = val.as_f64().ok_or_else(|| {
            TransformError::MalformedRecord(format!("'{field}' entry is not a number"))
        })?;
    }
    Ok(out)
}
