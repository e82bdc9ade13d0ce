//! GeoTIFF RPC (rational polynomial coefficient) surrogate model, as
//! described in <http://geotiff.maptools.org/rpc_prop.html>.
//!
//! An [`RpcTransform`] approximates an arbitrary geographic-to-pixel
//! projection with ratios of cubic polynomials in normalized lon/lat/height.
//! [`fit_rpc_to_model`] estimates the image footprint by root-finding,
//! samples it with a low-discrepancy sequence and least-squares fits the 78
//! free coefficients against the supplied projection. The fitted model
//! serializes into the standard VRT `RPC` metadata block, which lets stock
//! geospatial tooling warp the image without knowing our transform family.

use crate::geometry::lon_lat_to_meters;
use crate::optimize::optimize;
use crate::transform::{AnyTransform, Transform};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, Vector2, Vector3};

/// Number of samples drawn from the footprint for the least-squares fit.
pub const NUM_FIT_SAMPLES: usize = 500;

/// Fraction by which the estimated footprint bounding box is expanded on
/// each side before sampling.
pub const FOOTPRINT_MARGIN: f64 = 0.5;

/// Default half-width in degrees of the search box around the image center.
pub const MAX_DISTANCE_DEGREES: f64 = 10.0;

/// Height normalization scale in meters. Empirically chosen; the fit only
/// samples at height 0, so this just has to keep H well-conditioned.
pub const DEFAULT_HEIGHT_SCALE: f64 = 1000.0;

#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("collected only {got} of {wanted} valid footprint samples")]
    SamplingExhausted { wanted: usize, got: usize },
    #[error("projection undefined at the image center")]
    BadCenterPoint,
}

/// Forward projection supplied by the caller: WGS84 (lon, lat, alt) to
/// image pixels, `None` where the projection is undefined.
pub type ForwardProjection<'a> = dyn Fn(&Vector3<f64>) -> Option<Vector2<f64>> + 'a;

/// The offset/scale normalization parameters of an RPC model. These are
/// chosen up front from the image size and footprint and are not fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RpcFixedParams {
    pub samp_off: f64,
    pub line_off: f64,
    pub lon_off: f64,
    pub lat_off: f64,
    pub height_off: f64,
    pub samp_scale: f64,
    pub line_scale: f64,
    pub lon_scale: f64,
    pub lat_scale: f64,
    pub height_scale: f64,
}

impl RpcFixedParams {
    /// Recommended normalization for an image of the given pixel size whose
    /// footprint bounding box is `[lon_min, lat_min, lon_max, lat_max]`.
    pub fn from_image_and_bbox(
        image_width: f64,
        image_height: f64,
        clon: f64,
        clat: f64,
        bbox: [f64; 4],
    ) -> Self {
        let [lon_min, lat_min, lon_max, lat_max] = bbox;
        Self {
            samp_off: image_width / 2.0,
            line_off: image_height / 2.0,
            lon_off: clon,
            lat_off: clat,
            height_off: 0.0,
            samp_scale: image_width / 2.0,
            line_scale: image_height / 2.0,
            lon_scale: (lon_max - lon_min) / 2.0,
            lat_scale: (lat_max - lat_min) / 2.0,
            height_scale: DEFAULT_HEIGHT_SCALE,
        }
    }
}

/// The 78 free coefficients of an RPC model, named by group. Denominator
/// leading coefficients are fixed at 1 and not represented here.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCoefficients {
    pub samp_num: [f64; 20],
    pub line_num: [f64; 20],
    pub samp_den: [f64; 19],
    pub line_den: [f64; 19],
}

impl RpcCoefficients {
    pub fn zeros() -> Self {
        Self {
            samp_num: [0.0; 20],
            line_num: [0.0; 20],
            samp_den: [0.0; 19],
            line_den: [0.0; 19],
        }
    }

    /// Unpack the flat parameter vector the optimizer works on.
    fn from_vector(params: &DVector<f64>) -> Self {
        let mut c = Self::zeros();
        c.samp_num.copy_from_slice(&params.as_slice()[0..20]);
        c.line_num.copy_from_slice(&params.as_slice()[20..40]);
        c.samp_den.copy_from_slice(&params.as_slice()[40..59]);
        c.line_den.copy_from_slice(&params.as_slice()[59..78]);
        c
    }
}

/// A fitted RPC model: fixed normalization plus four 20-term coefficient
/// groups. The denominator groups carry their fixed leading 1.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcTransform {
    pub fixed: RpcFixedParams,
    pub samp_num_coeff: [f64; 20],
    pub samp_den_coeff: [f64; 20],
    pub line_num_coeff: [f64; 20],
    pub line_den_coeff: [f64; 20],
}

impl RpcTransform {
    pub fn from_coefficients(coefficients: &RpcCoefficients, fixed: RpcFixedParams) -> Self {
        let mut samp_den_coeff = [0.0; 20];
        samp_den_coeff[0] = 1.0;
        samp_den_coeff[1..].copy_from_slice(&coefficients.samp_den);
        let mut line_den_coeff = [0.0; 20];
        line_den_coeff[0] = 1.0;
        line_den_coeff[1..].copy_from_slice(&coefficients.line_den);
        Self {
            fixed,
            samp_num_coeff: coefficients.samp_num,
            samp_den_coeff,
            line_num_coeff: coefficients.line_num,
            line_den_coeff,
        }
    }

    /// Evaluate the 20-term cubic monomial basis at each normalized point.
    /// Term order follows the GeoTIFF RPC convention.
    pub fn get_poly_matrix(&self, u: &[Vector3<f64>]) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(u.len(), 20);
        for (i, pt) in u.iter().enumerate() {
            let l = (pt.x - self.fixed.lon_off) / self.fixed.lon_scale;
            let p = (pt.y - self.fixed.lat_off) / self.fixed.lat_scale;
            let h = (pt.z - self.fixed.height_off) / self.fixed.height_scale;

            m[(i, 0)] = 1.0;
            m[(i, 1)] = l;
            m[(i, 2)] = p;
            m[(i, 3)] = h;
            m[(i, 4)] = l * p;
            m[(i, 5)] = l * h;
            m[(i, 6)] = p * h;
            m[(i, 7)] = l * l;
            m[(i, 8)] = p * p;
            m[(i, 9)] = h * h;
            m[(i, 10)] = p * l * h;
            m[(i, 11)] = l * l * l;
            m[(i, 12)] = l * p * p;
            m[(i, 13)] = l * h * h;
            m[(i, 14)] = l * l * p;
            m[(i, 15)] = p * p * p;
            m[(i, 16)] = p * h * h;
            m[(i, 17)] = l * l * h;
            m[(i, 18)] = p * p * h;
            m[(i, 19)] = h * h * h;
        }
        m
    }

    /// Calculate `v = T(u)`: WGS84 (lon, lat, alt) points to image pixels.
    pub fn forward(&self, u: &[Vector3<f64>]) -> Vec<Vector2<f64>> {
        let m = self.get_poly_matrix(u);
        let mut v = Vec::with_capacity(u.len());
        for i in 0..u.len() {
            let row = m.row(i);
            let dot = |coeff: &[f64; 20]| -> f64 {
                row.iter().zip(coeff.iter()).map(|(a, b)| a * b).sum()
            };
            let c = dot(&self.samp_num_coeff) / dot(&self.samp_den_coeff);
            let r = dot(&self.line_num_coeff) / dot(&self.line_den_coeff);
            v.push(Vector2::new(
                self.fixed.samp_off + c * self.fixed.samp_scale,
                self.fixed.line_off + r * self.fixed.line_scale,
            ));
        }
        v
    }

    /// Least-squares fit of the 78 coefficients so that `forward(u)`
    /// reproduces `v`.
    pub fn fit(v: &[Vector2<f64>], u: &[Vector3<f64>], fixed: RpcFixedParams) -> Self {
        let mut y = DVector::zeros(v.len() * 2);
        for (i, pt) in v.iter().enumerate() {
            y[2 * i] = pt.x;
            y[2 * i + 1] = pt.y;
        }
        let params = optimize(
            &y,
            |params| {
                let t = Self::from_coefficients(&RpcCoefficients::from_vector(params), fixed);
                let vp = t.forward(u);
                let mut out = DVector::zeros(vp.len() * 2);
                for (i, pt) in vp.iter().enumerate() {
                    out[2 * i] = pt.x;
                    out[2 * i + 1] = pt.y;
                }
                out
            },
            DVector::zeros(78),
        );
        Self::from_coefficients(&RpcCoefficients::from_vector(&params), fixed)
    }

    /// Key/value pairs of the standard `RPC` metadata domain, sorted by key.
    pub fn metadata_entries(&self) -> Vec<(String, String)> {
        let mut entries = vec![
            ("HEIGHT_OFF".to_string(), format_value(self.fixed.height_off)),
            (
                "HEIGHT_SCALE".to_string(),
                format_value(self.fixed.height_scale),
            ),
            ("LAT_OFF".to_string(), format_value(self.fixed.lat_off)),
            ("LAT_SCALE".to_string(), format_value(self.fixed.lat_scale)),
            (
                "LINE_DEN_COEFF".to_string(),
                space_separated(&self.line_den_coeff),
            ),
            (
                "LINE_NUM_COEFF".to_string(),
                space_separated(&self.line_num_coeff),
            ),
            ("LINE_OFF".to_string(), format_value(self.fixed.line_off)),
            ("LINE_SCALE".to_string(), format_value(self.fixed.line_scale)),
            ("LONG_OFF".to_string(), format_value(self.fixed.lon_off)),
            ("LONG_SCALE".to_string(), format_value(self.fixed.lon_scale)),
            (
                "SAMP_DEN_COEFF".to_string(),
                space_separated(&self.samp_den_coeff),
            ),
            (
                "SAMP_NUM_COEFF".to_string(),
                space_separated(&self.samp_num_coeff),
            ),
            ("SAMP_OFF".to_string(), format_value(self.fixed.samp_off)),
            ("SAMP_SCALE".to_string(), format_value(self.fixed.samp_scale)),
        ];
        entries.sort();
        entries
    }

    /// Render the `<Metadata domain="RPC">` block for embedding in a VRT.
    pub fn vrt_metadata(&self) -> String {
        let mut out = String::from("  <Metadata domain=\"RPC\">\n");
        for (key, val) in self.metadata_entries() {
            out.push_str(&format!("    <MDI key=\"{key}\">{val}</MDI>\n"));
        }
        out.push_str("  </Metadata>\n");
        out
    }
}

// Integer-valued floats keep a trailing `.0` so the rendered block matches
// what GDAL tooling conventionally sees for RPC metadata.
fn format_value(x: f64) -> String {
    if x.is_finite() && x == x.trunc() {
        format!("{x:.1}")
    } else {
        format!("{x}")
    }
}

fn space_separated(xs: &[f64]) -> String {
    xs.iter()
        .map(|x| format_value(*x))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Signed distance in pixels from a point to the nearest image edge;
/// positive inside the image, negative outside.
pub fn pix_in_image(v: &Vector2<f64>, image_width: f64, image_height: f64) -> f64 {
    v.x.min(image_width - v.x)
        .min(v.y)
        .min(image_height - v.y)
}

/// Find the point in `[a, b]` where `f` crosses zero by bisection. Returns
/// the default when both endpoints are positive (the whole interval lies
/// inside the footprint) or when the interval does not bracket a root.
pub fn find_root_or_default<F: Fn(f64) -> f64>(f: F, a: f64, b: f64, dflt: f64) -> f64 {
    let fa = f(a);
    let fb = f(b);
    if fa > 0.0 && fb > 0.0 {
        return dflt;
    }
    if fa <= 0.0 && fb <= 0.0 {
        warn!("no footprint edge bracketed in [{a}, {b}], using default {dflt}");
        return dflt;
    }
    let (mut lo, mut hi) = (a, b);
    let mut flo = fa;
    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        if (hi - lo).abs() <= 1e-7 * (1.0 + mid.abs()) {
            break;
        }
        let fmid = f(mid);
        if fmid == 0.0 {
            return mid;
        }
        if (fmid > 0.0) == (flo > 0.0) {
            lo = mid;
            flo = fmid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Return an approximate geographic bounding box `[lon_min, lat_min,
/// lon_max, lat_max]` for the image footprint, found by scanning outward
/// from the center point along each axis for the edge of the image, then
/// expanded by the margin fraction.
pub fn get_approx_image_footprint_bounding_box(
    projection: &ForwardProjection,
    image_width: f64,
    image_height: f64,
    clon: f64,
    clat: f64,
    max_distance_degrees: f64,
    margin: f64,
) -> [f64; 4] {
    let pix_at = |lon: f64, lat: f64| -> f64 {
        match projection(&Vector3::new(lon, lat, 0.0)) {
            Some(v) => pix_in_image(&v, image_width, image_height),
            None => f64::NEG_INFINITY,
        }
    };
    let lon_in_footprint = |lon: f64| pix_at(lon, clat);
    let lat_in_footprint = |lat: f64| pix_at(clon, lat);

    let lon_min = find_root_or_default(
        lon_in_footprint,
        clon - max_distance_degrees,
        clon,
        clon - max_distance_degrees,
    );
    let lon_max = find_root_or_default(
        lon_in_footprint,
        clon,
        clon + max_distance_degrees,
        clon + max_distance_degrees,
    );
    let lat_min = find_root_or_default(
        lat_in_footprint,
        clat - max_distance_degrees,
        clat,
        clat - max_distance_degrees,
    );
    let lat_max = find_root_or_default(
        lat_in_footprint,
        clat,
        clat + max_distance_degrees,
        clat + max_distance_degrees,
    );

    [
        clon + (lon_min - clon) * (1.0 + margin),
        clat + (lat_min - clat) * (1.0 + margin),
        clon + (lon_max - clon) * (1.0 + margin),
        clat + (lat_max - clat) * (1.0 + margin),
    ]
}

/// Generate up to `num_samples` points `(x, y, 0)` inside the bbox
/// `[xmin, ymin, xmax, ymax]` where `is_valid` holds.
///
/// The points are distributed through the bbox as a "subrandom sequence":
/// like random points, but more evenly spread. See
/// <https://en.wikipedia.org/wiki/Low-discrepancy_sequence#Additive_recurrence>.
pub fn get_sub_random_samples<F>(bbox: [f64; 4], num_samples: usize, is_valid: F) -> Vec<Vector3<f64>>
where
    F: Fn(&Vector3<f64>) -> bool,
{
    let [xmin, ymin, xmax, ymax] = bbox;
    let xscale = xmax - xmin;
    let yscale = ymax - ymin;

    // fairly arbitrary constants. shouldn't be too close to small whole
    // number ratios.
    let dx = (5.0_f64.sqrt() - 1.0) / 2.0;
    let dy = 2.0_f64.sqrt() - 1.0;

    let mut result = Vec::with_capacity(num_samples);
    let max_attempts = num_samples.saturating_mul(1000);
    let mut i = 0usize;
    while result.len() < num_samples && i < max_attempts {
        let x0 = (dx * i as f64).fract();
        let y0 = (dy * i as f64).fract();
        let u = Vector3::new(xmin + x0 * xscale, ymin + y0 * yscale, 0.0);
        if is_valid(&u) {
            result.push(u);
        }
        i += 1;
    }
    result
}

/// Fit an RPC model approximating the forward projection over the image
/// footprint.
///
/// `projection` maps WGS84 (lon, lat, alt) to image pixels; `clon`/`clat`
/// is the approximate geographic center of the image; the fit is limited to
/// a box of `max_distance_degrees` around the center.
pub fn fit_rpc_to_model(
    projection: &ForwardProjection,
    image_width: f64,
    image_height: f64,
    clon: f64,
    clat: f64,
    max_distance_degrees: f64,
) -> Result<RpcTransform, RpcError> {
    let bbox = get_approx_image_footprint_bounding_box(
        projection,
        image_width,
        image_height,
        clon,
        clat,
        max_distance_degrees,
        FOOTPRINT_MARGIN,
    );
    info!("footprint bbox: {bbox:?}");

    let geo_in_image_footprint = |u: &Vector3<f64>| -> bool {
        match projection(u) {
            Some(v) => pix_in_image(&v, image_width, image_height) > 0.0,
            None => false,
        }
    };
    let u = get_sub_random_samples(bbox, NUM_FIT_SAMPLES, geo_in_image_footprint);
    if u.len() < NUM_FIT_SAMPLES {
        return Err(RpcError::SamplingExhausted {
            wanted: NUM_FIT_SAMPLES,
            got: u.len(),
        });
    }
    // The validity check already required a defined projection at each
    // sample, so this drops nothing in practice.
    let (u, v): (Vec<Vector3<f64>>, Vec<Vector2<f64>>) = u
        .iter()
        .filter_map(|pt| projection(pt).map(|px| (*pt, px)))
        .unzip();

    let fixed = RpcFixedParams::from_image_and_bbox(image_width, image_height, clon, clat, bbox);
    let rpc = RpcTransform::fit(&v, &u, fixed);

    let vp = rpc.forward(&u);
    let mut err_sq = 0.0;
    for (a, b) in vp.iter().zip(&v) {
        err_sq += (a - b).norm_squared();
    }
    let rms = (err_sq.sqrt() / u.len() as f64).sqrt();
    debug!("rms: {rms} pixels");

    Ok(rpc)
}

/// Adapt a fitted tie-point transform into the forward projection shape the
/// RPC fit consumes: WGS84 (lon, lat, alt) to source image pixels.
pub fn projection_from_transform(
    tform: &AnyTransform,
) -> impl Fn(&Vector3<f64>) -> Option<Vector2<f64>> + '_ {
    move |u: &Vector3<f64>| {
        let (mx, my) = lon_lat_to_meters(u.x, u.y);
        tform.reverse(&Vector2::new(mx, my))
    }
}

/// Approximate geographic center of the image under a fitted transform:
/// the center pixel mapped forward to (lon, lat).
pub fn center_lon_lat<T: Transform>(tform: &T, image_width: f64, image_height: f64) -> Option<(f64, f64)> {
    let center = Vector2::new(image_width / 2.0, image_height / 2.0);
    let meters = tform.forward(&center)?;
    Some(crate::geometry::meters_to_lat_lon(meters.x, meters.y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn smooth_projection(image_width: f64, image_height: f64, clon: f64, clat: f64) -> impl Fn(&Vector3<f64>) -> Option<Vector2<f64>> {
        // A gently curved, well-behaved projection centered on (clon, clat).
        move |u: &Vector3<f64>| {
            let dx = u.x - clon;
            let dy = u.y - clat;
            Some(Vector2::new(
                image_width / 2.0 + 80.0 * dx + 2.0 * dx * dy,
                image_height / 2.0 - 80.0 * dy + 1.5 * dx * dx,
            ))
        }
    }

    #[test]
    fn test_poly_matrix_basis_layout() {
        let fixed = RpcFixedParams {
            samp_off: 0.0,
            line_off: 0.0,
            lon_off: 0.0,
            lat_off: 0.0,
            height_off: 0.0,
            samp_scale: 1.0,
            line_scale: 1.0,
            lon_scale: 1.0,
            lat_scale: 1.0,
            height_scale: 1.0,
        };
        let rpc = RpcTransform::from_coefficients(&RpcCoefficients::zeros(), fixed);
        let (l, p, h) = (2.0, 3.0, 5.0);
        let m = rpc.get_poly_matrix(&[Vector3::new(l, p, h)]);
        let expected = [
            1.0,
            l,
            p,
            h,
            l * p,
            l * h,
            p * h,
            l * l,
            p * p,
            h * h,
            p * l * h,
            l * l * l,
            l * p * p,
            l * h * h,
            l * l * p,
            p * p * p,
            p * h * h,
            l * l * h,
            p * p * h,
            h * h * h,
        ];
        for (c, want) in expected.iter().enumerate() {
            assert_relative_eq!(m[(0, c)], *want, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_denominator_leading_one_is_fixed() {
        let mut coefficients = RpcCoefficients::zeros();
        coefficients.samp_den[0] = 0.5;
        let fixed =
            RpcFixedParams::from_image_and_bbox(100.0, 100.0, 0.0, 0.0, [-1.0, -1.0, 1.0, 1.0]);
        let rpc = RpcTransform::from_coefficients(&coefficients, fixed);
        assert_relative_eq!(rpc.samp_den_coeff[0], 1.0);
        assert_relative_eq!(rpc.samp_den_coeff[1], 0.5);
        assert_relative_eq!(rpc.line_den_coeff[0], 1.0);
    }

    #[test]
    fn test_pix_in_image_signed_distance() {
        assert_relative_eq!(pix_in_image(&Vector2::new(50.0, 50.0), 100.0, 100.0), 50.0);
        assert_relative_eq!(pix_in_image(&Vector2::new(10.0, 50.0), 100.0, 100.0), 10.0);
        assert!(pix_in_image(&Vector2::new(-5.0, 50.0), 100.0, 100.0) < 0.0);
        assert!(pix_in_image(&Vector2::new(50.0, 120.0), 100.0, 100.0) < 0.0);
    }

    #[test]
    fn test_find_root_or_default() {
        // Root of f(x) = 4 - x in [0, 10].
        let root = find_root_or_default(|x| 4.0 - x, 0.0, 10.0, -1.0);
        assert_relative_eq!(root, 4.0, epsilon = 1e-5);
        // Whole interval positive: default.
        assert_relative_eq!(find_root_or_default(|_| 1.0, 0.0, 10.0, -1.0), -1.0);
        // No bracketing: default.
        assert_relative_eq!(find_root_or_default(|_| -1.0, 0.0, 10.0, 7.0), 7.0);
    }

    #[test]
    fn test_sub_random_samples_spread_and_validity() {
        let bbox = [-2.0, 10.0, 4.0, 16.0];
        let samples = get_sub_random_samples(bbox, 200, |u| u.x < 3.0);
        assert_eq!(samples.len(), 200);
        for u in &samples {
            assert!(u.x >= -2.0 && u.x < 3.0);
            assert!(u.y >= 10.0 && u.y <= 16.0);
            assert_relative_eq!(u.z, 0.0);
        }
        // Low-discrepancy coverage: both halves of the accepted x range get
        // a reasonable share of points.
        let left = samples.iter().filter(|u| u.x < 0.5).count();
        assert!(left > 60 && left < 140, "left half got {left} samples");
    }

    #[test]
    fn test_footprint_bounding_box_linear_projection() {
        let (w, h, clon, clat) = (800.0, 600.0, -95.0, 29.0);
        let projection = smooth_projection(w, h, clon, clat);
        let bbox = get_approx_image_footprint_bounding_box(
            &projection,
            w,
            h,
            clon,
            clat,
            MAX_DISTANCE_DEGREES,
            FOOTPRINT_MARGIN,
        );
        let [lon_min, lat_min, lon_max, lat_max] = bbox;
        // At 80 px/degree an 800x600 image spans +/-5 degrees of lon and
        // +/-3.75 degrees of lat; the 0.5 margin grows each half-extent
        // by 1.5x.
        assert!(lon_min < clon && clon < lon_max);
        assert!(lat_min < clat && clat < lat_max);
        assert_relative_eq!(lon_max - clon, 5.0 * 1.5, epsilon = 0.2);
        assert_relative_eq!(clat - lat_min, 3.75 * 1.5, epsilon = 0.2);
    }

    #[test]
    fn test_fit_rpc_round_trip_rms() {
        let (w, h, clon, clat) = (800.0, 600.0, -95.0, 29.0);
        let projection = smooth_projection(w, h, clon, clat);
        let rpc = fit_rpc_to_model(&projection, w, h, clon, clat, MAX_DISTANCE_DEGREES).unwrap();

        // Compare against the reference projection over an independent grid
        // inside the footprint.
        let mut worst: f64 = 0.0;
        for i in 0..10 {
            for j in 0..10 {
                let lon = clon - 2.0 + 4.0 * (i as f64) / 9.0;
                let lat = clat - 1.5 + 3.0 * (j as f64) / 9.0;
                let u = Vector3::new(lon, lat, 0.0);
                let truth = projection(&u).unwrap();
                if pix_in_image(&truth, w, h) <= 0.0 {
                    continue;
                }
                let approx = rpc.forward(&[u])[0];
                worst = worst.max((approx - truth).norm());
            }
        }
        assert!(worst < 1.0, "worst pixel error {worst} too large");
    }

    #[test]
    fn test_vrt_metadata_block() {
        let fixed =
            RpcFixedParams::from_image_and_bbox(800.0, 600.0, -95.0, 29.0, [-97.0, 27.5, -93.0, 30.5]);
        let rpc = RpcTransform::from_coefficients(&RpcCoefficients::zeros(), fixed);
        let text = rpc.vrt_metadata();
        assert!(text.starts_with("  <Metadata domain=\"RPC\">\n"));
        assert!(text.ends_with("  </Metadata>\n"));
        assert!(text.contains("<MDI key=\"LONG_OFF\">-95.0</MDI>"));
        assert!(text.contains("<MDI key=\"HEIGHT_SCALE\">1000.0</MDI>"));
        // Coefficient lists are space-separated 20-term strings.
        let line = text
            .lines()
            .find(|l| l.contains("SAMP_DEN_COEFF"))
            .unwrap();
        let payload = line
            .split('>')
            .nth(1)
            .unwrap()
            .split('<')
            .next()
            .unwrap();
        assert_eq!(payload.split(' ').count(), 20);
        assert!(payload.starts_with("1.0 "));
        // Keys arrive sorted.
        let keys: Vec<_> = rpc
            .metadata_entries()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
