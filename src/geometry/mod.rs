//! Shared geodesy and Web Mercator math.
//!
//! Coordinate conventions:
//! - geographic coordinates are `(lon, lat)` in degrees, altitude in meters;
//! - projected coordinates are spherical-Mercator meters, the web-map
//!   coordinate system;
//! - tile-pixel coordinates have the origin at the top-left of the world,
//!   y increasing downward.
//!
//! ECEF conversions use a spherical Earth model, which is what the camera
//! registration math expects; do not mix these with WGS84-ellipsoid ECEF.

use nalgebra::{Matrix3, Vector3};

/// Meters per 180 degrees of longitude at the equator (half the Mercator
/// circumference).
pub const ORIGIN_SHIFT: f64 = 2.0 * std::f64::consts::PI * (6378137.0 / 2.0);
pub const METERS_PER_DEGREE_LON: f64 = ORIGIN_SHIFT / 180.0;
pub const DEGREES_LON_PER_METER: f64 = 180.0 / ORIGIN_SHIFT;
pub const TILE_SIZE: f64 = 256.0;
/// Meters per tile pixel at zoom 0.
pub const INITIAL_RESOLUTION: f64 = 2.0 * std::f64::consts::PI * 6378137.0 / TILE_SIZE;

/// Spherical-Earth radius used by the camera registration math.
pub const EARTH_RADIUS_METERS: f64 = 6371010.0;

/// Geographic (lon, lat) in degrees to projected Mercator meters.
pub fn lon_lat_to_meters(lon: f64, lat: f64) -> (f64, f64) {
    let mx = lon * METERS_PER_DEGREE_LON;
    let my = ((90.0 + lat) * std::f64::consts::PI / 360.0).tan().ln()
        / (std::f64::consts::PI / 180.0)
        * METERS_PER_DEGREE_LON;
    (mx, my)
}

/// Projected Mercator meters to geographic (lon, lat) in degrees.
pub fn meters_to_lat_lon(x: f64, y: f64) -> (f64, f64) {
    let lon = x * DEGREES_LON_PER_METER;
    let lat = y * DEGREES_LON_PER_METER;
    let lat = ((lat * (std::f64::consts::PI / 180.0)).exp().atan() * 360.0)
        / std::f64::consts::PI
        - 90.0;
    (lon, lat)
}

/// Meters per tile pixel at the given zoom level.
pub fn resolution(zoom: u32) -> f64 {
    INITIAL_RESOLUTION / 2f64.powi(zoom as i32)
}

/// Global tile-pixel coordinate to projected Mercator meters.
pub fn pixels_to_meters(px: f64, py: f64, zoom: u32) -> (f64, f64) {
    let res = resolution(zoom);
    let mx = px * res - ORIGIN_SHIFT;
    let my = -(py * res) + ORIGIN_SHIFT;
    (mx, my)
}

/// Projected Mercator meters to global tile-pixel coordinate.
pub fn meters_to_pixels(mx: f64, my: f64, zoom: u32) -> (f64, f64) {
    let res = resolution(zoom);
    let px = (mx + ORIGIN_SHIFT) / res;
    let py = (-my + ORIGIN_SHIFT) / res;
    (px, py)
}

/// (lon, lat, alt) in degrees/meters to spherical ECEF.
pub fn lon_lat_alt_to_ecef(lon: f64, lat: f64, alt: f64) -> Vector3<f64> {
    let r = EARTH_RADIUS_METERS + alt;
    let (lon, lat) = (lon.to_radians(), lat.to_radians());
    Vector3::new(
        r * lat.cos() * lon.cos(),
        r * lat.cos() * lon.sin(),
        r * lat.sin(),
    )
}

/// Spherical ECEF to (lon, lat, alt) in degrees/meters.
pub fn ecef_to_lon_lat_alt(p: &Vector3<f64>) -> (f64, f64, f64) {
    let r = p.norm();
    let lat = (p.z / r).asin().to_degrees();
    let lon = p.y.atan2(p.x).to_degrees();
    (lon, lat, r - EARTH_RADIUS_METERS)
}

/// Rotation matrix from roll/pitch/yaw Euler angles (radians), composed as
/// `Rz(yaw) * Ry(pitch) * Rx(roll)`.
pub fn rot_from_eul(roll: f64, pitch: f64, yaw: f64) -> Matrix3<f64> {
    let (sr, cr) = roll.sin_cos();
    let (sp, cp) = pitch.sin_cos();
    let (sy, cy) = yaw.sin_cos();
    Matrix3::new(
        cy * cp,
        cy * sp * sr - sy * cr,
        cy * sp * cr + sy * sr,
        sy * cp,
        sy * sp * sr + cy * cr,
        sy * sp * cr - cy * sr,
        -sp,
        cp * sr,
        cp * cr,
    )
}

/// Recover roll/pitch/yaw (radians) from a rotation matrix built by
/// [`rot_from_eul`]. Assumes pitch away from the gimbal-lock poles.
pub fn eul_from_rot(m: &Matrix3<f64>) -> (f64, f64, f64) {
    let pitch = (-m[(2, 0)]).asin();
    let roll = m[(2, 1)].atan2(m[(2, 2)]);
    let yaw = m[(1, 0)].atan2(m[(0, 0)]);
    (roll, pitch, yaw)
}

/// Camera-to-ECEF rotation for a nadir-pointing camera at the given ECEF
/// position: camera x points east, camera y south, camera z straight down.
///
/// This is the orientation seed used before fitting camera pose parameters.
pub fn nadir_rotation(ecef_pos: &Vector3<f64>) -> Matrix3<f64> {
    let up = ecef_pos.normalize();
    let pole = Vector3::new(0.0, 0.0, 1.0);
    let east = pole.cross(&up).normalize();
    let north = up.cross(&east);
    Matrix3::from_columns(&[east, -north, -up])
}

/// First intersection of the ray `origin + t * dir` (t >= 0) with the sphere
/// of the given radius centered at the origin. `dir` need not be normalized.
pub fn ray_sphere_intersection(
    origin: &Vector3<f64>,
    dir: &Vector3<f64>,
    radius: f64,
) -> Option<Vector3<f64>> {
    let d = dir.normalize();
    let b = origin.dot(&d);
    let c = origin.dot(origin) - radius * radius;
    let discriminant = b * b - c;
    if discriminant < 0.0 {
        return None;
    }
    let sqrt_disc = discriminant.sqrt();
    let t = -b - sqrt_disc;
    let t = if t >= 0.0 { t } else { -b + sqrt_disc };
    if t < 0.0 {
        return None;
    }
    Some(origin + d * t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_lon_lat_meters_round_trip() {
        let (mx, my) = lon_lat_to_meters(-122.4, 37.8);
        let (lon, lat) = meters_to_lat_lon(mx, my);
        assert_relative_eq!(lon, -122.4, epsilon = 1e-9);
        assert_relative_eq!(lat, 37.8, epsilon = 1e-9);
    }

    #[test]
    fn test_equator_meters() {
        let (mx, my) = lon_lat_to_meters(180.0, 0.0);
        assert_relative_eq!(mx, ORIGIN_SHIFT, epsilon = 1e-6);
        assert_relative_eq!(my, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_resolution_halves_per_zoom_and_takes_any_zoom() {
        assert_relative_eq!(resolution(1), INITIAL_RESOLUTION / 2.0, epsilon = 1e-9);
        assert_relative_eq!(resolution(5), resolution(4) / 2.0, epsilon = 1e-9);
        // Extreme zooms stay finite rather than overflowing.
        let tiny = resolution(80);
        assert!(tiny > 0.0 && tiny.is_finite());
    }

    #[test]
    fn test_pixels_meters_round_trip() {
        for zoom in [0u32, 3, 10, 18] {
            let px = 137.25;
            let py = 99.5;
            let (mx, my) = pixels_to_meters(px, py, zoom);
            let (px2, py2) = meters_to_pixels(mx, my, zoom);
            assert_relative_eq!(px2, px, epsilon = 1e-6);
            assert_relative_eq!(py2, py, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_zoom_zero_is_one_tile() {
        // The whole world spans exactly one tile at zoom 0.
        let (px, py) = meters_to_pixels(ORIGIN_SHIFT, -ORIGIN_SHIFT, 0);
        assert_relative_eq!(px, TILE_SIZE, epsilon = 1e-6);
        assert_relative_eq!(py, TILE_SIZE, epsilon = 1e-6);
    }

    #[test]
    fn test_ecef_round_trip() {
        let p = lon_lat_alt_to_ecef(90.0, 0.0, 500.0);
        assert_relative_eq!(p.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, EARTH_RADIUS_METERS + 500.0, epsilon = 1e-6);
        assert_relative_eq!(p.z, 0.0, epsilon = 1e-6);

        let (lon, lat, alt) = ecef_to_lon_lat_alt(&p);
        assert_relative_eq!(lon, 90.0, epsilon = 1e-9);
        assert_relative_eq!(lat, 0.0, epsilon = 1e-9);
        assert_relative_eq!(alt, 500.0, epsilon = 1e-6);
    }

    #[test]
    fn test_euler_round_trip() {
        let (roll, pitch, yaw) = (0.1, -0.25, 1.3);
        let m = rot_from_eul(roll, pitch, yaw);
        let (r2, p2, y2) = eul_from_rot(&m);
        assert_relative_eq!(r2, roll, epsilon = 1e-12);
        assert_relative_eq!(p2, pitch, epsilon = 1e-12);
        assert_relative_eq!(y2, yaw, epsilon = 1e-12);
    }

    #[test]
    fn test_nadir_rotation_points_down() {
        let pos = lon_lat_alt_to_ecef(45.0, 30.0, 400_000.0);
        let rot = nadir_rotation(&pos);
        // Camera z axis (third column) in ECEF must be the unit vector from
        // the camera toward the Earth's center.
        let z = rot.column(2);
        let down = -pos.normalize();
        assert_relative_eq!(z[0], down[0], epsilon = 1e-12);
        assert_relative_eq!(z[1], down[1], epsilon = 1e-12);
        assert_relative_eq!(z[2], down[2], epsilon = 1e-12);
        // Orthonormality.
        let m = rot.transpose() * rot;
        assert_relative_eq!(m[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(m[(0, 1)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_ray_sphere_intersection() {
        // Straight-down ray from 500 km above the equator.
        let origin = Vector3::new(EARTH_RADIUS_METERS + 500_000.0, 0.0, 0.0);
        let dir = Vector3::new(-1.0, 0.0, 0.0);
        let hit = ray_sphere_intersection(&origin, &dir, EARTH_RADIUS_METERS).unwrap();
        assert_relative_eq!(hit.x, EARTH_RADIUS_METERS, epsilon = 1e-6);

        // Ray pointing away never hits.
        let miss =
            ray_sphere_intersection(&origin, &Vector3::new(1.0, 0.0, 0.0), EARTH_RADIUS_METERS);
        assert!(miss.is_none());
    }
}
