//! Simple pinhole camera model mapping between image pixel coordinates and
//! projected Mercator meters via a spherical Earth.

use super::{fit_params, Transform, TransformError};
use crate::geometry::{
    ecef_to_lon_lat_alt, eul_from_rot, lon_lat_alt_to_ecef, lon_lat_to_meters, meters_to_lat_lon,
    nadir_rotation, ray_sphere_intersection, rot_from_eul, EARTH_RADIUS_METERS,
};
use nalgebra::{DVector, Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Camera intrinsics and frame size that are fixed during fitting. These
/// come from external image metadata, not from the tie points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraFixedParams {
    pub width: f64,
    pub height: f64,
    /// Focal length in pixels along the image x axis.
    pub fx: f64,
    /// Focal length in pixels along the image y axis.
    pub fy: f64,
}

/// Resolves the fixed camera parameters for an image id when a persisted
/// `CameraModelTransform` record is loaded.
pub trait CameraParamSource {
    fn lookup(&self, image_id: &str) -> Option<CameraFixedParams>;
}

/// Spacecraft telemetry used to seed the camera fit: the sub-satellite
/// (nadir) point and altitude at exposure time, plus the fixed intrinsics.
#[derive(Debug, Clone)]
pub struct CameraTelemetry {
    pub image_id: String,
    pub nadir_lat: f64,
    pub nadir_lon: f64,
    /// Camera altitude above the spherical Earth surface, meters.
    pub altitude: f64,
    pub fixed: CameraFixedParams,
}

/// Pinhole camera transform with six fitted pose parameters
/// `[lat, lon, alt, roll, pitch, yaw]` and fixed intrinsics.
#[derive(Debug, Clone)]
pub struct CameraModelTransform {
    /// Fitted pose: latitude, longitude, altitude, roll, pitch, yaw.
    pub params: [f64; 6],
    pub fixed: CameraFixedParams,
    pub image_id: String,
}

impl CameraModelTransform {
    pub fn new(params: [f64; 6], fixed: CameraFixedParams, image_id: String) -> Self {
        Self {
            params,
            fixed,
            image_id,
        }
    }

    fn pose(&self) -> (Vector3<f64>, Matrix3<f64>) {
        let [lat, lon, alt, roll, pitch, yaw] = self.params;
        let position = lon_lat_alt_to_ecef(lon, lat, alt);
        let rotation = rot_from_eul(roll, pitch, yaw);
        (position, rotation)
    }

    /// Seed the fit from telemetry: camera at the nadir point, oriented
    /// straight down.
    fn init_params(telemetry: &CameraTelemetry) -> DVector<f64> {
        let cam_ecef = lon_lat_alt_to_ecef(
            telemetry.nadir_lon,
            telemetry.nadir_lat,
            telemetry.altitude,
        );
        let (roll, pitch, yaw) = eul_from_rot(&nadir_rotation(&cam_ecef));
        DVector::from_vec(vec![
            telemetry.nadir_lat,
            telemetry.nadir_lon,
            telemetry.altitude,
            roll,
            pitch,
            yaw,
        ])
    }

    pub fn fit(
        to_pts: &[Vector2<f64>],
        from_pts: &[Vector2<f64>],
        telemetry: &CameraTelemetry,
    ) -> Result<Self, TransformError> {
        if to_pts.len() < 3 || to_pts.len() != from_pts.len() {
            return Err(TransformError::NotEnoughTiePoints);
        }
        let params0 = Self::init_params(telemetry);
        Ok(fit_params(to_pts, from_pts, params0, |p| {
            Self::new(
                [p[0], p[1], p[2], p[3], p[4], p[5]],
                telemetry.fixed,
                telemetry.image_id.clone(),
            )
        }))
    }
}

impl Transform for CameraModelTransform {
    /// Pixel coordinates to Mercator meters: cast the pixel's viewing ray
    /// from the camera pose and intersect it with the spherical Earth.
    /// Returns `None` when the ray misses the Earth.
    fn forward(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        let (position, rotation) = self.pose();
        let optical_center = (
            (self.fixed.width / 2.0).trunc(),
            (self.fixed.height / 2.0).trunc(),
        );
        let dir_camera = Vector3::new(
            (pt.x - optical_center.0) / self.fixed.fx,
            (pt.y - optical_center.1) / self.fixed.fy,
            1.0,
        );
        let dir_ecef = rotation * dir_camera;
        let ground = ray_sphere_intersection(&position, &dir_ecef, EARTH_RADIUS_METERS)?;
        let (lon, lat, _alt) = ecef_to_lon_lat_alt(&ground);
        let (mx, my) = lon_lat_to_meters(lon, lat);
        Some(Vector2::new(mx, my))
    }

    /// Mercator meters to pixel coordinates via the standard projection
    /// matrix `K [R^T | -R^T c]`. Best-effort: ill-posed camera geometry
    /// can place the point behind the camera, in which case this returns
    /// `None`.
    fn reverse(&self, pt: &Vector2<f64>) -> Option<Vector2<f64>> {
        let (lon, lat) = meters_to_lat_lon(pt.x, pt.y);
        let ground = lon_lat_alt_to_ecef(lon, lat, 0.0);

        let camera_matrix = Matrix3::new(
            self.fixed.fx,
            0.0,
            self.fixed.width / 2.0,
            0.0,
            self.fixed.fy,
            self.fixed.height / 2.0,
            0.0,
            0.0,
            1.0,
        );
        let (position, rotation) = self.pose();
        let rotation = rotation.transpose();
        let translation = -rotation * position;

        let in_camera = rotation * ground + translation;
        let v = camera_matrix * in_camera;
        if v.z <= 0.0 {
            return None;
        }
        let result = Vector2::new(v.x / v.z, v.y / v.z);
        if result.x.is_finite() && result.y.is_finite() {
            Some(result)
        } else {
            None
        }
    }
}
