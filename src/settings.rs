//! Runtime configuration for fitting and tiling, passed explicitly into the
//! entry points that need it.

use serde::{Deserialize, Serialize};

/// Geographic bounding box in degrees, used as the initial map view when an
/// overlay has no tie points yet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Default for Viewport {
    /// Continental United States.
    fn default() -> Self {
        Self {
            west: -130.0,
            south: 22.0,
            east: -59.0,
            north: 52.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Verbosity ceiling the embedding application should configure its
    /// logger with.
    pub log_level: log::LevelFilter,
    /// Shift applied to tile zoom levels so the tile scheme correlates with
    /// typical source image resolutions.
    pub zoom_offset: u32,
    /// How many zoom levels past the source ground resolution the warped
    /// tiler renders before reporting `ZoomTooBig`.
    pub zoom_levels_past_overlay_resolution: u32,
    pub default_viewport: Viewport,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: log::LevelFilter::Info,
            zoom_offset: crate::tile::ZOOM_OFFSET,
            zoom_levels_past_overlay_resolution: 3,
            default_viewport: Viewport::default(),
        }
    }
}
