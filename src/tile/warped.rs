//! Warped tiler: renders standard Mercator tiles of an aligned image by
//! inverse-mapping every output pixel through a fitted transform and
//! bilinearly sampling the source raster.

use super::{encode_png, tile_path, TileError, TileWriter, PNG_MIME_TYPE, TILE_SIZE};
use crate::geometry::{meters_to_pixels, pixels_to_meters, resolution, INITIAL_RESOLUTION};
use crate::settings::Settings;
use crate::transform::{AnyTransform, Transform};
use image::{Rgba, RgbaImage};
use log::debug;
use nalgebra::Vector2;

/// Axis-aligned footprint of the warped image in Mercator meters.
#[derive(Debug, Clone, Copy)]
struct MeterBounds {
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
}

pub struct WarpedQuadTreeGenerator {
    pub quad_tree_id: u64,
    image: RgbaImage,
    transform: AnyTransform,
    bounds: MeterBounds,
    zoom_offset: u32,
    max_zoom: u32,
}

impl WarpedQuadTreeGenerator {
    /// Build a generator for the raster under the given fitted transform.
    ///
    /// Fails with `UnboundedFootprint` when the transform cannot project
    /// the image corners, since then no meter-space bounding box exists.
    pub fn new(
        quad_tree_id: u64,
        image: RgbaImage,
        transform: AnyTransform,
        settings: &Settings,
    ) -> Result<Self, TileError> {
        let (w, h) = image.dimensions();
        let corners = [
            Vector2::new(0.0, 0.0),
            Vector2::new(w as f64, 0.0),
            Vector2::new(0.0, h as f64),
            Vector2::new(w as f64, h as f64),
        ];
        let mut bounds = MeterBounds {
            xmin: f64::INFINITY,
            ymin: f64::INFINITY,
            xmax: f64::NEG_INFINITY,
            ymax: f64::NEG_INFINITY,
        };
        for corner in &corners {
            let meters = transform
                .forward(corner)
                .ok_or(TileError::UnboundedFootprint)?;
            bounds.xmin = bounds.xmin.min(meters.x);
            bounds.ymin = bounds.ymin.min(meters.y);
            bounds.xmax = bounds.xmax.max(meters.x);
            bounds.ymax = bounds.ymax.max(meters.y);
        }

        // Ground resolution of the source image in meters per pixel; the
        // finer axis decides how deep the pyramid usefully goes.
        let mpp = ((bounds.xmax - bounds.xmin) / w as f64)
            .min((bounds.ymax - bounds.ymin) / h as f64);
        let native_zoom = (INITIAL_RESOLUTION / mpp).log2().ceil().max(0.0) as u32;
        // Very coarse sources still get a pyramid down to the offset level.
        let max_zoom = (native_zoom + settings.zoom_levels_past_overlay_resolution)
            .max(settings.zoom_offset);
        debug!(
            "quadtree {quad_tree_id}: footprint {bounds:?}, native zoom {native_zoom}, max zoom {max_zoom}"
        );

        Ok(Self {
            quad_tree_id,
            image,
            transform,
            bounds,
            zoom_offset: settings.zoom_offset,
            max_zoom,
        })
    }

    pub fn max_zoom(&self) -> u32 {
        self.max_zoom
    }

    pub fn get_tile_data(
        &self,
        zoom: u32,
        x: u32,
        y: u32,
    ) -> Result<(Vec<u8>, &'static str), TileError> {
        if zoom > self.max_zoom {
            return Err(TileError::ZoomTooBig {
                zoom,
                max_zoom: self.max_zoom,
            });
        }

        // Tile extent in meters; pixel y grows downward so the tile's top
        // edge has the larger projected y.
        let (tile_xmin, tile_ymax) =
            pixels_to_meters((x * TILE_SIZE) as f64, (y * TILE_SIZE) as f64, zoom);
        let (tile_xmax, tile_ymin) = pixels_to_meters(
            ((x + 1) * TILE_SIZE) as f64,
            ((y + 1) * TILE_SIZE) as f64,
            zoom,
        );
        if tile_xmax <= self.bounds.xmin
            || tile_xmin >= self.bounds.xmax
            || tile_ymax <= self.bounds.ymin
            || tile_ymin >= self.bounds.ymax
        {
            return Err(TileError::OutOfBounds { zoom, x, y });
        }

        let res = resolution(zoom);
        let mut canvas = RgbaImage::from_pixel(TILE_SIZE, TILE_SIZE, Rgba([0, 0, 0, 0]));
        for py in 0..TILE_SIZE {
            let my = tile_ymax - (py as f64 + 0.5) * res;
            for px in 0..TILE_SIZE {
                let mx = tile_xmin + (px as f64 + 0.5) * res;
                if let Some(src) = self.transform.reverse(&Vector2::new(mx, my)) {
                    if let Some(pixel) = sample_bilinear(&self.image, src.x, src.y) {
                        canvas.put_pixel(px, py, pixel);
                    }
                }
            }
        }
        Ok((encode_png(&canvas)?, PNG_MIME_TYPE))
    }

    /// Render the pyramid over the footprint, from the configured zoom
    /// offset to the maximum useful zoom, as `zoom/x/y.png` under
    /// `path_prefix`.
    pub fn write_quad_tree(
        &self,
        writer: &mut dyn TileWriter,
        path_prefix: &str,
    ) -> Result<(), TileError> {
        for zoom in self.zoom_offset..=self.max_zoom {
            let (px0, py0) = meters_to_pixels(self.bounds.xmin, self.bounds.ymax, zoom);
            let (px1, py1) = meters_to_pixels(self.bounds.xmax, self.bounds.ymin, zoom);
            let tx0 = (px0 / TILE_SIZE as f64).floor().max(0.0) as u32;
            let ty0 = (py0 / TILE_SIZE as f64).floor().max(0.0) as u32;
            let tx1 = (px1 / TILE_SIZE as f64).ceil() as u32;
            let ty1 = (py1 / TILE_SIZE as f64).ceil() as u32;
            for ty in ty0..ty1.max(ty0 + 1) {
                for tx in tx0..tx1.max(tx0 + 1) {
                    match self.get_tile_data(zoom, tx, ty) {
                        Ok((data, _)) => {
                            writer.write_tile(&tile_path(path_prefix, zoom, tx as u64, ty as u64), &data)?
                        }
                        Err(TileError::OutOfBounds { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Bilinear RGBA sample at fractional pixel coordinates, `None` outside the
/// raster. Neighbors are clamped at the edges.
fn sample_bilinear(image: &RgbaImage, x: f64, y: f64) -> Option<Rgba<u8>> {
    let (w, h) = image.dimensions();
    if x < -0.5 || y < -0.5 || x > w as f64 - 0.5 || y > h as f64 - 0.5 {
        return None;
    }
    let fx = x.floor();
    let fy = y.floor();
    let tx = x - fx;
    let ty = y - fy;
    let clamp = |v: f64, max: u32| -> u32 { (v.max(0.0) as u32).min(max - 1) };
    let x0 = clamp(fx, w);
    let x1 = clamp(fx + 1.0, w);
    let y0 = clamp(fy, h);
    let y1 = clamp(fy + 1.0, h);

    let p00 = image.get_pixel(x0, y0).0;
    let p10 = image.get_pixel(x1, y0).0;
    let p01 = image.get_pixel(x0, y1).0;
    let p11 = image.get_pixel(x1, y1).0;

    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = p00[c] as f64 * (1.0 - tx) + p10[c] as f64 * tx;
        let bottom = p01[c] as f64 * (1.0 - tx) + p11[c] as f64 * tx;
        out[c] = (top * (1.0 - ty) + bottom * ty).round() as u8;
    }
    Some(Rgba(out))
}
