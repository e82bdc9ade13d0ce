//! Pass-through tiler over a plain raster: tiles are produced by cropping
//! and downsampling, with no coordinate transform. Used to preview an image
//! before any tie points exist.

use super::{encode_png, tile_path, TileError, TileWriter, PNG_MIME_TYPE, TILE_SIZE};
use crate::settings::Settings;
use image::imageops::{self, FilterType};
use image::RgbaImage;

/// Tiles a raw raster anchored at tile (0, 0): the whole image fits in one
/// tile at the configured zoom offset and gains a level of detail per zoom
/// step up to its native resolution.
pub struct SimpleQuadTreeGenerator {
    pub quad_tree_id: u64,
    image: RgbaImage,
    zoom_offset: u32,
    max_zoom: u32,
}

impl SimpleQuadTreeGenerator {
    pub fn new(quad_tree_id: u64, image: RgbaImage, settings: &Settings) -> Self {
        let (w, h) = image.dimensions();
        let long_side = w.max(h).max(1) as f64;
        let levels = (long_side / TILE_SIZE as f64).log2().ceil().max(0.0) as u32;
        Self {
            quad_tree_id,
            image,
            zoom_offset: settings.zoom_offset,
            max_zoom: settings.zoom_offset + levels,
        }
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
        // Source pixels covered by one output pixel at this zoom.
        let scale = 1u64 << (self.max_zoom - zoom);
        let tile_span = TILE_SIZE as u64 * scale;
        let (w, h) = self.image.dimensions();
        let x0 = x as u64 * tile_span;
        let y0 = y as u64 * tile_span;
        if x0 >= w as u64 || y0 >= h as u64 {
            return Err(TileError::OutOfBounds { zoom, x, y });
        }

        let crop_w = tile_span.min(w as u64 - x0) as u32;
        let crop_h = tile_span.min(h as u64 - y0) as u32;
        let cropped = imageops::crop_imm(&self.image, x0 as u32, y0 as u32, crop_w, crop_h)
            .to_image();

        let out_w = (crop_w as u64).div_ceil(scale) as u32;
        let out_h = (crop_h as u64).div_ceil(scale) as u32;
        let shrunk = if scale == 1 {
            cropped
        } else {
            imageops::resize(&cropped, out_w.max(1), out_h.max(1), FilterType::Triangle)
        };

        // Paste onto a transparent 256x256 canvas; edge tiles only partly
        // cover it.
        let mut canvas = RgbaImage::from_pixel(TILE_SIZE, TILE_SIZE, image::Rgba([0, 0, 0, 0]));
        imageops::overlay(&mut canvas, &shrunk, 0, 0);
        Ok((encode_png(&canvas)?, PNG_MIME_TYPE))
    }

    /// Render every tile touching the image, from the configured zoom
    /// offset up to native resolution, as `zoom/x/y.png` under
    /// `path_prefix`.
    pub fn write_quad_tree(
        &self,
        writer: &mut dyn TileWriter,
        path_prefix: &str,
    ) -> Result<(), TileError> {
        let (w, h) = self.image.dimensions();
        for zoom in self.zoom_offset..=self.max_zoom {
            let scale = 1u64 << (self.max_zoom - zoom);
            let tile_span = TILE_SIZE as u64 * scale;
            let tiles_x = (w as u64).div_ceil(tile_span);
            let tiles_y = (h as u64).div_ceil(tile_span);
            for ty in 0..tiles_y {
                for tx in 0..tiles_x {
                    let (data, _) = self.get_tile_data(zoom, tx as u32, ty as u32)?;
                    writer.write_tile(&tile_path(path_prefix, zoom, tx, ty), &data)?;
                }
            }
        }
        Ok(())
    }
}
