//! Quadtree map-tile generation.
//!
//! Two generators share one tile contract: ask for `(zoom, x, y)` and get
//! back encoded 256x256 PNG bytes. [`simple::SimpleQuadTreeGenerator`] crops
//! and downsamples a raw raster with no coordinate transform, for previewing
//! an unaligned image. [`warped::WarpedQuadTreeGenerator`] inverse-maps each
//! output pixel through a fitted transform, producing standard Mercator
//! tiles of the aligned image.
//!
//! Building a generator decodes and holds the full source raster, so serving
//! code keeps at most one instance alive per quadtree id via
//! [`GeneratorCache`].

pub mod simple;
pub mod warped;

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbaImage};
use log::debug;

/// Output tile edge length in pixels.
pub const TILE_SIZE: u32 = 256;

/// Default shift applied to zoom levels so that the tile scheme lines up
/// with typical source image resolutions (the zoom offset is the first
/// level at which a small image fits a single tile). Overridable via
/// [`crate::settings::Settings::zoom_offset`].
pub const ZOOM_OFFSET: u32 = 3;

pub const PNG_MIME_TYPE: &str = "image/png";

/// A 1x1 fully transparent RGBA PNG, served for tile requests that fall
/// outside the image footprint.
pub const TRANSPARENT_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, // signature
    0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52, // IHDR
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15,
    0xc4, 0x89, //
    0x00, 0x00, 0x00, 0x01, 0x73, 0x52, 0x47, 0x42, 0x00, 0xae, 0xce, 0x1c, 0xe9, // sRGB
    0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, // IDAT
    0x08, 0xd7, 0x63, 0x60, 0x60, 0x60, 0x60, 0x00, 0x00, 0x00, 0x05, 0x00, 0x01, 0x5e, 0xf3,
    0x2a, 0x3a, //
    0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82, // IEND
];

/// Canonical payload for an empty tile: transparent pixel plus mime type.
pub fn transparent_png_data() -> (Vec<u8>, &'static str) {
    (TRANSPARENT_PNG.to_vec(), PNG_MIME_TYPE)
}

#[derive(thiserror::Error, Debug)]
pub enum TileError {
    #[error("tile ({x}, {y}) at zoom {zoom} is outside the image footprint")]
    OutOfBounds { zoom: u32, x: u32, y: u32 },
    #[error("zoom {zoom} exceeds the maximum useful zoom {max_zoom}")]
    ZoomTooBig { zoom: u32, max_zoom: u32 },
    #[error("transform cannot project the image corners")]
    UnboundedFootprint,
    #[error("failed to encode tile: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to write tile: {0}")]
    Write(#[from] std::io::Error),
}

/// Receives the rendered pyramid from `write_quad_tree`. Implementations
/// write to disk, an archive, object storage, and so on.
pub trait TileWriter {
    fn write_tile(&mut self, path: &str, data: &[u8]) -> std::io::Result<()>;
}

/// Writes tiles under a root directory, creating `zoom/x` subdirectories as
/// needed.
pub struct DirectoryTileWriter {
    pub root: std::path::PathBuf,
}

impl TileWriter for DirectoryTileWriter {
    fn write_tile(&mut self, path: &str, data: &[u8]) -> std::io::Result<()> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(full, data)
    }
}

/// Join an optional path prefix with the canonical `zoom/x/y.png` layout.
pub(crate) fn tile_path(prefix: &str, zoom: u32, tx: u64, ty: u64) -> String {
    if prefix.is_empty() {
        format!("{zoom}/{tx}/{ty}.png")
    } else {
        format!("{prefix}/{zoom}/{tx}/{ty}.png")
    }
}

pub(crate) fn encode_png(img: &RgbaImage) -> Result<Vec<u8>, TileError> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf).write_image(
        img.as_raw(),
        img.width(),
        img.height(),
        ExtendedColorType::Rgba8,
    )?;
    Ok(buf)
}

/// Either flavor of tile generator, as stored in the cache.
pub enum QuadTreeGenerator {
    Simple(simple::SimpleQuadTreeGenerator),
    Warped(warped::WarpedQuadTreeGenerator),
}

impl QuadTreeGenerator {
    pub fn get_tile_data(&self, zoom: u32, x: u32, y: u32) -> Result<(Vec<u8>, &'static str), TileError> {
        match self {
            QuadTreeGenerator::Simple(g) => g.get_tile_data(zoom, x, y),
            QuadTreeGenerator::Warped(g) => g.get_tile_data(zoom, x, y),
        }
    }

    /// Tile-serving behavior: requests outside the footprint or beyond the
    /// useful zoom range get the canonical transparent tile instead of an
    /// error.
    pub fn get_tile_data_or_transparent(
        &self,
        zoom: u32,
        x: u32,
        y: u32,
    ) -> Result<(Vec<u8>, &'static str), TileError> {
        match self.get_tile_data(zoom, x, y) {
            Ok(data) => Ok(data),
            Err(TileError::OutOfBounds { .. }) | Err(TileError::ZoomTooBig { .. }) => {
                Ok(transparent_png_data())
            }
            Err(e) => Err(e),
        }
    }

    pub fn write_quad_tree(
        &self,
        writer: &mut dyn TileWriter,
        path_prefix: &str,
    ) -> Result<(), TileError> {
        match self {
            QuadTreeGenerator::Simple(g) => g.write_quad_tree(writer, path_prefix),
            QuadTreeGenerator::Warped(g) => g.write_quad_tree(writer, path_prefix),
        }
    }
}

/// Single-slot generator cache, keyed by quadtree id.
///
/// Generators hold the decoded source raster, so a worker keeps at most one
/// alive; consecutive tile requests for the same quadtree (the common
/// serving pattern) reuse it, and a request for a different quadtree evicts
/// it. Each worker owns its cache; nothing is shared across workers.
#[derive(Default)]
pub struct GeneratorCache {
    slot: Option<(u64, QuadTreeGenerator)>,
}

impl GeneratorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the generator for `quad_tree_id`, building it with `build` on
    /// a cache miss.
    pub fn get_or_build<F>(
        &mut self,
        quad_tree_id: u64,
        build: F,
    ) -> Result<&QuadTreeGenerator, TileError>
    where
        F: FnOnce() -> Result<QuadTreeGenerator, TileError>,
    {
        let hit = matches!(&self.slot, Some((id, _)) if *id == quad_tree_id);
        if hit {
            debug!("generator cache hit for quadtree {quad_tree_id}");
        } else {
            debug!("generator cache miss for quadtree {quad_tree_id}");
            let generator = build()?;
            self.slot = Some((quad_tree_id, generator));
        }
        match &self.slot {
            Some((_, generator)) => Ok(generator),
            None => unreachable!("slot filled above"),
        }
    }

    /// Drop any cached generator, e.g. after the underlying raster or
    /// transform changed.
    pub fn invalidate(&mut self) {
        self.slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use image::RgbaImage;

    fn solid_image(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, image::Rgba([10, 20, 30, 255]))
    }

    fn simple_generator(id: u64, image: RgbaImage) -> QuadTreeGenerator {
        QuadTreeGenerator::Simple(simple::SimpleQuadTreeGenerator::new(
            id,
            image,
            &Settings::default(),
        ))
    }

    #[test]
    fn test_transparent_png_is_decodable_1x1() {
        let img = image::load_from_memory(TRANSPARENT_PNG).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (1, 1));
        assert_eq!(img.get_pixel(0, 0).0[3], 0);
    }

    #[test]
    fn test_cache_hit_and_miss() {
        let mut cache = GeneratorCache::new();
        let mut builds = 0;
        for _ in 0..3 {
            cache
                .get_or_build(7, || {
                    builds += 1;
                    Ok(simple_generator(7, solid_image(512, 256)))
                })
                .unwrap();
        }
        assert_eq!(builds, 1);

        // A different id evicts the slot; the original id rebuilds after.
        let mut other_builds = 0;
        cache
            .get_or_build(8, || {
                other_builds += 1;
                Ok(simple_generator(8, solid_image(256, 256)))
            })
            .unwrap();
        assert_eq!(other_builds, 1);
        let mut rebuilds = 0;
        cache
            .get_or_build(7, || {
                rebuilds += 1;
                Ok(simple_generator(7, solid_image(512, 256)))
            })
            .unwrap();
        assert_eq!(rebuilds, 1);
    }

    #[test]
    fn test_invalidate_forces_rebuild() {
        let mut cache = GeneratorCache::new();
        let mut builds = 0;
        let mut build = |builds: &mut u32| {
            *builds += 1;
            Ok(simple_generator(1, solid_image(256, 256)))
        };
        cache.get_or_build(1, || build(&mut builds)).unwrap();
        cache.invalidate();
        cache.get_or_build(1, || build(&mut builds)).unwrap();
        assert_eq!(builds, 2);
    }

    #[test]
    fn test_out_of_range_requests_serve_transparent_tile() {
        let generator = simple_generator(1, solid_image(512, 512));
        let (data, mime) = generator.get_tile_data_or_transparent(30, 0, 0).unwrap();
        assert_eq!(mime, PNG_MIME_TYPE);
        assert_eq!(data, TRANSPARENT_PNG);
        let (data, _) = generator.get_tile_data_or_transparent(4, 1000, 1000).unwrap();
        assert_eq!(data, TRANSPARENT_PNG);
    }
}
