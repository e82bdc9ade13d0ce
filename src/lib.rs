//! Georef Tools Library
//!
//! A Rust library for georeferencing raster images from tie points.
//! Given pairs of (image pixel, projected map coordinate) correspondences
//! it provides:
//! - A family of fittable 2D coordinate transforms: translate,
//!   rotate-scale-translate, affine, projective, quadratic variants, and a
//!   pinhole camera model over a spherical Earth
//! - A from-scratch Levenberg-Marquardt nonlinear least-squares optimizer
//!   used by the transform and RPC fits
//! - RPC (rational polynomial coefficient) surrogate model fitting for
//!   export to standard geospatial raster tooling
//! - Web-Mercator quadtree tile generation, both pass-through and warped
//!   through a fitted transform

pub mod geometry;
pub mod optimize;
pub mod rpc;
pub mod settings;
pub mod tile;
pub mod transform;

// Re-export commonly used types
pub use optimize::{lm, lm_with, optimize, LmOptions, LmStatus};

pub use rpc::{fit_rpc_to_model, RpcError, RpcFixedParams, RpcTransform};

pub use settings::{Settings, Viewport};

pub use tile::{
    simple::SimpleQuadTreeGenerator, warped::WarpedQuadTreeGenerator, GeneratorCache,
    QuadTreeGenerator, TileError, TileWriter,
};

pub use transform::{
    get_transform, get_transform_class, make_transform, split_points, AffineTransform,
    AnyTransform, CameraFixedParams, CameraModelTransform, ProjectiveTransform,
    QuadraticTransform, QuadraticTransform2, RotateScaleTranslateTransform, Transform,
    TransformError, TransformKind, TranslateTransform,
};
