//! Image loading and caching core: a request cache keyed by URI and isolation attributes, shared
//! requests with per-consumer proxies, cache revalidation, and a decoded-surface cache fed by a
//! background decode pool.

#![deny(missing_debug_implementations)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod decode;
pub mod error;
pub mod image;
pub mod loader;
pub mod log;
pub mod stats;
pub mod surface;
pub mod types;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

pub use cache::{CacheEntry, CacheKey, IsolationAttributes, RequestCache};
pub use config::ImageCacheConfig;
pub use error::{DecodeError, ImageError, LoadError, ValidationError};
pub use crate::image::{DecodeFlags, DrawOutcome, FrameSelection, Image, ImgDrawResult};
pub use loader::{AppContext, ImageLoader, ImageObserver, LoadRequest, LoaderEnv, Notification};
pub use surface::{LookupResult, PlaybackType, SurfaceCache};
pub use types::{ImageId, ProxyId, Rect, RequestId, Size};

/// Returns the version of the core crate for telemetry and debugging.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
