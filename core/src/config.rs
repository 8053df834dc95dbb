//! Tunables for the request cache, the surface cache and the decode pool.
//!
//! Every section is `#[serde(default)]`, so a configuration file only needs to name the values it
//! overrides.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, ensure};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration consumed by [`crate::loader::AppContext`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCacheConfig {
    pub cache: RequestCacheConfig,
    pub surfaces: SurfaceCacheConfig,
    pub decode: DecodePoolConfig,
}

impl ImageCacheConfig {
    /// Parse a JSON document, filling unspecified values with defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("parsing image cache config")?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("loading {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.cache.time_weight),
            "cache.time_weight must be within [0, 1], got {}",
            self.cache.time_weight
        );
        ensure!(self.cache.generations > 0, "cache.generations must be at least 1");
        ensure!(self.cache.generation_secs > 0, "cache.generation_secs must be at least 1");
        ensure!(self.decode.worker_threads > 0, "decode.worker_threads must be at least 1");
        Ok(())
    }
}

/// Request (network-level) cache budget and ageing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestCacheConfig {
    /// Byte budget for proxy-less entries, per table (chrome and content are separate).
    pub max_bytes: u64,
    /// Weight of recency against size in the eviction order, within `[0, 1]`.
    pub time_weight: f64,
    /// Number of ageing generations an untouched entry survives.
    pub generations: usize,
    /// Length of one ageing generation in seconds.
    pub generation_secs: u64,
}

impl Default for RequestCacheConfig {
    fn default() -> Self {
        Self { max_bytes: 5 * 1024 * 1024, time_weight: 0.5, generations: 3, generation_secs: 10 }
    }
}

impl RequestCacheConfig {
    pub fn generation_period(&self) -> Duration {
        Duration::from_secs(self.generation_secs)
    }
}

/// Decoded-surface cache budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceCacheConfig {
    pub max_bytes: u64,
    /// Allow animated images to drop their frames like static images.
    pub discard_animated: bool,
    /// Decode straight to a smaller requested size instead of the intrinsic size.
    pub downscale_during_decode: bool,
}

impl Default for SurfaceCacheConfig {
    fn default() -> Self {
        Self { max_bytes: 256 * 1024 * 1024, discard_animated: false, downscale_during_decode: true }
    }
}

/// Worker pool sizing and the inline-decode heuristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodePoolConfig {
    pub worker_threads: usize,
    /// Largest target pixel count a "sync decode if fast" request may decode inline.
    pub sync_decode_pixel_limit: u64,
}

impl Default for DecodePoolConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        Self { worker_threads: parallelism.saturating_sub(1).max(1), sync_decode_pixel_limit: 1 << 20 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let config =
            ImageCacheConfig::from_json_str(r#"{ "cache": { "max_bytes": 120 } }"#).unwrap();
        assert_eq!(config.cache.max_bytes, 120);
        assert_eq!(config.cache.generations, 3);
        assert_eq!(config.surfaces, SurfaceCacheConfig::default());
    }

    #[test]
    fn rejects_out_of_range_time_weight() {
        let err = ImageCacheConfig::from_json_str(r#"{ "cache": { "time_weight": 2.5 } }"#)
            .expect_err("weight above one");
        assert!(format!("{err:#}").contains("time_weight"));
    }

    #[test]
    fn reads_config_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("imgcache.json");
        fs::write(&path, r#"{ "decode": { "worker_threads": 2 }, "surfaces": { "discard_animated": true } }"#)?;
        let config = ImageCacheConfig::from_json_file(&path)?;
        assert_eq!(config.decode.worker_threads, 2);
        assert!(config.surfaces.discard_animated);
        Ok(())
    }
}
