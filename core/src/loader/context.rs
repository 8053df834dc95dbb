//! Process-wide services: the surface cache, the decode pool, telemetry and the two loaders
//! (normal and private browsing) that share them.

use std::sync::Arc;

use tracing::info;

use crate::Result;
use crate::cache::IsolationAttributes;
use crate::config::ImageCacheConfig;
use crate::decode::DecodePool;
use crate::stats::{CacheSnapshot, StatsCollector, TelemetrySink};
use crate::surface::SurfaceCache;

use super::{ImageLoader, LoaderEnv};

#[derive(Debug)]
pub struct AppContext {
    config: ImageCacheConfig,
    stats: Arc<StatsCollector>,
    surfaces: Arc<SurfaceCache>,
    pool: Arc<DecodePool>,
    normal: ImageLoader,
    private: ImageLoader,
    shut_down: bool,
}

impl AppContext {
    /// Build every service in dependency order: telemetry, surfaces, decode workers, loaders.
    pub fn new(config: ImageCacheConfig, env: LoaderEnv) -> Result<Self> {
        config.validate()?;
        let stats = Arc::new(StatsCollector::new());
        let telemetry: Arc<dyn TelemetrySink> = stats.clone();
        let surfaces = Arc::new(SurfaceCache::new(config.surfaces.clone()));
        let pool = Arc::new(DecodePool::new(&config.decode, Arc::clone(&telemetry))?);

        let normal = ImageLoader::new(
            false,
            &config.cache,
            Arc::clone(&surfaces),
            Arc::clone(&pool),
            Arc::clone(&telemetry),
            env.clone(),
        );
        let private =
            ImageLoader::new(true, &config.cache, Arc::clone(&surfaces), Arc::clone(&pool), telemetry, env);

        info!(
            target: "imgcache::loader",
            workers = pool.worker_count(),
            surface_budget = config.surfaces.max_bytes,
            cache_budget = config.cache.max_bytes,
            "image cache ready"
        );
        Ok(Self { config, stats, surfaces, pool, normal, private, shut_down: false })
    }

    pub fn config(&self) -> &ImageCacheConfig {
        &self.config
    }

    pub fn loader(&mut self) -> &mut ImageLoader {
        &mut self.normal
    }

    pub fn private_loader(&mut self) -> &mut ImageLoader {
        &mut self.private
    }

    /// The loader whose cache partition matches `attrs`.
    pub fn loader_for(&mut self, attrs: &IsolationAttributes) -> &mut ImageLoader {
        if attrs.is_private() { &mut self.private } else { &mut self.normal }
    }

    pub fn surfaces(&self) -> &Arc<SurfaceCache> {
        &self.surfaces
    }

    pub fn pool(&self) -> &Arc<DecodePool> {
        &self.pool
    }

    pub fn stats(&self) -> CacheSnapshot {
        self.stats.snapshot()
    }

    pub fn process_decode_completions(&mut self) -> usize {
        self.normal.process_decode_completions() + self.private.process_decode_completions()
    }

    /// Shed evictable requests from both loaders and every unlocked surface.
    pub fn on_memory_pressure(&mut self) -> u64 {
        self.normal.minimize_caches();
        self.private.minimize_caches();
        self.surfaces.discard_all_unlocked()
    }

    /// Leaving private browsing forgets everything the private loader held.
    pub fn on_last_private_context_closed(&mut self) {
        self.private.clear_all();
    }

    /// Tear down in reverse order of construction. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.normal.clear_all();
        self.private.clear_all();
        self.pool.shutdown();
        self.surfaces.purge();
        info!(target: "imgcache::loader", "image cache shut down");
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::clock::SystemClock;
    use crate::config::DecodePoolConfig;
    use crate::error::LoadError;
    use crate::loader::{AllowAll, ChannelRequest, Transport};
    use crate::types::ChannelId;

    #[derive(Debug)]
    struct Offline;

    impl Transport for Offline {
        fn open(&self, request: &ChannelRequest) -> std::result::Result<ChannelId, LoadError> {
            Err(LoadError::Transport { uri: request.uri.clone(), reason: "offline".into() })
        }

        fn cancel(&self, _: ChannelId) {}
    }

    fn env() -> LoaderEnv {
        LoaderEnv { transport: Rc::new(Offline), security: Rc::new(AllowAll), clock: Rc::new(SystemClock) }
    }

    #[test]
    fn builds_and_shuts_down() {
        let config = ImageCacheConfig {
            decode: DecodePoolConfig { worker_threads: 2, sync_decode_pixel_limit: 1 << 16 },
            ..Default::default()
        };
        let mut context = AppContext::new(config, env()).expect("context");
        assert_eq!(context.pool().worker_count(), 2);
        assert!(!context.loader().is_private());
        assert!(context.private_loader().is_private());
        let attrs = IsolationAttributes { private_browsing_id: 1, ..Default::default() };
        assert!(context.loader_for(&attrs).is_private());
        context.shutdown();
        context.shutdown();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = ImageCacheConfig::default();
        config.decode.worker_threads = 0;
        assert!(AppContext::new(config, env()).is_err());
    }
}
