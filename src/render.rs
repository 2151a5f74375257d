//! Single-render path: output cache in front of the resource pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::cache::{CacheKey, OutputCache};
use crate::error::RenderError;
use crate::options::RenderRequest;
use crate::pool::ResourcePool;

/// Output of [`RenderService::render`].
#[derive(Debug, Clone)]
pub struct Rendered {
    pub bytes: Arc<Vec<u8>>,
    pub key: CacheKey,
    pub cache_hit: bool,
}

pub struct RenderService {
    pool: Arc<ResourcePool>,
    cache: Arc<OutputCache>,
    backend_renders: AtomicUsize,
}

impl RenderService {
    /// # Arguments
    ///
    /// * `pool` - Leases render contexts on cache misses
    /// * `cache` - Holds successful outputs keyed by request digest
    pub fn new(pool: Arc<ResourcePool>, cache: Arc<OutputCache>) -> Self {
        Self {
            pool,
            cache,
            backend_renders: AtomicUsize::new(0),
        }
    }

    /// Serves `request` from the cache, or renders it through the pool and
    /// caches the result. Failed renders are never cached.
    ///
    /// # Errors
    ///
    /// Any [`ResourcePool::render`] error, passed through unchanged.
    pub async fn render(&self, request: &RenderRequest) -> Result<Rendered, RenderError> {
        let key = CacheKey::compute(request);

        if let Some(bytes) = self.cache.get(&key) {
            debug!(key = ?key, bytes = bytes.len(), "Render served from cache");
            return Ok(Rendered {
                bytes,
                key,
                cache_hit: true,
            });
        }

        self.backend_renders.fetch_add(1, Ordering::Relaxed);
        let bytes = Arc::new(self.pool.render(request).await?);
        self.cache.put(key, Arc::clone(&bytes));

        Ok(Rendered {
            bytes,
            key,
            cache_hit: false,
        })
    }

    /// Number of renders that went past the cache to the backend.
    pub fn backend_renders(&self) -> usize {
        self.backend_renders.load(Ordering::Relaxed)
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<OutputCache> {
        &self.cache
    }
}
