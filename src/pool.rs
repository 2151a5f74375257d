//! Render context pool over one shared backend instance.
//!
//! The pool caps *reuse*, not creation: [`ResourcePool::acquire`] reuses an
//! idle context when one is available and otherwise creates a new one, so
//! callers beyond the soft pool size never block. [`ResourcePool::release`]
//! keeps a context only while the idle list is below `max_idle`.
//!
//! The backend instance is launched lazily and relaunched on the next
//! `acquire` after it reports itself disconnected. Contexts remember the
//! instance generation that created them and are torn down instead of reused
//! once that instance has been replaced.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::backend::{BackendInstance, BackendLauncher, RenderContext};
use crate::error::RenderError;
use crate::lock::mutex_lock;
use crate::options::RenderRequest;

const SOURCE: &str = "pool";

/// Default number of idle contexts kept for reuse.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Default render timeout (30 seconds).
pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(30);

/// A leased render context. Owned by exactly one caller until released.
///
/// A lease that is dropped instead of being handed back (for example when
/// the future rendering on it is cancelled) ends itself: the pool's lease
/// count is decremented and the context is closed on the current runtime.
pub struct PoolContext {
    inner: Option<Box<dyn RenderContext>>,
    generation: u64,
    lease: Option<Arc<AtomicUsize>>,
}

impl PoolContext {
    fn new(inner: Box<dyn RenderContext>, generation: u64) -> Self {
        Self {
            inner: Some(inner),
            generation,
            lease: None,
        }
    }

    /// Generation of the backend instance this context was created on.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Renders `request` on this context.
    ///
    /// # Errors
    ///
    /// Returns whatever the backend context reports, or
    /// [`RenderError::Disconnected`] if the context was already closed.
    pub async fn render(&mut self, request: &RenderRequest) -> Result<Vec<u8>, RenderError> {
        match self.inner.as_mut() {
            Some(inner) => inner.render(&request.document, &request.options).await,
            None => Err(RenderError::Disconnected),
        }
    }

    fn end_lease(&mut self) {
        if let Some(leased) = self.lease.take() {
            leased.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for PoolContext {
    fn drop(&mut self) {
        self.end_lease();

        let Some(inner) = self.inner.take() else {
            return;
        };
        let generation = self.generation;
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.close().await {
                        debug!(generation, error = %e, "Ignoring close error on dropped context");
                    }
                });
            }
            Err(_) => debug!(generation, "No runtime left to close dropped render context"),
        }
    }
}

struct LiveInstance {
    backend: Arc<dyn BackendInstance>,
    generation: u64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    pub created: usize,
    pub generation: u64,
    pub max_idle: usize,
}

pub struct ResourcePool {
    launcher: Arc<dyn BackendLauncher>,
    instance: tokio::sync::Mutex<Option<LiveInstance>>,
    idle: Mutex<Vec<PoolContext>>,
    max_idle: usize,
    render_timeout: Duration,
    generation: AtomicU64,
    leased: Arc<AtomicUsize>,
    created: AtomicUsize,
    shut_down: AtomicBool,
}

impl ResourcePool {
    /// Creates an empty pool. Nothing is launched until the first `acquire`.
    ///
    /// # Arguments
    ///
    /// * `launcher` - Starts backend instances, now and after disconnects
    /// * `max_idle` - Idle contexts kept for reuse; extra ones are torn down
    /// * `render_timeout` - Upper bound for a single [`ResourcePool::render`]
    pub fn new(launcher: Arc<dyn BackendLauncher>, max_idle: usize, render_timeout: Duration) -> Self {
        Self {
            launcher,
            instance: tokio::sync::Mutex::new(None),
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            render_timeout,
            generation: AtomicU64::new(0),
            leased: Arc::new(AtomicUsize::new(0)),
            created: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Returns the live backend instance, launching or relaunching it as needed.
    async fn live_instance(&self) -> Result<(Arc<dyn BackendInstance>, u64), RenderError> {
        let mut slot = self.instance.lock().await;

        if let Some(live) = slot.as_ref() {
            if live.backend.is_connected() {
                return Ok((Arc::clone(&live.backend), live.generation));
            }
            warn!(
                generation = live.generation,
                "Render backend disconnected, relaunching"
            );
        }

        if let Some(stale) = slot.take() {
            if let Err(e) = stale.backend.close().await {
                debug!(error = %e, "Ignoring close error on stale backend");
            }
        }

        let backend = self.launcher.launch().await?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(generation, "Render backend launched");

        *slot = Some(LiveInstance {
            backend: Arc::clone(&backend),
            generation,
        });
        Ok((backend, generation))
    }

    /// Create-or-reuse: pops an idle context from the current instance, or
    /// creates a fresh one when none is idle.
    ///
    /// # Errors
    ///
    /// - [`RenderError::ShutDown`] once [`ResourcePool::shutdown`] ran
    /// - [`RenderError::Launch`] if the backend could not be (re)started
    /// - Context creation errors from the live instance
    pub async fn acquire(&self) -> Result<PoolContext, RenderError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(RenderError::ShutDown);
        }

        let (backend, generation) = self.live_instance().await?;

        let mut stale = Vec::new();
        let reused = {
            let mut idle = mutex_lock(&self.idle, SOURCE, "acquire");
            let mut found = None;
            while let Some(ctx) = idle.pop() {
                if ctx.generation == generation {
                    found = Some(ctx);
                    break;
                }
                stale.push(ctx);
            }
            found
        };

        for ctx in stale {
            close_quietly(ctx).await;
        }

        let mut ctx = match reused {
            Some(ctx) => ctx,
            None => {
                let inner = backend.new_context().await?;
                self.created.fetch_add(1, Ordering::Relaxed);
                PoolContext::new(inner, generation)
            }
        };

        self.leased.fetch_add(1, Ordering::AcqRel);
        ctx.lease = Some(Arc::clone(&self.leased));
        Ok(ctx)
    }

    /// Return-or-discard: keeps the context for reuse while the idle list is
    /// below its maximum, tears it down otherwise.
    pub async fn release(&self, mut ctx: PoolContext) {
        ctx.end_lease();

        let current = self.generation.load(Ordering::Acquire);
        if self.shut_down.load(Ordering::Acquire) || ctx.generation != current {
            close_quietly(ctx).await;
            return;
        }

        let overflow = {
            let mut idle = mutex_lock(&self.idle, SOURCE, "release");
            if idle.len() < self.max_idle {
                idle.push(ctx);
                None
            } else {
                Some(ctx)
            }
        };

        if let Some(ctx) = overflow {
            close_quietly(ctx).await;
        }
    }

    /// Tears down a context that must not be reused.
    pub async fn discard(&self, ctx: PoolContext) {
        close_quietly(ctx).await;
    }

    /// Renders `request` on a leased context, bounded by the render timeout.
    ///
    /// Failures are returned to the caller and never retried. A context that
    /// timed out or saw its backend disconnect is discarded. If this future
    /// is dropped mid-render the lease ends through [`PoolContext`]'s `Drop`.
    ///
    /// # Errors
    ///
    /// - Any [`ResourcePool::acquire`] error
    /// - [`RenderError::Timeout`] after `render_timeout`
    /// - Backend render errors
    pub async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, RenderError> {
        let mut ctx = self.acquire().await?;

        match tokio::time::timeout(self.render_timeout, ctx.render(request)).await {
            Ok(Ok(bytes)) => {
                self.release(ctx).await;
                Ok(bytes)
            }
            Ok(Err(e)) => {
                if e.poisons_context() {
                    self.discard(ctx).await;
                } else {
                    self.release(ctx).await;
                }
                Err(e)
            }
            Err(_) => {
                self.discard(ctx).await;
                let ms = self.render_timeout.as_millis() as u64;
                warn!(timeout_ms = ms, "Render timed out");
                Err(RenderError::Timeout(ms))
            }
        }
    }

    /// Best-effort teardown of every idle context and the backend instance.
    ///
    /// Errors are logged and swallowed. Leased contexts are torn down when
    /// they are released.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let idle: Vec<PoolContext> = {
            let mut idle = mutex_lock(&self.idle, SOURCE, "shutdown");
            idle.drain(..).collect()
        };
        let closed = idle.len();
        for ctx in idle {
            close_quietly(ctx).await;
        }

        if let Some(live) = self.instance.lock().await.take() {
            if let Err(e) = live.backend.close().await {
                warn!(error = %e, "Failed to close render backend during shutdown");
            }
        }

        info!(
            closed_contexts = closed,
            leased = self.leased.load(Ordering::Acquire),
            "Render pool shut down"
        );
    }

    /// Current idle, leased and created counts plus the instance generation.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: mutex_lock(&self.idle, SOURCE, "stats").len(),
            leased: self.leased.load(Ordering::Acquire),
            created: self.created.load(Ordering::Relaxed),
            generation: self.generation.load(Ordering::Acquire),
            max_idle: self.max_idle,
        }
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // Dropping each idle context schedules its own close.
        let idle: Vec<PoolContext> = self
            .idle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let closed = idle.len();
        drop(idle);

        let instance = self.instance.get_mut().take();
        if let Some(live) = instance {
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = live.backend.close().await {
                            debug!(error = %e, "Ignoring close error on dropped backend");
                        }
                    });
                }
                Err(_) => debug!("No runtime left to close render backend"),
            }
        }

        info!(closed_contexts = closed, "Render pool dropped without shutdown; tearing down");
    }
}

async fn close_quietly(mut ctx: PoolContext) {
    ctx.end_lease();
    let generation = ctx.generation;
    if let Some(inner) = ctx.inner.take() {
        if let Err(e) = inner.close().await {
            warn!(generation, error = %e, "Failed to close render context");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RenderOptions;
    use async_trait::async_trait;

    #[derive(Default)]
    struct Counters {
        launches: AtomicUsize,
        contexts_closed: AtomicUsize,
        instances_closed: AtomicUsize,
    }

    struct FakeLauncher {
        counters: Arc<Counters>,
        fail_launch: AtomicBool,
        render_delay: Duration,
        last: Mutex<Option<Arc<FakeInstance>>>,
    }

    impl FakeLauncher {
        fn new() -> Self {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(render_delay: Duration) -> Self {
            Self {
                counters: Arc::new(Counters::default()),
                fail_launch: AtomicBool::new(false),
                render_delay,
                last: Mutex::new(None),
            }
        }

        fn kill_current(&self) {
            if let Some(instance) = self.last.lock().unwrap().as_ref() {
                instance.connected.store(false, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl BackendLauncher for FakeLauncher {
        async fn launch(&self) -> Result<Arc<dyn BackendInstance>, RenderError> {
            if self.fail_launch.load(Ordering::SeqCst) {
                return Err(RenderError::Launch("no backend".into()));
            }
            self.counters.launches.fetch_add(1, Ordering::SeqCst);
            let instance = Arc::new(FakeInstance {
                connected: AtomicBool::new(true),
                counters: Arc::clone(&self.counters),
                render_delay: self.render_delay,
            });
            *self.last.lock().unwrap() = Some(Arc::clone(&instance));
            Ok(instance)
        }
    }

    struct FakeInstance {
        connected: AtomicBool,
        counters: Arc<Counters>,
        render_delay: Duration,
    }

    #[async_trait]
    impl BackendInstance for FakeInstance {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn new_context(&self) -> Result<Box<dyn RenderContext>, RenderError> {
            Ok(Box::new(FakeContext {
                counters: Arc::clone(&self.counters),
                render_delay: self.render_delay,
            }))
        }

        async fn close(&self) -> Result<(), RenderError> {
            self.counters.instances_closed.fetch_add(1, Ordering::SeqCst);
            Err(RenderError::Backend("close exploded".into()))
        }
    }

    struct FakeContext {
        counters: Arc<Counters>,
        render_delay: Duration,
    }

    #[async_trait]
    impl RenderContext for FakeContext {
        async fn render(
            &mut self,
            document: &[u8],
            _options: &RenderOptions,
        ) -> Result<Vec<u8>, RenderError> {
            if !self.render_delay.is_zero() {
                tokio::time::sleep(self.render_delay).await;
            }
            match document {
                b"disconnect" => Err(RenderError::Disconnected),
                b"reject" => Err(RenderError::Backend("bad document".into())),
                _ => Ok(document.to_vec()),
            }
        }

        async fn close(self: Box<Self>) -> Result<(), RenderError> {
            self.counters.contexts_closed.fetch_add(1, Ordering::SeqCst);
            Err(RenderError::Backend("close exploded".into()))
        }
    }

    fn pool(launcher: Arc<FakeLauncher>, max_idle: usize) -> ResourcePool {
        ResourcePool::new(launcher, max_idle, DEFAULT_RENDER_TIMEOUT)
    }

    #[tokio::test]
    async fn test_backend_launched_lazily_and_once() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = pool(Arc::clone(&launcher), 2);
        assert_eq!(launcher.counters.launches.load(Ordering::SeqCst), 0);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        assert_eq!(launcher.counters.launches.load(Ordering::SeqCst), 1);
        assert_eq!(a.generation(), 1);
        assert_eq!(b.generation(), 1);
        assert_eq!(pool.stats().leased, 2);

        pool.release(a).await;
        pool.release(b).await;
        assert_eq!(pool.stats().leased, 0);
    }

    #[tokio::test]
    async fn test_creation_is_unbounded_but_reuse_is_capped() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = pool(Arc::clone(&launcher), 2);

        let mut leases = Vec::new();
        for _ in 0..4 {
            leases.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.stats().created, 4);

        for ctx in leases {
            pool.release(ctx).await;
        }

        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.leased, 0);
        assert_eq!(launcher.counters.contexts_closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_released_context_is_reused() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = pool(Arc::clone(&launcher), 2);

        let ctx = pool.acquire().await.unwrap();
        pool.release(ctx).await;
        let ctx = pool.acquire().await.unwrap();

        assert_eq!(pool.stats().created, 1);
        pool.release(ctx).await;
    }

    #[tokio::test]
    async fn test_disconnected_backend_is_relaunched_on_next_acquire() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = pool(Arc::clone(&launcher), 2);

        let ctx = pool.acquire().await.unwrap();
        pool.release(ctx).await;
        assert_eq!(pool.stats().idle, 1);

        launcher.kill_current();

        let ctx = pool.acquire().await.unwrap();
        assert_eq!(ctx.generation(), 2);
        assert_eq!(launcher.counters.launches.load(Ordering::SeqCst), 2);
        assert_eq!(launcher.counters.instances_closed.load(Ordering::SeqCst), 1);
        // The idle context from generation 1 was torn down, not reused.
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(launcher.counters.contexts_closed.load(Ordering::SeqCst), 1);
        pool.release(ctx).await;
    }

    #[tokio::test]
    async fn test_stale_lease_is_torn_down_on_release() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = pool(Arc::clone(&launcher), 2);

        let old = pool.acquire().await.unwrap();
        launcher.kill_current();
        let fresh = pool.acquire().await.unwrap();

        pool.release(old).await;
        pool.release(fresh).await;

        assert_eq!(pool.stats().idle, 1);
        assert_eq!(launcher.counters.contexts_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_surfaces_and_next_acquire_retries() {
        let launcher = Arc::new(FakeLauncher::new());
        launcher.fail_launch.store(true, Ordering::SeqCst);
        let pool = pool(Arc::clone(&launcher), 2);

        assert!(matches!(pool.acquire().await, Err(RenderError::Launch(_))));
        assert_eq!(pool.stats().leased, 0);

        launcher.fail_launch.store(false, Ordering::SeqCst);
        let ctx = pool.acquire().await.unwrap();
        assert_eq!(ctx.generation(), 1);
        pool.release(ctx).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_timeout_discards_context() {
        let launcher = Arc::new(FakeLauncher::with_delay(Duration::from_secs(60)));
        let backend: Arc<dyn BackendLauncher> = launcher.clone();
        let pool = ResourcePool::new(backend, 2, Duration::from_secs(1));

        let result = pool
            .render(&RenderRequest::new(b"doc".to_vec(), RenderOptions::default()))
            .await;

        assert_eq!(result, Err(RenderError::Timeout(1000)));
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.leased, 0);
        assert_eq!(launcher.counters.contexts_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_render_returns_context_to_pool() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = pool(Arc::clone(&launcher), 2);

        let out = pool
            .render(&RenderRequest::new(b"doc".to_vec(), RenderOptions::default()))
            .await
            .unwrap();

        assert_eq!(out, b"doc".to_vec());
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_disconnected_render_discards_context() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = pool(Arc::clone(&launcher), 2);

        let result = pool
            .render(&RenderRequest::new("disconnect", RenderOptions::default()))
            .await;

        assert_eq!(result, Err(RenderError::Disconnected));
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.leased, 0);
        assert_eq!(launcher.counters.contexts_closed.load(Ordering::SeqCst), 1);

        // An ordinary backend error keeps the context reusable.
        let result = pool
            .render(&RenderRequest::new("reject", RenderOptions::default()))
            .await;
        assert!(matches!(result, Err(RenderError::Backend(_))));
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(launcher.counters.contexts_closed.load(Ordering::SeqCst), 1);
    }

    async fn settle_spawned_tasks() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_render_ends_its_lease() {
        let launcher = Arc::new(FakeLauncher::with_delay(Duration::from_secs(10)));
        let pool = pool(Arc::clone(&launcher), 2);

        let outer = tokio::time::timeout(
            Duration::from_secs(1),
            pool.render(&RenderRequest::new(b"doc".to_vec(), RenderOptions::default())),
        )
        .await;
        assert!(outer.is_err());

        settle_spawned_tasks().await;

        let stats = pool.stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(launcher.counters.contexts_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_is_closed() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = pool(Arc::clone(&launcher), 2);

        let ctx = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().leased, 1);
        drop(ctx);
        settle_spawned_tasks().await;

        assert_eq!(pool.stats().leased, 0);
        assert_eq!(launcher.counters.contexts_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropping_pool_tears_everything_down() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = pool(Arc::clone(&launcher), 2);

        let ctx = pool.acquire().await.unwrap();
        pool.release(ctx).await;
        assert_eq!(pool.stats().idle, 1);

        drop(pool);
        settle_spawned_tasks().await;

        assert_eq!(launcher.counters.contexts_closed.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.counters.instances_closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_swallows_teardown_errors() {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = pool(Arc::clone(&launcher), 3);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let leased = pool.acquire().await.unwrap();
        pool.release(a).await;
        pool.release(b).await;

        pool.shutdown().await;

        assert_eq!(launcher.counters.contexts_closed.load(Ordering::SeqCst), 2);
        assert_eq!(launcher.counters.instances_closed.load(Ordering::SeqCst), 1);
        assert!(matches!(pool.acquire().await, Err(RenderError::ShutDown)));

        pool.release(leased).await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(launcher.counters.contexts_closed.load(Ordering::SeqCst), 3);

        // A second shutdown is a no-op.
        pool.shutdown().await;
    }
}
