//! Render backend capability.
//!
//! A backend is launched once and shared; callers render through independent
//! contexts created on the live instance. The pool relies on
//! [`BackendInstance::is_connected`] to notice a dead instance and launch a
//! replacement.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::RenderError;
use crate::options::RenderOptions;

/// Starts backend instances.
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BackendInstance>, RenderError>;
}

/// A long-lived backend shared by every context created from it.
#[async_trait]
pub trait BackendInstance: Send + Sync {
    /// `false` once the instance has died and must be replaced.
    fn is_connected(&self) -> bool;

    async fn new_context(&self) -> Result<Box<dyn RenderContext>, RenderError>;

    async fn close(&self) -> Result<(), RenderError>;
}

/// A leasable handle into a backend instance. Used by one caller at a time.
#[async_trait]
pub trait RenderContext: Send {
    /// Renders `document` to output bytes.
    ///
    /// Must be deterministic for identical inputs, since outputs are cached
    /// by input digest.
    async fn render(
        &mut self,
        document: &[u8],
        options: &RenderOptions,
    ) -> Result<Vec<u8>, RenderError>;

    async fn close(self: Box<Self>) -> Result<(), RenderError>;
}
