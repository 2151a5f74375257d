//! SVG render backend: vector PDF via svg2pdf, raster PNG via resvg.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::{BackendInstance, BackendLauncher, RenderContext};
use crate::error::RenderError;
use crate::options::{OutputFormat, RenderOptions};

/// Stateless SVG converter.
///
/// The SVG document defines its own geometry, so page format, orientation
/// and margins are carried for cache identity only. `scale` applies to PNG
/// output.
#[derive(Debug, Default, Clone, Copy)]
pub struct SvgConverter;

impl SvgConverter {
    pub fn new() -> Self {
        Self
    }

    /// Converts SVG bytes to the requested output format.
    ///
    /// # Errors
    ///
    /// - Non UTF-8 input or SVG parsing errors
    /// - Zero or negative document dimensions
    /// - Raster allocation or PNG encoding failures
    pub fn convert(&self, svg: &[u8], options: &RenderOptions) -> Result<Vec<u8>> {
        let text = std::str::from_utf8(svg).context("SVG document is not valid UTF-8")?;

        let tree = usvg::Tree::from_str(text, &usvg::Options::default())
            .context("Failed to parse SVG content")?;

        let size = tree.size();
        if size.width() <= 0.0 || size.height() <= 0.0 {
            anyhow::bail!(
                "Invalid SVG dimensions: {}x{}",
                size.width(),
                size.height()
            );
        }

        let bytes = match options.output {
            OutputFormat::Pdf => svg2pdf::to_pdf(
                &tree,
                svg2pdf::ConversionOptions::default(),
                svg2pdf::PageOptions::default(),
            ),
            OutputFormat::Png => {
                let scale = if options.scale > 0.0 { options.scale } else { 1.0 };
                let width = (size.width() * scale).ceil() as u32;
                let height = (size.height() * scale).ceil() as u32;

                let mut pixmap = resvg::tiny_skia::Pixmap::new(width, height)
                    .with_context(|| format!("Cannot allocate {}x{} pixmap", width, height))?;
                resvg::render(
                    &tree,
                    resvg::tiny_skia::Transform::from_scale(scale, scale),
                    &mut pixmap.as_mut(),
                );
                pixmap.encode_png().context("Failed to encode PNG")?
            }
        };

        debug!(
            output = %options.output,
            width = size.width(),
            height = size.height(),
            bytes = bytes.len(),
            "SVG converted"
        );
        Ok(bytes)
    }
}

/// Launches in-process SVG backend instances.
#[derive(Debug, Default)]
pub struct SvgBackend;

impl SvgBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BackendLauncher for SvgBackend {
    async fn launch(&self) -> Result<Arc<dyn BackendInstance>, RenderError> {
        info!("Launching SVG render backend");
        Ok(Arc::new(SvgInstance::default()))
    }
}

/// A live SVG backend. Contexts stop working once the instance is closed.
#[derive(Debug)]
pub struct SvgInstance {
    connected: Arc<AtomicBool>,
    contexts: AtomicUsize,
}

impl Default for SvgInstance {
    fn default() -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(true)),
            contexts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BackendInstance for SvgInstance {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn new_context(&self) -> Result<Box<dyn RenderContext>, RenderError> {
        if !self.is_connected() {
            return Err(RenderError::Disconnected);
        }
        let id = self.contexts.fetch_add(1, Ordering::Relaxed);
        debug!(context_id = id, "Created SVG render context");
        Ok(Box::new(SvgContext {
            connected: Arc::clone(&self.connected),
            converter: SvgConverter::new(),
        }))
    }

    async fn close(&self) -> Result<(), RenderError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}

struct SvgContext {
    connected: Arc<AtomicBool>,
    converter: SvgConverter,
}

#[async_trait]
impl RenderContext for SvgContext {
    async fn render(
        &mut self,
        document: &[u8],
        options: &RenderOptions,
    ) -> Result<Vec<u8>, RenderError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(RenderError::Disconnected);
        }

        let converter = self.converter;
        let document = document.to_vec();
        let options = *options;

        tokio::task::spawn_blocking(move || converter.convert(&document, &options))
            .await
            .map_err(|e| RenderError::Backend(format!("render task failed: {}", e)))?
            .map_err(|e| RenderError::Backend(format!("{:#}", e)))
    }

    async fn close(self: Box<Self>) -> Result<(), RenderError> {
        Ok(())
    }
}
