//! Render Worker Library
//!
//! Pooled, cached and batched document rendering. A single backend instance
//! is shared through a pool of render contexts; identical requests are served
//! from a content-addressed output cache; batch jobs fan records out under a
//! concurrency limit and collect successful outputs into a ZIP archive.
//!
//! ## Module Overview
//!
//! - `backend`: launcher, instance and context traits for render backends
//! - `converter`: SVG backend (PDF via svg2pdf, PNG via resvg)
//! - `pool`: context pool with backend relaunch and render timeouts
//! - `cache`: SHA-256 keyed output cache with TTL and insertion-order eviction
//! - `render`: cache-then-pool single render path
//! - `source`, `template`: record sources, field mapping, placeholder templates
//! - `archive`: ZIP packaging with collision handling
//! - `job`, `store`: job model, state transitions, in-memory registry and expiry
//! - `orchestrator`: batch fan-out and result assembly
//! - `config`, `telemetry`: environment configuration, logging and OpenTelemetry
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use worker_render::{
//!     cache::OutputCache,
//!     converter::SvgBackend,
//!     options::{RenderOptions, RenderRequest},
//!     pool::{ResourcePool, DEFAULT_POOL_SIZE, DEFAULT_RENDER_TIMEOUT},
//!     render::RenderService,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let pool = Arc::new(ResourcePool::new(
//!         Arc::new(SvgBackend::new()),
//!         DEFAULT_POOL_SIZE,
//!         DEFAULT_RENDER_TIMEOUT,
//!     ));
//!     let service = RenderService::new(Arc::clone(&pool), Arc::new(OutputCache::default()));
//!
//!     let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="10"/>"#;
//!     let pdf = service
//!         .render(&RenderRequest::new(svg, RenderOptions::default()))
//!         .await;
//!     assert!(pdf.is_ok());
//!
//!     pool.shutdown().await;
//! }
//! ```

pub mod archive;
pub mod backend;
pub mod cache;
pub mod config;
pub mod converter;
pub mod error;
pub mod job;
pub mod options;
pub mod orchestrator;
pub mod pool;
pub mod render;
pub mod source;
pub mod store;
pub mod telemetry;
pub mod template;

mod lock;

pub use error::{ArchiveError, JobError, RecordError, RenderError, SourceError, TemplateError};
pub use job::{BatchJob, JobStatus, RecordFailure};
pub use options::{OutputFormat, PageFormat, RenderOptions, RenderRequest};
pub use orchestrator::{BatchOrchestrator, BatchRequest, RecordSelection};
