//! Render options and requests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Paper size of the rendered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageFormat {
    #[default]
    A4,
    Letter,
}

/// Encoding of the rendered output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Pdf,
    Png,
}

impl OutputFormat {
    /// File extension used for archive entries.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Png => "png",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(OutputFormat::Pdf),
            "png" => Ok(OutputFormat::Png),
            other => Err(format!("unknown output format `{}`", other)),
        }
    }
}

/// Page margins in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Margins {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl Margins {
    pub fn uniform(mm: f32) -> Self {
        Self {
            top: mm,
            right: mm,
            bottom: mm,
            left: mm,
        }
    }
}

impl Default for Margins {
    fn default() -> Self {
        Self::uniform(10.0)
    }
}

/// Immutable render settings. Every field participates in the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderOptions {
    pub format: PageFormat,
    pub landscape: bool,
    pub margins: Margins,
    pub scale: f32,
    pub output: OutputFormat,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            format: PageFormat::A4,
            landscape: false,
            margins: Margins::default(),
            scale: 1.0,
            output: OutputFormat::Pdf,
        }
    }
}

/// A single document to render. Not retained after the render completes.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub document: Vec<u8>,
    pub options: RenderOptions,
}

impl RenderRequest {
    pub fn new(document: impl Into<Vec<u8>>, options: RenderOptions) -> Self {
        Self {
            document: document.into(),
            options,
        }
    }
}
