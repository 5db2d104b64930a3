//! Headless rendering: bounded browser pool, URL interception, output checks.

pub mod chrome;
pub mod intercept;
pub mod pool;
pub mod validate;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domains::menu::PaperFormat;

pub use intercept::UrlPolicy;
pub use pool::{PoolStats, RenderPool};
pub use validate::{validate_output, ValidationReport};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("render timed out after {0:?}")]
    Timeout(Duration),
    #[error("page error: {0}")]
    Page(String),
    #[error("render canary failed: {0}")]
    Canary(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

#[derive(Debug, Clone, Copy)]
pub enum RenderTarget {
    Pdf,
    Image {
        format: ImageFormat,
        quality: Option<u32>,
        transparent: bool,
    },
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub target: RenderTarget,
    pub paper: PaperFormat,
    pub landscape: bool,
    pub timeout: Duration,
}

impl RenderOptions {
    pub fn pdf(paper: PaperFormat, landscape: bool, timeout: Duration) -> Self {
        Self {
            target: RenderTarget::Pdf,
            paper,
            landscape,
            timeout,
        }
    }

    pub fn png(timeout: Duration) -> Self {
        Self {
            target: RenderTarget::Image {
                format: ImageFormat::Png,
                quality: None,
                transparent: false,
            },
            paper: PaperFormat::A4,
            landscape: false,
            timeout,
        }
    }

    pub fn image_format(&self) -> ImageFormat {
        match self.target {
            RenderTarget::Pdf => ImageFormat::Png,
            RenderTarget::Image { format, .. } => format,
        }
    }
}

/// The render seam the processor works against; [`RenderPool`] is the
/// production implementation.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, html: &str, opts: &RenderOptions) -> Result<Vec<u8>, RenderError>;
}
