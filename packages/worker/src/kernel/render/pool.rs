//! Bounded pool of headless browser instances.
//!
//! Browsers are launched lazily up to the cap and reused across renders.
//! Acquisition has no timeout: backpressure propagates from the poller,
//! which claims one job at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::Browser;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::domains::menu::PaperFormat;

use super::chrome::{self, ChromeLauncher};
use super::intercept::UrlPolicy;
use super::{RenderError, RenderOptions, Renderer};

const CANARY_HTML: &str =
    "<!DOCTYPE html><html><body><h1>Render canary</h1><p>worker self-test page</p></body></html>";
const CANARY_MIN_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub available: usize,
    pub capacity: usize,
}

pub struct RenderPool {
    launcher: ChromeLauncher,
    policy: UrlPolicy,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Browser>>,
    live: AtomicUsize,
    capacity: usize,
    default_timeout: Duration,
}

impl RenderPool {
    pub fn new(
        capacity: usize,
        launcher: ChromeLauncher,
        policy: UrlPolicy,
        default_timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            policy,
            semaphore: Arc::new(Semaphore::new(capacity.max(1))),
            idle: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            capacity: capacity.max(1),
            default_timeout,
        }
    }

    /// Startup self-test: render a fixed page to PDF and check the result
    /// looks like one. A worker that cannot produce a PDF must not claim
    /// jobs.
    pub async fn canary(&self) -> Result<(), RenderError> {
        let opts = RenderOptions::pdf(PaperFormat::A4, false, self.default_timeout);
        let bytes = self.render(CANARY_HTML, &opts).await?;

        if bytes.len() < CANARY_MIN_BYTES {
            return Err(RenderError::Canary(format!(
                "canary PDF is only {} bytes",
                bytes.len()
            )));
        }
        if !bytes.starts_with(b"%PDF-") {
            return Err(RenderError::Canary(
                "canary output is not a PDF".to_string(),
            ));
        }
        debug!(size = bytes.len(), "render canary passed");
        Ok(())
    }

    /// Health probe: launch a browser and close it again.
    pub async fn probe(&self) -> Result<(), RenderError> {
        let launcher = self.launcher.clone();
        tokio::task::spawn_blocking(move || launcher.launch_and_close())
            .await
            .map_err(|e| RenderError::Launch(format!("probe task failed: {e}")))?
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.idle.lock().expect("render pool mutex poisoned").len();
        PoolStats {
            total: self.live.load(Ordering::Relaxed),
            in_use: self.capacity - self.semaphore.available_permits(),
            available,
            capacity: self.capacity,
        }
    }

    /// Close every idle browser. In-flight renders keep their instance
    /// until they finish; those browsers are dropped on release.
    pub async fn drain(&self) {
        let browsers: Vec<Browser> = {
            let mut idle = self.idle.lock().expect("render pool mutex poisoned");
            idle.drain(..).collect()
        };
        let count = browsers.len();
        self.live.fetch_sub(count, Ordering::Relaxed);
        if count > 0 {
            let _ = tokio::task::spawn_blocking(move || drop(browsers)).await;
            debug!(count, "drained render pool");
        }
    }

    fn checkout(&self) -> Option<Browser> {
        self.idle
            .lock()
            .expect("render pool mutex poisoned")
            .pop()
    }

    fn release(&self, browser: Browser) {
        self.idle
            .lock()
            .expect("render pool mutex poisoned")
            .push(browser);
    }

    async fn checkout_or_launch(&self) -> Result<Browser, RenderError> {
        if let Some(browser) = self.checkout() {
            return Ok(browser);
        }
        let launcher = self.launcher.clone();
        let browser = tokio::task::spawn_blocking(move || launcher.launch())
            .await
            .map_err(|e| RenderError::Launch(format!("launch task failed: {e}")))??;
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(browser)
    }
}

#[async_trait]
impl Renderer for RenderPool {
    async fn render(&self, html: &str, opts: &RenderOptions) -> Result<Vec<u8>, RenderError> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RenderError::Page("render pool is closed".to_string()))?;

        let browser = self.checkout_or_launch().await?;

        let html = html.to_owned();
        let opts = opts.clone();
        let policy = self.policy.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = chrome::render_once(&browser, &html, &opts, &policy);
            (browser, result)
        })
        .await;

        match joined {
            Ok((browser, Ok(bytes))) => {
                self.release(browser);
                Ok(bytes)
            }
            Ok((browser, Err(err))) => {
                // Page-level failures keep the browser; launch/transport
                // failures mean the instance is gone.
                if matches!(err, RenderError::Launch(_)) {
                    warn!(error = %err, "dropping unhealthy browser instance");
                    self.live.fetch_sub(1, Ordering::Relaxed);
                    drop(browser);
                } else {
                    self.release(browser);
                }
                Err(err)
            }
            Err(join_err) => {
                self.live.fetch_sub(1, Ordering::Relaxed);
                Err(RenderError::Page(format!("render task panicked: {join_err}")))
            }
        }
    }
}
