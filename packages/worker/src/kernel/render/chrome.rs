//! Chromium driver: launches browsers and performs single renders.
//!
//! All functions here are synchronous and talk to the browser over the
//! DevTools protocol; callers bridge onto the async runtime with
//! `spawn_blocking`. Every render happens on a fresh page with scripting
//! disabled and request interception active.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use headless_chrome::protocol::cdp::Emulation;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::types::PrintToPdfOptions;
use headless_chrome::{Browser, LaunchOptions, Tab};

use super::intercept::{AllowlistInterceptor, UrlPolicy};
use super::{ImageFormat, RenderError, RenderOptions, RenderTarget};

const PDF_MARGIN_INCHES: f64 = 0.4;

/// Launch parameters shared by every browser in the pool.
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    pub executable: Option<PathBuf>,
}

impl ChromeLauncher {
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self { executable }
    }

    pub fn launch(&self) -> Result<Browser, RenderError> {
        let options = LaunchOptions {
            headless: true,
            sandbox: false,
            path: self.executable.clone(),
            window_size: Some((1280, 1696)),
            // The pool keeps browsers across renders; do not let the
            // library reap them between jobs.
            idle_browser_timeout: Duration::from_secs(86_400),
            args: vec![
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--hide-scrollbars"),
                OsStr::new("--font-render-hinting=none"),
            ],
            ..Default::default()
        };

        Browser::new(options).map_err(|e| RenderError::Launch(e.to_string()))
    }

    /// Health probe: launch a browser and close it again.
    pub fn launch_and_close(&self) -> Result<(), RenderError> {
        let browser = self.launch()?;
        drop(browser);
        Ok(())
    }
}

/// Render HTML on a fresh page of an already-running browser.
pub fn render_once(
    browser: &Browser,
    html: &str,
    opts: &RenderOptions,
    policy: &UrlPolicy,
) -> Result<Vec<u8>, RenderError> {
    let tab = browser
        .new_tab()
        .map_err(|e| RenderError::Launch(format!("failed to open page: {e}")))?;

    let result = render_on_tab(&tab, html, opts, policy);

    // The page is closed on every exit path; the browser itself survives.
    let _ = tab.close(true);

    result
}

fn render_on_tab(
    tab: &Arc<Tab>,
    html: &str,
    opts: &RenderOptions,
    policy: &UrlPolicy,
) -> Result<Vec<u8>, RenderError> {
    tab.set_default_timeout(opts.timeout);

    // Renders are CSS-only by contract; user-authored markup never gets to
    // execute scripts.
    tab.call_method(Emulation::SetScriptExecutionDisabled { value: true })
        .map_err(|e| map_page_error(e, opts))?;

    tab.enable_fetch(None, None)
        .map_err(|e| map_page_error(e, opts))?;
    tab.enable_request_interception(AllowlistInterceptor::new(policy.clone()))
        .map_err(|e| map_page_error(e, opts))?;

    let url = format!("data:text/html;base64,{}", BASE64.encode(html));
    tab.navigate_to(&url).map_err(|e| map_page_error(e, opts))?;
    tab.wait_until_navigated()
        .map_err(|e| map_page_error(e, opts))?;

    match opts.target {
        RenderTarget::Pdf => tab
            .print_to_pdf(Some(pdf_options(opts)))
            .map_err(|e| map_page_error(e, opts)),
        RenderTarget::Image {
            format, quality, ..
        } => {
            let format = match format {
                ImageFormat::Png => CaptureScreenshotFormatOption::Png,
                ImageFormat::Jpeg => CaptureScreenshotFormatOption::Jpeg,
            };
            tab.capture_screenshot(format, quality, None, true)
                .map_err(|e| map_page_error(e, opts))
        }
    }
}

fn pdf_options(opts: &RenderOptions) -> PrintToPdfOptions {
    let (width, height) = opts.paper.dimensions_inches();
    PrintToPdfOptions {
        landscape: Some(opts.landscape),
        display_header_footer: Some(false),
        print_background: Some(true),
        paper_width: Some(width),
        paper_height: Some(height),
        margin_top: Some(PDF_MARGIN_INCHES),
        margin_bottom: Some(PDF_MARGIN_INCHES),
        margin_left: Some(PDF_MARGIN_INCHES),
        margin_right: Some(PDF_MARGIN_INCHES),
        prefer_css_page_size: Some(true),
        ..Default::default()
    }
}

fn map_page_error(err: anyhow::Error, opts: &RenderOptions) -> RenderError {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("timeout") || lowered.contains("timed out") {
        RenderError::Timeout(opts.timeout)
    } else {
        RenderError::Page(message)
    }
}
