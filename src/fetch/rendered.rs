//! Headless-browser fetches for pages whose links are built by script.
//!
//! Each fetch launches a `chromiumoxide` session, navigates, waits for the
//! configured condition, optionally scrolls to trigger lazy loading, and
//! returns the serialized DOM. With `captureApi` on, JSON responses the page
//! requested in the background are returned too, since many vendor download
//! centres render their file lists from an XHR.
//!
//! The page and browser are closed explicitly on the success path; guards
//! close them from `Drop` on every other path (error, timeout, cancel).

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, GetResponseBodyParams, RequestId,
};
use futures_util::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};
use url::Url;

use super::{CapturedResponse, FetchError, FetchStrategy, RawContent};
use crate::config::FetchStrategyKind;

/// Pause between scroll passes so lazy content can load.
const SCROLL_PAUSE: Duration = Duration::from_millis(400);

/// Poll interval while waiting for a selector.
const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// Upper bound on captured background responses per page.
const MAX_CAPTURED: usize = 32;

const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight)";

/// What the session waits for after navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitCondition {
    /// Navigation load event only.
    DomReady,
    /// An element matching the CSS selector exists.
    Selector(String),
    /// A fixed settle time after load.
    Settle(Duration),
}

impl WaitCondition {
    /// Parses `domReady`, `selector:<css>` or `settle:<ms>`.
    ///
    /// # Errors
    ///
    /// Returns a reason string for unknown forms or a bad duration.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("domready") {
            return Ok(Self::DomReady);
        }
        if let Some(css) = raw.strip_prefix("selector:") {
            let css = css.trim();
            if css.is_empty() {
                return Err("`waitFor` selector is empty".to_string());
            }
            return Ok(Self::Selector(css.to_string()));
        }
        if let Some(ms) = raw.strip_prefix("settle:") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| format!("`waitFor` settle time {ms:?} is not milliseconds"))?;
            return Ok(Self::Settle(Duration::from_millis(ms)));
        }
        Err(format!("unknown `waitFor` condition {raw:?}"))
    }
}

/// Parameters of a rendered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// Post-navigation wait.
    pub wait_for: WaitCondition,
    /// Number of scroll-to-bottom passes.
    pub scroll_passes: u32,
    /// Capture JSON background responses.
    pub capture_api: bool,
    /// Whole-session timeout; filled from run settings when unset.
    pub timeout: Option<Duration>,
    /// Launch Chromium with `--no-sandbox` (containers).
    pub no_sandbox: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            wait_for: WaitCondition::DomReady,
            scroll_passes: 0,
            capture_api: false,
            timeout: None,
            no_sandbox: false,
        }
    }
}

impl RenderOptions {
    /// Reads `waitFor`, `scroll`, `captureApi`, `timeoutSecs` and `noSandbox`.
    ///
    /// # Errors
    ///
    /// Returns a reason string when a parameter has the wrong type or form.
    pub fn from_params(params: &Map<String, Value>) -> Result<Self, String> {
        let mut options = Self::default();

        match params.get("waitFor") {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => options.wait_for = WaitCondition::parse(s)?,
            Some(_) => return Err("`waitFor` must be a string".to_string()),
        }

        options.scroll_passes = match params.get("scroll") {
            None | Some(Value::Null | Value::Bool(false)) => 0,
            Some(Value::Bool(true)) => 1,
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or("`scroll` must be a non-negative count")?,
            Some(_) => return Err("`scroll` must be a bool or a count".to_string()),
        };

        options.capture_api = bool_param(params, "captureApi")?;
        options.no_sandbox = bool_param(params, "noSandbox")?;

        options.timeout = match params.get("timeoutSecs") {
            None | Some(Value::Null) => None,
            Some(v) => Some(Duration::from_secs(
                v.as_u64()
                    .filter(|s| *s > 0)
                    .ok_or("`timeoutSecs` must be a positive integer")?,
            )),
        };

        Ok(options)
    }
}

fn bool_param(params: &Map<String, Value>, key: &str) -> Result<bool, String> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(format!("`{key}` must be a bool")),
    }
}

/// Fetches pages through a headless browser.
#[derive(Debug, Clone)]
pub struct RenderedStrategy {
    options: RenderOptions,
}

impl RenderedStrategy {
    /// Creates a strategy with the given session options.
    #[must_use]
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    /// Returns the session options.
    #[must_use]
    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    async fn render(&self, target: &Url) -> Result<RawContent, FetchError> {
        let url = target.as_str();
        let net = |e: &dyn std::fmt::Display| FetchError::network(url, e);

        let mut builder = BrowserConfig::builder();
        if let Some(timeout) = self.options.timeout {
            builder = builder.request_timeout(timeout);
        }
        if self.options.no_sandbox {
            builder = builder.no_sandbox();
        }
        let config = builder.build().map_err(|e| net(&e))?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(|e| net(&e))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        let session = BrowserSession::new(browser, handler_task);

        let page = session
            .browser()
            .new_page("about:blank")
            .await
            .map_err(|e| net(&e))?;
        let page = PageGuard::new(page, url);

        let capture = if self.options.capture_api {
            start_capture(page.page()).await
        } else {
            None
        };

        page.page().goto(url).await.map_err(|e| net(&e))?;
        wait_for(page.page(), &self.options.wait_for).await;

        for pass in 0..self.options.scroll_passes {
            if let Err(e) = page.page().evaluate(SCROLL_SCRIPT).await {
                debug!(pass, error = %e, "scroll pass failed");
                break;
            }
            tokio::time::sleep(SCROLL_PAUSE).await;
        }

        let html = page.page().content().await.map_err(|e| net(&e))?;
        let final_url = page
            .page()
            .url()
            .await
            .ok()
            .flatten()
            .and_then(|u| Url::parse(&u).ok())
            .unwrap_or_else(|| target.clone());

        let captured = match capture {
            Some(capture) => capture.collect(page.page()).await,
            None => Vec::new(),
        };

        debug!(
            bytes = html.len(),
            captured = captured.len(),
            "rendered page realized"
        );

        page.close().await;
        session.close().await;

        Ok(RawContent::Rendered {
            url: final_url,
            html,
            captured,
        })
    }
}

#[async_trait]
impl FetchStrategy for RenderedStrategy {
    fn kind(&self) -> FetchStrategyKind {
        FetchStrategyKind::Rendered
    }

    #[instrument(level = "debug", skip(self), fields(url = %target))]
    async fn fetch(&self, target: &Url) -> Result<RawContent, FetchError> {
        match self.options.timeout {
            Some(limit) => tokio::time::timeout(limit, self.render(target))
                .await
                .map_err(|_| FetchError::timeout(target.as_str()))?,
            None => self.render(target).await,
        }
    }
}

async fn wait_for(page: &Page, condition: &WaitCondition) {
    match condition {
        WaitCondition::DomReady => {}
        WaitCondition::Settle(delay) => tokio::time::sleep(*delay).await,
        WaitCondition::Selector(css) => loop {
            if page.find_element(css.as_str()).await.is_ok() {
                trace!(selector = %css, "selector present");
                break;
            }
            // The session timeout bounds this loop.
            tokio::time::sleep(SELECTOR_POLL).await;
        },
    }
}

/// Background collection of JSON response ids while a page loads.
struct ResponseCapture {
    rx: mpsc::UnboundedReceiver<(RequestId, String)>,
    task: JoinHandle<()>,
}

async fn start_capture(page: &Page) -> Option<ResponseCapture> {
    if let Err(e) = page.execute(EnableParams::default()).await {
        warn!(error = %e, "failed to enable network events, capture disabled");
        return None;
    }
    let mut events = match page.event_listener::<EventResponseReceived>().await {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "failed to subscribe to responses, capture disabled");
            return None;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if event.response.mime_type.to_ascii_lowercase().contains("json")
                && tx
                    .send((event.request_id.clone(), event.response.url.clone()))
                    .is_err()
            {
                break;
            }
        }
    });
    Some(ResponseCapture { rx, task })
}

impl ResponseCapture {
    async fn collect(mut self, page: &Page) -> Vec<CapturedResponse> {
        self.task.abort();
        let mut captured = Vec::new();
        while let Ok((request_id, url)) = self.rx.try_recv() {
            if captured.len() >= MAX_CAPTURED {
                debug!("capture limit reached, ignoring further responses");
                break;
            }
            let body = match page.execute(GetResponseBodyParams::new(request_id)).await {
                Ok(response) => response.result,
                Err(e) => {
                    debug!(url = %url, error = %e, "response body unavailable");
                    continue;
                }
            };
            if body.base64_encoded {
                continue;
            }
            match serde_json::from_str::<Value>(&body.body) {
                Ok(payload) => captured.push(CapturedResponse { url, payload }),
                Err(e) => debug!(url = %url, error = %e, "captured body is not JSON"),
            }
        }
        captured
    }
}

/// Closes its page when dropped without an explicit close.
struct PageGuard {
    page: Option<Page>,
    url: String,
    runtime: tokio::runtime::Handle,
}

impl PageGuard {
    fn new(page: Page, url: &str) -> Self {
        Self {
            page: Some(page),
            url: url.to_string(),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    fn page(&self) -> &Page {
        // Only `close` and `drop` take the page, and both consume the guard.
        match &self.page {
            Some(page) => page,
            None => unreachable!("page taken before guard was consumed"),
        }
    }

    async fn close(mut self) {
        if let Some(page) = self.page.take()
            && let Err(e) = page.close().await
        {
            debug!(url = %self.url, error = %e, "page close failed");
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            let url = std::mem::take(&mut self.url);
            self.runtime.spawn(async move {
                if let Err(e) = page.close().await {
                    debug!(url = %url, error = %e, "page cleanup on drop failed");
                }
            });
        }
    }
}

/// Owns a launched browser and its CDP handler task.
struct BrowserSession {
    browser: Option<Browser>,
    handler: Option<JoinHandle<()>>,
    runtime: tokio::runtime::Handle,
}

impl BrowserSession {
    fn new(browser: Browser, handler: JoinHandle<()>) -> Self {
        Self {
            browser: Some(browser),
            handler: Some(handler),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    fn browser(&self) -> &Browser {
        match &self.browser {
            Some(browser) => browser,
            None => unreachable!("browser taken before session was consumed"),
        }
    }

    async fn close(mut self) {
        if let Some(browser) = self.browser.take() {
            shutdown(browser).await;
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        let handler = self.handler.take();
        if let Some(browser) = self.browser.take() {
            self.runtime.spawn(async move {
                shutdown(browser).await;
                if let Some(handler) = handler {
                    handler.abort();
                }
            });
        } else if let Some(handler) = handler {
            handler.abort();
        }
    }
}

async fn shutdown(mut browser: Browser) {
    if let Err(e) = browser.close().await {
        debug!(error = %e, "browser close failed");
    }
    if let Err(e) = browser.wait().await {
        debug!(error = %e, "browser process wait failed");
    }
}
