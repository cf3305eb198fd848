use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::BrowserError;
use crate::pacing;

/// Opaque handle to an element in the live document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Element(pub String);

/// Element geometry in page coordinates (CSS pixels).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// The browser automation capabilities the harvester relies on. Selectors are CSS.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;
    async fn current_url(&self) -> Result<String, BrowserError>;

    async fn find_all(&self, selector: &str) -> Result<Vec<Element>, BrowserError>;
    async fn find_within(
        &self,
        parent: &Element,
        selector: &str,
    ) -> Result<Vec<Element>, BrowserError>;

    /// Attribute value, or the DOM property for `outerHTML` / `innerHTML`.
    async fn attribute(&self, el: &Element, name: &str) -> Result<Option<String>, BrowserError>;
    async fn text(&self, el: &Element) -> Result<String, BrowserError>;
    async fn is_displayed(&self, el: &Element) -> Result<bool, BrowserError>;
    async fn rect(&self, el: &Element) -> Result<Rect, BrowserError>;

    async fn click(&self, el: &Element) -> Result<(), BrowserError>;
    async fn type_text(&self, el: &Element, text: &str) -> Result<(), BrowserError>;
    async fn press_escape(&self) -> Result<(), BrowserError>;

    async fn scroll_to(&self, y: f64) -> Result<(), BrowserError>;
    async fn scroll_y(&self) -> Result<f64, BrowserError>;

    /// PNG of one element.
    async fn element_screenshot(&self, el: &Element) -> Result<Vec<u8>, BrowserError>;

    async fn move_pointer(&self, _x: i64, _y: i64) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn quit(&self) -> Result<(), BrowserError>;
}

/// Creates a fresh browser for each login.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Browser>, BrowserError>;
}

/// Poll `check` every `poll` until it yields true or `timeout` elapses.
/// Returns whether the condition was met; errors from `check` propagate.
pub async fn wait_until<F, Fut>(
    timeout: Duration,
    poll: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<bool, BrowserError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, BrowserError>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        pacing::sleep(poll, cancel).await?;
    }
}

/// First element matching `selector`, waiting up to `timeout` for one to appear.
pub async fn wait_for_element(
    browser: &dyn Browser,
    selector: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Element, BrowserError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(el) = browser.find_all(selector).await?.into_iter().next() {
            return Ok(el);
        }
        if Instant::now() >= deadline {
            return Err(BrowserError::Timeout(timeout, selector.to_string()));
        }
        pacing::sleep(Duration::from_millis(250), cancel).await?;
    }
}

/// Scroll `el` into the upper part of the viewport and click it.
/// Returns false instead of failing when the element cannot be clicked.
pub async fn make_visible_and_click(browser: &dyn Browser, el: &Element) -> bool {
    let attempt = async {
        let rect = browser.rect(el).await?;
        browser.scroll_to((rect.y - 150.0).max(0.0)).await?;
        browser.click(el).await
    };
    match attempt.await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "click failed");
            false
        }
    }
}
