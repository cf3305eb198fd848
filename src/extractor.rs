use std::collections::HashSet;
use std::time::Duration;

use chrono::Local;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::{make_visible_and_click, wait_for_element, wait_until, Browser, Element};
use crate::config::{BrowserSettings, HarvestSettings};
use crate::error::{BrowserError, ExtractError};
use crate::pacing::{self, Cancelled};
use crate::parser::extract::comments;
use crate::parser::{self, CapturedImage, Story};

const MAX_FRUITLESS_SCANS: u32 = 3;
const STABILIZATION_POLLS: u32 = 12;
const STABILIZATION_POLL: Duration = Duration::from_millis(250);
const LOADING_MARKER_POLLS: u32 = 100;
const LOADING_MARKER_POLL: Duration = Duration::from_millis(50);
const IMAGE_SELECTOR: &str = r#"img[class*="img"]"#;
const PERMALINK_SELECTOR: &str = r#"div[class*="_5u5j"] a[class="_5pcq"]"#;

/// Which feed layout is being read. Selects the unit selector and id scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    /// Someone else's timeline.
    #[default]
    User,
    /// The logged-in persona's news feed.
    Own,
    Page,
}

impl FeedKind {
    pub fn unit_selector(self) -> &'static str {
        match self {
            FeedKind::User => r#"div[id*="tl_unit_"]"#,
            FeedKind::Own => r#"div[id*="hyperfeed_story_id_"]"#,
            FeedKind::Page => r#"div._427x > div[class*="_4-u2"]"#,
        }
    }

    fn id_prefix(self) -> Option<&'static str> {
        match self {
            FeedKind::User => Some("tl_unit_"),
            FeedKind::Own => Some("hyperfeed_story_id_"),
            FeedKind::Page => None,
        }
    }
}

/// What the caller wants after receiving a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Previously seen content reached; stop paginating this page.
    StopPage,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub feed_kind: FeedKind,
    pub max_stories: usize,
    pub expand_comments: bool,
    pub get_images: bool,
    pub min_image_size: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub obfuscate: bool,
    pub viewport: (u32, u32),
    pub wait: Duration,
}

impl ExtractOptions {
    pub fn from_settings(harvest: &HarvestSettings, browser: &BrowserSettings) -> Self {
        Self {
            feed_kind: harvest.feed_kind,
            max_stories: harvest.max_stories,
            expand_comments: harvest.expand_comments,
            get_images: harvest.get_images,
            min_image_size: f64::from(harvest.min_image_size),
            min_delay: Duration::from_secs(harvest.story_min_delay_secs),
            max_delay: Duration::from_secs(harvest.story_max_delay_secs),
            obfuscate: harvest.obfuscate,
            viewport: (browser.width, browser.height),
            wait: browser.wait(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSummary {
    pub stories: usize,
    /// Units skipped for a location anomaly (revisited on a later scan).
    pub skipped: usize,
    /// Units that failed to parse and were dropped.
    pub failed: usize,
    /// The sink asked to stop.
    pub stopped: bool,
    pub comment_selectors: usize,
    pub unfiltered: usize,
}

enum UnitOutcome {
    Story(Box<Story>, f64),
    Anomaly,
}

/// Scan the loaded page for content units, yielding each new story to `sink`.
///
/// Ends after `max_stories`, after three consecutive scans without a new unit,
/// or when `sink` returns [`Flow::StopPage`].
pub async fn extract_page<F>(
    browser: &dyn Browser,
    opts: &ExtractOptions,
    cancel: &CancellationToken,
    mut sink: F,
) -> Result<PageSummary, ExtractError>
where
    F: FnMut(Story) -> Flow,
{
    let selector = opts.feed_kind.unit_selector();
    wait_for_element(browser, selector, opts.wait, cancel).await?;
    browser.scroll_to(0.0).await?;

    let mut summary = PageSummary::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut fruitless = 0;
    let mut cur_y = 0.0;

    'scan: while summary.stories < opts.max_stories && fruitless < MAX_FRUITLESS_SCANS {
        pacing::check(cancel)?;
        let mut productive = false;

        for unit in browser.find_all(selector).await? {
            if summary.stories >= opts.max_stories {
                break;
            }
            let id = match story_id(browser, &unit, opts.feed_kind).await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    debug!("unit without id");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "unit id unreadable");
                    continue;
                }
            };
            if !seen.insert(id.clone()) {
                continue;
            }

            match analyze_unit(browser, &unit, &id, cur_y, opts, cancel).await {
                Ok(UnitOutcome::Story(story, new_y)) => {
                    productive = true;
                    cur_y = new_y;
                    summary.stories += 1;
                    summary.comment_selectors += usize::from(story.comment_selector);
                    summary.unfiltered += usize::from(story.comment_unfiltered);
                    info!(story_id = %id, kind = %story.kind, "story extracted");

                    if sink(*story) == Flow::StopPage {
                        info!(story_id = %id, "reached known content, stopping page");
                        summary.stopped = true;
                        break 'scan;
                    }
                    idle(browser, opts, cancel).await?;
                }
                Ok(UnitOutcome::Anomaly) => {
                    seen.remove(&id);
                    summary.skipped += 1;
                }
                Err(ExtractError::Cancelled) => return Err(ExtractError::Cancelled),
                Err(ExtractError::Browser(e)) => {
                    productive = true;
                    summary.failed += 1;
                    warn!(story_id = %id, error = %e, "unit dropped");
                }
            }
        }

        if productive {
            fruitless = 0;
        } else {
            fruitless += 1;
            debug!(fruitless, "scan found nothing new");
            pacing::sleep(Duration::from_secs(1), cancel).await?;
        }
    }

    info!(
        stories = summary.stories,
        selectors = summary.comment_selectors,
        unfiltered = summary.unfiltered,
        "page complete"
    );
    Ok(summary)
}

async fn analyze_unit(
    browser: &dyn Browser,
    unit: &Element,
    id: &str,
    cur_y: f64,
    opts: &ExtractOptions,
    cancel: &CancellationToken,
) -> Result<UnitOutcome, ExtractError> {
    let rect = browser.rect(unit).await?;
    if rect.x == 0.0 || rect.y == cur_y {
        debug!(story_id = id, x = rect.x, y = rect.y, "location anomaly, skipping");
        return Ok(UnitOutcome::Anomaly);
    }

    // overshoot to trigger lazy loading below, then settle on the unit's top
    let y_top = if rect.y > 100.0 { rect.y - 100.0 } else { 0.0 };
    browser.scroll_to(rect.y + rect.height + 50.0).await?;
    if opts.obfuscate {
        pacing::sleep(
            pacing::random_between(Duration::from_millis(100), Duration::from_millis(600)),
            cancel,
        )
        .await?;
    }
    browser.scroll_to(y_top).await?;
    let new_y = browser.scroll_y().await?;

    let shown = wait_until(opts.wait, STABILIZATION_POLL, cancel, move || {
        browser.is_displayed(unit)
    })
    .await?;
    if !shown {
        warn!(story_id = id, "unit never became visible");
    }
    wait_for_loading_marker(browser, unit, cancel).await?;

    let (mut selector, mut unfiltered) = (false, false);
    if opts.expand_comments {
        (selector, unfiltered) = select_unfiltered_comments(browser, unit, cancel).await?;
        expand_comments(browser, unit, cancel).await?;
    }

    let html = browser
        .attribute(unit, "outerHTML")
        .await?
        .unwrap_or_default();
    let mut story = parser::parse_story(id, &html, Local::now().naive_local());
    story.comment_selector = selector;
    story.comment_unfiltered = unfiltered;

    if opts.get_images {
        story.snapshot = Some(browser.element_screenshot(unit).await?);
        story.images = capture_images(browser, unit, opts.min_image_size).await?;
    }

    Ok(UnitOutcome::Story(Box::new(story), new_y))
}

/// Platform story id of a unit, per feed layout.
async fn story_id(
    browser: &dyn Browser,
    unit: &Element,
    kind: FeedKind,
) -> Result<Option<String>, BrowserError> {
    if let Some(prefix) = kind.id_prefix() {
        return Ok(browser
            .attribute(unit, "id")
            .await?
            .map(|id| id.replace(prefix, "").trim().to_string())
            .filter(|id| !id.is_empty()));
    }

    if let Some(id) = browser
        .attribute(unit, "data-ft")
        .await?
        .as_deref()
        .and_then(objid_from_data_ft)
    {
        return Ok(Some(id));
    }
    let Some(link) = browser.find_within(unit, PERMALINK_SELECTOR).await?.into_iter().next() else {
        return Ok(None);
    };
    Ok(browser
        .attribute(&link, "href")
        .await?
        .as_deref()
        .and_then(last_path_segment))
}

/// `tl_objid` from a unit's `data-ft` JSON, string or number.
pub fn objid_from_data_ft(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw).ok()?;
    match value.get("tl_objid")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn last_path_segment(href: &str) -> Option<String> {
    href.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `data-ft` disappears once the unit has finished loading.
async fn wait_for_loading_marker(
    browser: &dyn Browser,
    unit: &Element,
    cancel: &CancellationToken,
) -> Result<(), ExtractError> {
    for _ in 0..LOADING_MARKER_POLLS {
        if browser.attribute(unit, "data-ft").await?.is_none() {
            return Ok(());
        }
        pacing::sleep(LOADING_MARKER_POLL, cancel).await?;
    }
    debug!("loading marker still present");
    Ok(())
}

/// Switch the comment filter to its unfiltered mode when the unit offers one.
/// Returns `(selector found, unfiltered active)`.
async fn select_unfiltered_comments(
    browser: &dyn Browser,
    unit: &Element,
    cancel: &CancellationToken,
) -> Result<(bool, bool), BrowserError> {
    let Some(mode_link) = browser
        .find_within(unit, comments::MODE_LINK_SELECTOR)
        .await?
        .into_iter()
        .next()
    else {
        return Ok((false, false));
    };
    if !make_visible_and_click(browser, &mode_link).await {
        return Ok((false, false));
    }

    let menu_up = wait_until(
        Duration::from_secs(10),
        STABILIZATION_POLL,
        cancel,
        move || async move {
            Ok::<bool, BrowserError>(
                !browser.find_all(comments::MODE_MENU_SELECTOR).await?.is_empty(),
            )
        },
    )
    .await?;
    if !menu_up {
        debug!("comment mode menu did not open");
    }

    for item in browser.find_all(comments::MODE_MENU_SELECTOR).await? {
        if !browser.is_displayed(&item).await? {
            continue;
        }
        if !comments::is_unfiltered_label(&browser.text(&item).await?) {
            continue;
        }
        if !make_visible_and_click(browser, &item).await {
            browser.press_escape().await?;
            return Ok((false, false));
        }
        wait_until(
            Duration::from_secs(5),
            Duration::from_millis(50),
            cancel,
            move || async move {
                Ok::<bool, BrowserError>(
                    !browser.find_within(unit, comments::BLOCK_SELECTOR).await?.is_empty(),
                )
            },
        )
        .await?;
        break;
    }

    let label = browser.text(&mode_link).await.unwrap_or_default();
    Ok((true, comments::is_unfiltered_label(&label)))
}

/// Click pagers and reply links while they keep producing comments.
async fn expand_comments(
    browser: &dyn Browser,
    unit: &Element,
    cancel: &CancellationToken,
) -> Result<(), ExtractError> {
    loop {
        let before = count_comments(browser, unit).await?;
        let mut promised = 0;
        let mut clicked = false;

        for link in browser.find_within(unit, comments::EXPANDER_SELECTOR).await? {
            let text = browser.text(&link).await?;
            if comments::is_skipped_expander(&text) {
                continue;
            }
            promised += comments::expander_increment(&text);
            clicked |= make_visible_and_click(browser, &link).await;
        }
        if !clicked {
            return Ok(());
        }

        let mut after = before;
        for _ in 0..STABILIZATION_POLLS {
            after = count_comments(browser, unit).await?;
            if after >= before + promised {
                break;
            }
            pacing::sleep(STABILIZATION_POLL, cancel).await?;
        }
        debug!(before, after, promised, "comment expansion");
        if after <= before {
            return Ok(());
        }
    }
}

async fn count_comments(browser: &dyn Browser, unit: &Element) -> Result<i64, BrowserError> {
    Ok(browser
        .find_within(unit, comments::BLOCK_SELECTOR)
        .await?
        .len() as i64)
}

/// Element screenshots of the unit's images, skipping icons and avatars.
async fn capture_images(
    browser: &dyn Browser,
    unit: &Element,
    min_size: f64,
) -> Result<Vec<CapturedImage>, BrowserError> {
    let mut images = Vec::new();
    for img in browser.find_within(unit, IMAGE_SELECTOR).await? {
        let rect = browser.rect(&img).await?;
        if rect.width < min_size || rect.height < min_size {
            continue;
        }
        images.push(CapturedImage {
            src: browser.attribute(&img, "src").await?,
            png: browser.element_screenshot(&img).await?,
        });
    }
    Ok(images)
}

/// Randomized pause between stories, optionally moving the pointer around.
async fn idle(
    browser: &dyn Browser,
    opts: &ExtractOptions,
    cancel: &CancellationToken,
) -> Result<(), Cancelled> {
    let total = pacing::random_between(opts.min_delay, opts.max_delay);
    debug!(secs = total.as_secs(), "pausing between stories");
    if !opts.obfuscate {
        return pacing::sleep(total, cancel).await;
    }

    let deadline = Instant::now() + total;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        let (x, y) = pacing::random_point(opts.viewport.0, opts.viewport.1);
        if let Err(e) = browser.move_pointer(x, y).await {
            debug!(error = %e, "pointer move failed");
        }
        let step = pacing::random_between(Duration::from_millis(500), Duration::from_secs(2));
        pacing::sleep(step.min(deadline - now), cancel).await?;
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::FakeBrowser;
    use crate::parser::StoryType;

    fn options() -> ExtractOptions {
        ExtractOptions {
            feed_kind: FeedKind::User,
            max_stories: 100,
            expand_comments: false,
            get_images: true,
            min_image_size: 100.0,
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(15),
            obfuscate: true,
            viewport: (1200, 2000),
            wait: Duration::from_secs(15),
        }
    }

    async fn run(browser: &FakeBrowser, opts: &ExtractOptions) -> (PageSummary, Vec<Story>) {
        let mut stories = Vec::new();
        let summary = extract_page(browser, opts, &CancellationToken::new(), |s| {
            stories.push(s);
            Flow::Continue
        })
        .await
        .unwrap();
        (summary, stories)
    }

    #[tokio::test]
    async fn three_unit_feed() {
        tokio::time::pause();
        let browser = FakeBrowser::from_fixture("feed_user");
        let (summary, stories) = run(&browser, &options()).await;

        assert_eq!(summary.stories, 3);
        let kinds: Vec<String> = stories.iter().map(|s| s.kind.to_string()).collect();
        assert_eq!(kinds, vec!["sponsored", "post", "share/photo"]);
        assert_eq!(stories[0].kind, StoryType::Sponsored);
        assert!(stories[0].sponsored);

        let post = &stories[1];
        assert_eq!(post.id, "1002");
        assert_eq!(post.images.len(), 1);
        assert_eq!(post.images[0].src.as_deref(), Some("https://cdn.example.com/lake.jpg"));
        assert!(post.snapshot.is_some());
        assert!(post.html.contains("tl_unit_1002"));
    }

    #[tokio::test]
    async fn sink_stop_ends_pagination() {
        tokio::time::pause();
        let browser = FakeBrowser::from_fixture("feed_user");
        let mut ids = Vec::new();
        let summary = extract_page(&browser, &options(), &CancellationToken::new(), |s| {
            ids.push(s.id.clone());
            if s.id == "1002" {
                Flow::StopPage
            } else {
                Flow::Continue
            }
        })
        .await
        .unwrap();

        assert!(summary.stopped);
        assert_eq!(ids, vec!["1001", "1002"]);
    }

    #[tokio::test]
    async fn max_stories_caps_the_page() {
        tokio::time::pause();
        let browser = FakeBrowser::from_fixture("feed_user");
        let opts = ExtractOptions {
            max_stories: 2,
            get_images: false,
            ..options()
        };
        let (summary, stories) = run(&browser, &opts).await;
        assert_eq!(summary.stories, 2);
        assert!(stories.iter().all(|s| s.images.is_empty() && s.snapshot.is_none()));
    }

    #[tokio::test]
    async fn anomalous_units_are_revisited_then_abandoned() {
        tokio::time::pause();
        let browser = FakeBrowser::new(
            r#"<html><body>
            <div id="tl_unit_7" data-rect="0,300,500,200"><h5 class="_5vra"><a>Ghost</a></h5></div>
            </body></html>"#,
        );
        let (summary, stories) = run(&browser, &options()).await;
        assert!(stories.is_empty());
        assert_eq!(summary.skipped, 3);
    }

    #[tokio::test]
    async fn comment_pagers_are_clicked_until_no_growth() {
        tokio::time::pause();
        let browser = FakeBrowser::from_fixture("feed_user");
        let opts = ExtractOptions {
            expand_comments: true,
            ..options()
        };
        let (_, stories) = run(&browser, &opts).await;
        assert_eq!(stories.len(), 3);
        // one click per pager; the static page never grows
        assert_eq!(
            browser.clicks(),
            vec!["View 5 more comments".to_string()]
        );
        assert_eq!(stories[1].comments_count, 7);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let browser = FakeBrowser::from_fixture("feed_user");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = extract_page(&browser, &options(), &cancel, |_| Flow::Continue)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Cancelled));
    }

    const LOADING_UNIT: &str =
        r#"<html><body><div class="unit" data-ft='{"tl_objid":"1"}'>text</div></body></html>"#;

    #[tokio::test]
    async fn loading_marker_wait_ends_when_marker_clears() {
        tokio::time::pause();
        let browser = FakeBrowser::new(LOADING_UNIT).with_fading_attribute("data-ft", 4);
        let unit = browser.find_all("div.unit").await.unwrap().remove(0);

        let started = Instant::now();
        wait_for_loading_marker(&browser, &unit, &CancellationToken::new())
            .await
            .unwrap();
        // four reads still see the marker, the fifth does not
        assert_eq!(browser.fading_reads(), 5);
        let waited = started.elapsed();
        assert!(waited >= LOADING_MARKER_POLL * 4 && waited < LOADING_MARKER_POLL * 5);
    }

    #[tokio::test]
    async fn loading_marker_wait_gives_up_after_poll_budget() {
        tokio::time::pause();
        let browser = FakeBrowser::new(LOADING_UNIT);
        let unit = browser.find_all("div.unit").await.unwrap().remove(0);

        let started = Instant::now();
        wait_for_loading_marker(&browser, &unit, &CancellationToken::new())
            .await
            .unwrap();
        let waited = started.elapsed();
        assert!(waited >= LOADING_MARKER_POLL * LOADING_MARKER_POLLS);
        assert!(waited < LOADING_MARKER_POLL * (LOADING_MARKER_POLLS + 1));
    }

    #[test]
    fn page_feed_ids() {
        assert_eq!(
            objid_from_data_ft(r#"{"tl_objid":"1234567890","qid":"1"}"#).as_deref(),
            Some("1234567890")
        );
        assert_eq!(objid_from_data_ft(r#"{"tl_objid":42}"#).as_deref(), Some("42"));
        assert_eq!(objid_from_data_ft("not json"), None);
        assert_eq!(
            last_path_segment("https://www.facebook.com/acme/posts/998877/").as_deref(),
            Some("998877")
        );
    }

    #[tokio::test]
    async fn page_feed_reads_permalink_ids() {
        tokio::time::pause();
        let browser = FakeBrowser::new(
            r#"<html><body><div class="_427x">
              <div class="_4-u2 _4-u8" data-rect="10,200,500,300">
                <div class="_5u5j"><a class="_5pcq" href="https://www.facebook.com/acme/posts/5551/">2h</a></div>
                <h5 class="_5vra"><a href="https://www.facebook.com/acme">Acme</a></h5>
              </div></div></body></html>"#,
        );
        let opts = ExtractOptions {
            feed_kind: FeedKind::Page,
            ..options()
        };
        let (_, stories) = run(&browser, &opts).await;
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].id, "5551");
        assert_eq!(stories[0].authors[0].name, "Acme");
    }
}
