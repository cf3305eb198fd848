use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::warn;

use crate::normalize::value_from_text;
use crate::parser::text_of;

static LIKE_TOTALS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[class="_2x4v"] > span[class="_4arz"]"#).unwrap());
static REACTIONS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"span[class="_3t54"] > a[class="_3emk"]"#).unwrap());
static MORE_COMMENTS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[class*="UFIPagerLink"]"#).unwrap());
static SHARE_LINKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[class*="UFIShareLink"]"#).unwrap());

static REACTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s(.+)").unwrap());
static PAGER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^View\s+(.+?)\s+more comments?$").unwrap());
static SHARES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+shares?$").unwrap());

/// `{"total": n, "<reaction>": n, …}`. Unreadable counts are logged and skipped.
pub fn likes(doc: &Html) -> BTreeMap<String, i64> {
    let mut values = BTreeMap::new();

    for span in doc.select(&LIKE_TOTALS) {
        let text = text_of(span);
        match value_from_text(&text) {
            Ok(n) => *values.entry("total".to_string()).or_insert(0) += n,
            Err(e) => warn!(error = %e, "like total unreadable"),
        }
    }

    for link in doc.select(&REACTIONS) {
        let label = link.value().attr("aria-label").unwrap_or_default();
        let Some(caps) = REACTION_RE.captures(label) else {
            warn!(label, "unrecognized reaction pattern");
            continue;
        };
        match value_from_text(&caps[1]) {
            Ok(n) => *values.entry(caps[2].trim().to_string()).or_insert(0) += n,
            Err(e) => warn!(error = %e, "reaction count unreadable"),
        }
    }

    values
}

/// Sum of the "View N more comments" pagers.
pub fn more_comments(doc: &Html) -> i64 {
    doc.select(&MORE_COMMENTS)
        .filter_map(|a| {
            let text = text_of(a);
            let caps = PAGER_RE.captures(&text)?;
            value_from_text(&caps[1]).ok()
        })
        .filter(|n| *n > 0)
        .sum()
}

/// Share count from the last share link; 0 when absent or unreadable.
pub fn shares(doc: &Html) -> i64 {
    doc.select(&SHARE_LINKS)
        .last()
        .map(|a| {
            let text = text_of(a);
            value_from_text(&SHARES_RE.replace(&text, "")).unwrap_or_else(|e| {
                warn!(error = %e, "share count unreadable");
                0
            })
        })
        .unwrap_or(0)
}
