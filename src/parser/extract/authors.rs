use std::sync::LazyLock;

use itertools::Itertools;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::parser::{text_of, Author, SharedKind, SharedObject};

/// Tried in order; the first set that yields any author wins.
/// Multi-author header, single-author header, then wall-post sub header.
static AUTHOR_LINKS: LazyLock<[Selector; 3]> = LazyLock::new(|| {
    [
        Selector::parse(r#"div[class*="_5x46"] a[class*="profileLink"]"#).unwrap(),
        Selector::parse(r#"h5[class*="_5vra"] a"#).unwrap(),
        Selector::parse(r#"h6[class*="_5vra"] a"#).unwrap(),
    ]
});
static NUMERIC_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.php\?id=(\d+)(?:&|$)").unwrap());
static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.com/([^?]+)(?:\?|$)").unwrap());

const LOCATION_ICON_CLASS: &str = "_51mq";

/// Deduplicated authors, plus location links found among the header links.
pub fn extract(doc: &Html) -> (Vec<Author>, Vec<SharedObject>) {
    let mut locations = Vec::new();

    for sel in AUTHOR_LINKS.iter() {
        let mut found = Vec::new();
        for link in doc.select(sel) {
            if follows_location_icon(link) {
                locations.push(SharedObject {
                    kind: SharedKind::Location,
                    target: link.value().attr("href").map(str::to_string),
                });
                continue;
            }
            let name = text_of(link);
            if name.is_empty() || name == "posted" || SharedKind::from_header_label(&name).is_some()
            {
                continue;
            }
            found.push(Author {
                username: link.value().attr("href").map(username_from_href),
                user_id: link
                    .value()
                    .attr("data-hovercard")
                    .and_then(|h| NUMERIC_ID_RE.captures(h))
                    .map(|c| c[1].to_string()),
                name,
            });
        }

        if !found.is_empty() {
            return (found.into_iter().unique().collect(), locations);
        }
    }

    (Vec::new(), locations)
}

fn follows_location_icon(link: ElementRef<'_>) -> bool {
    link.prev_siblings()
        .find_map(ElementRef::wrap)
        .is_some_and(|prev| {
            prev.value().name() == "i"
                && prev
                    .value()
                    .attr("class")
                    .is_some_and(|c| c.split_whitespace().any(|cls| cls == LOCATION_ICON_CLASS))
        })
}

/// Numeric id for personal profiles, path for vanity names and pages.
pub fn username_from_href(href: &str) -> String {
    if let Some(c) = NUMERIC_ID_RE.captures(href) {
        return c[1].to_string();
    }
    if let Some(c) = USERNAME_RE.captures(href) {
        return c[1].to_string();
    }
    href.to_string()
}
