use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use scraper::{Html, Selector};

use super::first_text_within;
use crate::normalize::date_from_text;
use crate::parser::{text_of, CommentAuthor, StoryComment};

/// One rendered comment. Also counted by the extractor while expanding.
pub const BLOCK_SELECTOR: &str = r#"div[class*="UFICommentContentBlock"]"#;
/// "View more comments" pagers and "N replies" links.
pub const EXPANDER_SELECTOR: &str = r#"a[class="UFIPagerLink"], a[class="UFICommentLink"]"#;
/// Comment filter popover ("Most relevant" / "All comments (unfiltered)").
pub const MODE_LINK_SELECTOR: &str =
    r#"div[class*="UFILikeSentence"] div[class="_3scp"] div[class*="uiPopover"] > a"#;
pub const MODE_MENU_SELECTOR: &str = r#"ul[class="_54nf"] div[class="_3scn"]"#;

static BLOCKS: LazyLock<Selector> = LazyLock::new(|| Selector::parse(BLOCK_SELECTOR).unwrap());
static TIMESTAMP: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"abbr[class*="livetimestamp"]"#).unwrap());
static BODY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"span[class="UFICommentBody"]"#).unwrap());
static ACTORS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[class*="UFICommentActorName"]"#).unwrap());

static HOST_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^https?://[^/]+/").unwrap());
static QUERY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\?.*$").unwrap());
static SKIP_EXPANDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Hide.*Repl|Write\sa").unwrap());
static UNFILTERED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(unfiltered\)").unwrap());

pub fn extract(doc: &Html, now: NaiveDateTime) -> Vec<StoryComment> {
    doc.select(&BLOCKS)
        .map(|block| {
            let date = block
                .select(&TIMESTAMP)
                .next()
                .and_then(|abbr| abbr.value().attr("title"))
                .map(|title| date_from_text(title, now))
                .unwrap_or(now);
            let authors = block
                .select(&ACTORS)
                .map(|a| CommentAuthor {
                    name: text_of(a),
                    user_id: user_path(a.value().attr("href").unwrap_or_default()),
                })
                .collect();
            StoryComment {
                date,
                text: first_text_within(block, &BODY),
                authors,
            }
        })
        .collect()
}

/// Profile path of a commenter link, without host or query.
fn user_path(href: &str) -> String {
    let path = HOST_RE.replace(href, "");
    QUERY_RE.replace(&path, "").trim().to_string()
}

/// Links that collapse threads or open the reply box are never clicked.
pub fn is_skipped_expander(text: &str) -> bool {
    SKIP_EXPANDER_RE.is_match(text)
}

/// Comments an expander link promises: its first integer word, else 1.
pub fn expander_increment(text: &str) -> i64 {
    text.split_whitespace()
        .find_map(|w| w.parse::<i64>().ok())
        .unwrap_or(1)
}

pub fn is_unfiltered_label(text: &str) -> bool {
    UNFILTERED_RE.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn reads_comment_blocks() {
        let now = NaiveDate::from_ymd_opt(2017, 5, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let doc = Html::parse_fragment(
            r#"<div><div class="UFICommentContentBlock">
                 <a class="UFICommentActorName" href="https://www.facebook.com/bob.smith?fref=ufi">Bob Smith</a>
                 <span class="UFICommentBody">Nice <b>one</b></span>
                 <abbr class="livetimestamp" title="Thursday, April 6, 2017 at 9:05am">1d</abbr>
               </div>
               <div class="UFICommentContentBlock"><span class="UFICommentBody">anon</span></div></div>"#,
        );
        let c = extract(&doc, now);
        assert_eq!(c.len(), 2);
        assert_eq!(c[0].text, "Nice one");
        assert_eq!(c[0].authors[0].name, "Bob Smith");
        assert_eq!(c[0].authors[0].user_id, "bob.smith");
        assert_eq!(c[0].date, NaiveDate::from_ymd_opt(2017, 4, 6).unwrap().and_hms_opt(9, 5, 0).unwrap());
        assert_eq!(c[1].date, now);
        assert!(c[1].authors.is_empty());
    }

    #[test]
    fn expander_rules() {
        assert!(is_skipped_expander("Hide 3 Replies"));
        assert!(is_skipped_expander("Write a reply..."));
        assert!(!is_skipped_expander("View 12 more comments"));
        assert_eq!(expander_increment("View 12 more comments"), 12);
        assert_eq!(expander_increment("View previous replies"), 1);
        assert!(is_unfiltered_label("All Comments (unfiltered)"));
    }
}
