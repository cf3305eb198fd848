use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

use super::header::Header;
use super::{first_text, text_of, ProfileUpdate, SharedKind, SharedObject, StoryType};

static MEMORY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"shared a memory").unwrap());
static SHARED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"shared").unwrap());
static LIKED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"liked").unwrap());
static COMMENTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"commented on this").unwrap());
static PROFILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"updated (?:his|her|their) (profile picture|cover photo|profile video)").unwrap()
});
static WALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"friends? \x{200B}?posted\x{200B}? on \S+ Timeline").unwrap()
});
static PYMK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"People you may know").unwrap());

static LIFE_EVENT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"a[class="_39g6"]"#).unwrap());
static SUGGESTION_BAR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.fwn.fcg").unwrap());

/// Priority-ordered decision table; the first matching rule wins.
/// Life events also append their labels to `shared`.
pub fn classify(doc: &Html, header: &Header, shared: &mut Vec<SharedObject>) -> StoryType {
    if header.sponsored {
        return StoryType::Sponsored;
    }

    let main = header.main.as_str();
    if MEMORY_RE.is_match(main) {
        return StoryType::Memory;
    }
    if SHARED_RE.is_match(main) || LIKED_RE.is_match(main) {
        let sub = shared.first().map(|s| s.kind);
        return if SHARED_RE.is_match(main) {
            StoryType::Share(sub)
        } else {
            StoryType::Like(sub)
        };
    }
    if COMMENTED_RE.is_match(main) {
        return StoryType::Comment;
    }
    if let Some(caps) = PROFILE_RE.captures(main) {
        let update = match &caps[1] {
            "profile picture" => ProfileUpdate::Picture,
            "cover photo" => ProfileUpdate::Cover,
            _ => ProfileUpdate::Video,
        };
        return StoryType::Narcissistic(update);
    }
    if WALL_RE.is_match(main) {
        return StoryType::Wall;
    }

    let events: Vec<String> = doc.select(&LIFE_EVENT).map(text_of).collect();
    if !events.is_empty() {
        shared.extend(events.into_iter().map(|label| SharedObject {
            kind: SharedKind::LifeEvent,
            target: Some(label),
        }));
        return StoryType::LifeEvent;
    }

    if PYMK_RE.is_match(&first_text(doc, &SUGGESTION_BAR)) {
        return StoryType::PeopleYouMayKnow;
    }

    StoryType::Post
}
