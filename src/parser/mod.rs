pub mod extract;
pub mod header;
pub mod kind;

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;
use scraper::{ElementRef, Html, Selector};
use serde::{Serialize, Serializer};

use crate::normalize;

/// Canonical record extracted from one content unit.
#[derive(Debug, Clone, Serialize)]
pub struct Story {
    pub id: String,
    /// `None` when the unit carries no date at all; unparseable dates fall back to "now".
    pub date: Option<NaiveDateTime>,
    #[serde(rename = "type")]
    pub kind: StoryType,
    pub sponsored: bool,
    pub with: bool,
    pub shared: Vec<SharedObject>,
    pub authors: Vec<Author>,
    pub text: String,
    pub text_quoted: String,
    pub dates_quoted: Vec<NaiveDateTime>,
    /// `total` plus one entry per reaction label.
    pub likes: BTreeMap<String, i64>,
    pub comments: Vec<StoryComment>,
    pub comments_count: i64,
    pub shares: i64,
    pub comment_selector: bool,
    pub comment_unfiltered: bool,
    #[serde(skip)]
    pub images: Vec<CapturedImage>,
    /// PNG of the whole unit.
    #[serde(skip)]
    pub snapshot: Option<Vec<u8>>,
    #[serde(skip)]
    pub html: String,
}

impl Story {
    pub fn likes_total(&self) -> i64 {
        self.likes.get("total").copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub src: Option<String>,
    pub png: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedKind {
    Photo,
    Post,
    Link,
    Event,
    Video,
    #[serde(rename = "live video")]
    LiveVideo,
    Page,
    Location,
    LifeEvent,
}

impl SharedKind {
    /// Kinds that show up as plain link text in a header ("shared a <photo>").
    pub const HEADER_LABELS: [SharedKind; 7] = [
        SharedKind::Photo,
        SharedKind::Post,
        SharedKind::Link,
        SharedKind::Event,
        SharedKind::Video,
        SharedKind::LiveVideo,
        SharedKind::Page,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SharedKind::Photo => "photo",
            SharedKind::Post => "post",
            SharedKind::Link => "link",
            SharedKind::Event => "event",
            SharedKind::Video => "video",
            SharedKind::LiveVideo => "live video",
            SharedKind::Page => "page",
            SharedKind::Location => "location",
            SharedKind::LifeEvent => "life_event",
        }
    }

    pub fn from_header_label(text: &str) -> Option<Self> {
        Self::HEADER_LABELS.into_iter().find(|k| k.label() == text)
    }
}

impl fmt::Display for SharedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A typed reference discovered in a unit: href for links, text for life events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedObject {
    pub kind: SharedKind,
    pub target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileUpdate {
    Picture,
    Cover,
    Video,
}

/// Classification tag. Rendered as `post`, `share/photo`, `narcissistic/PP`…
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoryType {
    Post,
    Sponsored,
    Memory,
    Share(Option<SharedKind>),
    Like(Option<SharedKind>),
    Comment,
    Narcissistic(ProfileUpdate),
    Wall,
    LifeEvent,
    PeopleYouMayKnow,
}

impl fmt::Display for StoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoryType::Post => f.write_str("post"),
            StoryType::Sponsored => f.write_str("sponsored"),
            StoryType::Memory => f.write_str("memory"),
            StoryType::Share(None) => f.write_str("share"),
            StoryType::Share(Some(k)) => write!(f, "share/{k}"),
            StoryType::Like(None) => f.write_str("like"),
            StoryType::Like(Some(k)) => write!(f, "like/{k}"),
            StoryType::Comment => f.write_str("comment"),
            StoryType::Narcissistic(ProfileUpdate::Picture) => f.write_str("narcissistic/PP"),
            StoryType::Narcissistic(ProfileUpdate::Cover) => f.write_str("narcissistic/CP"),
            StoryType::Narcissistic(ProfileUpdate::Video) => f.write_str("narcissistic/PV"),
            StoryType::Wall => f.write_str("wall"),
            StoryType::LifeEvent => f.write_str("life_event"),
            StoryType::PeopleYouMayKnow => f.write_str("FB/PYMK"),
        }
    }
}

impl Serialize for StoryType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Author {
    pub name: String,
    /// Numeric platform id from the hovercard link.
    pub user_id: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentAuthor {
    pub name: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoryComment {
    pub date: NaiveDateTime,
    pub text: String,
    pub authors: Vec<CommentAuthor>,
}

/// Whitespace-normalized text content of an element.
pub(crate) fn text_of(el: ElementRef<'_>) -> String {
    normalize::squeeze(&el.text().collect::<Vec<_>>().join(" "))
}

/// Text of the first element matching `sel`, or empty.
pub(crate) fn first_text(doc: &Html, sel: &Selector) -> String {
    doc.select(sel).next().map(text_of).unwrap_or_default()
}

/// Header pass → type table → field extraction, over the unit's outer HTML.
pub fn parse_story(id: &str, html: &str, now: NaiveDateTime) -> Story {
    let doc = Html::parse_fragment(html);

    let head = header::read_header(&doc);
    let mut shared = header::shared_objects(&doc);
    let kind = kind::classify(&doc, &head, &mut shared);

    let (date, dates_quoted) = extract::dates::extract(&doc, now);
    let (text, text_quoted) = extract::text::extract(&doc);
    let (authors, locations) = extract::authors::extract(&doc);
    shared.extend(locations);

    let comments = extract::comments::extract(&doc, now);
    let comments_count = comments.len() as i64 + extract::counts::more_comments(&doc);

    Story {
        id: id.to_string(),
        date,
        kind,
        sponsored: head.sponsored,
        with: head.with,
        shared,
        authors,
        text,
        text_quoted,
        dates_quoted,
        likes: extract::counts::likes(&doc),
        comments,
        comments_count,
        shares: extract::counts::shares(&doc),
        comment_selector: false,
        comment_unfiltered: false,
        images: Vec::new(),
        snapshot: None,
        html: html.to_string(),
    }
}

// ── Tests ──
