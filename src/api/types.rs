//! Response payloads of the remote API. Known fields are typed; anything else
//! is kept in `extra` and stored with the row.

use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;
use serde_json::{Map, Value};

/// One page of a list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

impl<T> Page<T> {
    pub fn next(&self) -> Option<&str> {
        self.paging.as_ref().and_then(|p| p.next.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Liked {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShareCount {
    #[serde(default)]
    pub count: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Post {
    pub id: String,
    pub created_time: String,
    #[serde(default)]
    pub updated_time: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub status_type: Option<String>,
    #[serde(default)]
    pub from: Option<UserRef>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub story: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub permalink_url: Option<String>,
    #[serde(default)]
    pub shares: Option<ShareCount>,
    #[serde(default)]
    pub place: Option<Value>,
    #[serde(default)]
    pub message_tags: Option<Value>,
    #[serde(default)]
    pub with_tags: Option<Value>,
    #[serde(default)]
    pub properties: Option<Value>,
    /// link, picture, source, object_id, icon and whatever else came back.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub description_tags: Option<Value>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub media: Option<Value>,
    #[serde(default)]
    pub target: Option<Value>,
    #[serde(default)]
    pub subattachments: Option<Page<Attachment>>,
}

/// Image source of an attachment whose media is exactly `{"image": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaImage {
    pub src: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

impl Attachment {
    pub fn image(&self) -> Option<MediaImage> {
        let media = self.media.as_ref()?.as_object()?;
        if media.len() != 1 {
            return None;
        }
        let image = media.get("image")?;
        Some(MediaImage {
            src: image.get("src")?.as_str()?.to_string(),
            width: image.get("width").and_then(int_value),
            height: image.get("height").and_then(int_value),
        })
    }
}

/// Integers sometimes arrive as strings.
fn int_value(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str()?.trim().parse().ok())
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub id: String,
    pub created_time: String,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub comment_count: i64,
    #[serde(default)]
    pub from: Option<UserRef>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub message_tags: Option<Value>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `2016-04-22T12:03:06+0000` as naive UTC.
pub fn parse_time(s: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_str(s.trim(), "%Y-%m-%dT%H:%M:%S%z")
        .ok()
        .map(|d| d.naive_utc())
}

/// Compact JSON of an optional value, for text columns.
pub fn json_text(v: &Option<Value>) -> Option<String> {
    v.as_ref().map(Value::to_string)
}

/// Whitespace-squeezed optional text.
pub fn clean(v: &Option<String>) -> Option<String> {
    v.as_deref().map(crate::normalize::squeeze)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn api_time() {
        assert_eq!(
            parse_time("2016-04-22T12:03:06+0000"),
            NaiveDate::from_ymd_opt(2016, 4, 22).unwrap().and_hms_opt(12, 3, 6)
        );
        assert_eq!(parse_time("yesterday"), None);
    }

    #[test]
    fn post_keeps_unknown_fields() {
        let post: Post = serde_json::from_value(json!({
            "id": "1_2",
            "created_time": "2016-04-22T12:03:06+0000",
            "type": "photo",
            "shares": {"count": 3},
            "link": "https://example.com/x",
            "object_id": "999"
        }))
        .unwrap();
        assert_eq!(post.kind.as_deref(), Some("photo"));
        assert_eq!(post.shares.unwrap().count, 3);
        assert_eq!(post.extra["object_id"], "999");
        assert!(post.extra.contains_key("link"));
    }

    #[test]
    fn post_without_date_violates_contract() {
        let r: Result<Post, _> = serde_json::from_value(json!({"id": "1_2"}));
        assert!(r.is_err());
    }

    #[test]
    fn attachment_images() {
        let a: Attachment = serde_json::from_value(json!({
            "type": "album",
            "media": {"image": {"src": "https://cdn/x.jpg", "width": "720", "height": 480}},
            "subattachments": {"data": [{"type": "photo"}]}
        }))
        .unwrap();
        assert_eq!(
            a.image(),
            Some(MediaImage {
                src: "https://cdn/x.jpg".into(),
                width: Some(720),
                height: Some(480)
            })
        );
        assert_eq!(a.subattachments.unwrap().data.len(), 1);

        let video: Attachment = serde_json::from_value(json!({
            "media": {"image": {"src": "s"}, "source": "v.mp4"}
        }))
        .unwrap();
        assert_eq!(video.image(), None);
    }

    #[test]
    fn empty_page_defaults() {
        let p: Page<Liked> = serde_json::from_value(json!({})).unwrap();
        assert!(p.data.is_empty());
        assert_eq!(p.next(), None);
    }
}
