use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

use super::{first_text, text_of, SharedKind, SharedObject};

static LINKS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());
static MAIN_HEADER: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"h5[class*="_5vra"]"#).unwrap());
static SUB_HEADER: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"h6[class*="_5vra"]"#).unwrap());
static MAIN_HEADER_LINKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"h5[class*="_5vra"] a"#).unwrap());
static WITH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bwith\b").unwrap());

/// Header texts of a unit plus the flags derived from them.
#[derive(Debug, Clone, Default)]
pub struct Header {
    /// Author line ("Jane Doe shared a photo.").
    pub main: String,
    /// Quoted-content author line, if any.
    pub sub: String,
    pub sponsored: bool,
    /// The author line names companions ("… with Bob").
    pub with: bool,
}

pub fn read_header(doc: &Html) -> Header {
    let main = first_text(doc, &MAIN_HEADER);
    let sub = first_text(doc, &SUB_HEADER);
    let with = WITH_RE.is_match(&main) || WITH_RE.is_match(&sub);
    Header {
        main,
        sub,
        sponsored: is_sponsored(doc),
        with,
    }
}

/// An explicit "Sponsored" link anywhere in the unit.
pub fn is_sponsored(doc: &Html) -> bool {
    doc.select(&LINKS).any(|a| text_of(a) == "Sponsored")
}

/// Header links whose text is a shared-object label, grouped in label order.
pub fn shared_objects(doc: &Html) -> Vec<SharedObject> {
    let links: Vec<(String, Option<String>)> = doc
        .select(&MAIN_HEADER_LINKS)
        .map(|a| (text_of(a), a.value().attr("href").map(str::to_string)))
        .collect();

    SharedKind::HEADER_LABELS
        .into_iter()
        .flat_map(|kind| {
            links
                .iter()
                .filter(move |(text, _)| text == kind.label())
                .map(move |(_, href)| SharedObject {
                    kind,
                    target: href.clone(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_flags() {
        let doc = Html::parse_fragment(
            r#"<div><h5 class="_5pbw _5vra"><a href="/jane">Jane Doe</a> is with <a href="/bob">Bob</a>.</h5>
               <a class="uiStreamSponsoredLink">Sponsored</a></div>"#,
        );
        let h = read_header(&doc);
        assert_eq!(h.main, "Jane Doe is with Bob .");
        assert!(h.with);
        assert!(h.sponsored);
    }

    #[test]
    fn without_is_not_with() {
        let doc = Html::parse_fragment(
            r#"<h5 class="_5vra"><a href="/jane">Jane Doe</a> posted without comment</h5>"#,
        );
        assert!(!read_header(&doc).with);
    }

    #[test]
    fn shared_objects_follow_label_order() {
        let doc = Html::parse_fragment(
            r#"<h5 class="_5vra"><a href="/jane">Jane</a> shared a <a href="/v/1">video</a>
               and a <a href="/p/2">photo</a></h5>"#,
        );
        let shared = shared_objects(&doc);
        assert_eq!(shared.len(), 2);
        assert_eq!(shared[0].kind, SharedKind::Photo);
        assert_eq!(shared[0].target.as_deref(), Some("/p/2"));
        assert_eq!(shared[1].kind, SharedKind::Video);
    }
}
