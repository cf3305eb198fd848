use std::sync::LazyLock;

use scraper::{Html, Selector};

use crate::normalize::strip_html;

static BODY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"div[class*="userContent"]"#).unwrap());
static QUOTED: LazyLock<[Selector; 2]> = LazyLock::new(|| {
    [
        Selector::parse(r#"div[class="_5r69"]"#).unwrap(),
        Selector::parse(r#"div[class*="mtm"]"#).unwrap(),
    ]
});

/// `(body, quoted body)`, each from the first matching region with any text.
pub fn extract(doc: &Html) -> (String, String) {
    let body = doc
        .select(&BODY)
        .filter(|div| {
            !div.value()
                .attr("class")
                .is_some_and(|c| c.contains("userContentWrapper"))
        })
        .map(|div| strip_html(&div.inner_html()))
        .find(|t| !t.is_empty())
        .unwrap_or_default();

    // the exact quote container shadows the looser fallback
    let quoted = QUOTED
        .iter()
        .find_map(|sel| {
            doc.select(sel)
                .map(|div| strip_html(&div.inner_html()))
                .find(|t| !t.is_empty())
        })
        .unwrap_or_default();

    (body, quoted)
}
