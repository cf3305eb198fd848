use std::sync::LazyLock;

use chrono::NaiveDateTime;
use scraper::{Html, Selector};

use crate::normalize::date_from_text;

static DATE_TITLES: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"abbr[class*="_5ptz"]"#).unwrap());

/// First dated element is the unit's own date; the rest belong to quoted content.
pub fn extract(doc: &Html, now: NaiveDateTime) -> (Option<NaiveDateTime>, Vec<NaiveDateTime>) {
    let mut dates = doc
        .select(&DATE_TITLES)
        .filter_map(|abbr| abbr.value().attr("title"))
        .map(|title| date_from_text(title, now));

    let own = dates.next();
    (own, dates.collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn own_and_quoted_dates() {
        let now = NaiveDate::from_ymd_opt(2017, 5, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let doc = Html::parse_fragment(
            r#"<div><abbr class="_5ptz" title="Wednesday, April 5, 2017 at 2:30pm">1h</abbr>
               <abbr class="_5ptz timestamp" title="garbage">2d</abbr>
               <abbr class="_5ptz"></abbr></div>"#,
        );
        let (own, quoted) = extract(&doc, now);
        assert_eq!(own, NaiveDate::from_ymd_opt(2017, 4, 5).unwrap().and_hms_opt(14, 30, 0));
        assert_eq!(quoted, vec![now]);
    }

    #[test]
    fn no_dates_is_none() {
        let now = NaiveDate::from_ymd_opt(2017, 5, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let (own, quoted) = extract(&Html::parse_fragment("<div>plain</div>"), now);
        assert!(own.is_none());
        assert!(quoted.is_empty());
    }
}
