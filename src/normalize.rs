use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use tracing::debug;

use crate::error::ParseError;

static THOUSANDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}(,\d{3})+$").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static WEEKDAY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][a-z]+day,?\s+").unwrap());

/// Ordered (pattern, replacement) rewrites applied to platform date titles
/// before format matching.
static DATE_REWRITES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r",", ""),
        (r"\sat\s", " "),
        (r"^(\d)\s", "0${1} "),
        (r"(\d+)am\b", "${1}AM"),
        (r"(\d+)pm\b", "${1}PM"),
        (r"\s(\d)\s(\d{4})", " 0${1} ${2}"),
        (r"\s(\d):", " 0${1}:"),
        (r":(\d)(AM|PM|$)", ":0${1}${2}"),
    ]
    .into_iter()
    .map(|(pattern, to)| (Regex::new(pattern).unwrap(), to))
    .collect()
});

/// Day-first 24h ("5 April 2017 14:30"), then month-first 12h ("April 05 2017 02:30PM").
const DATE_FORMATS: &[&str] = &["%d %B %Y %H:%M", "%B %d %Y %I:%M%p"];

/// Parse a count as rendered by the platform: `"350"`, `"1,234"`, `"1.2K"`, `"3,5k"`.
pub fn value_from_text(text: &str) -> Result<i64, ParseError> {
    let trimmed = text.trim();
    if let Ok(n) = trimmed.parse::<i64>() {
        return Ok(n);
    }
    if THOUSANDS_RE.is_match(trimmed) {
        return trimmed
            .replace(',', "")
            .parse::<i64>()
            .map_err(|_| ParseError::new("count", text));
    }
    let mantissa = trimmed
        .strip_suffix(|c| c == 'k' || c == 'K')
        .ok_or_else(|| ParseError::new("count", text))?;
    let value: f64 = mantissa
        .trim()
        .replace(',', ".")
        .parse()
        .map_err(|_| ParseError::new("count", text))?;
    Ok((value * 1000.0).round() as i64)
}

/// Rewrite a date title into one of the canonical shapes and parse it.
pub fn parse_date(text: &str) -> Option<NaiveDateTime> {
    let mut candidate = WEEKDAY_RE.replace(text.trim(), "").into_owned();
    for (re, to) in DATE_REWRITES.iter() {
        candidate = re.replace_all(&candidate, *to).into_owned();
    }

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&candidate, fmt).ok())
}

/// Like [`parse_date`] but never fails: unparseable text yields `now`.
pub fn date_from_text(text: &str, now: NaiveDateTime) -> NaiveDateTime {
    parse_date(text).unwrap_or_else(|| {
        debug!(text, "date conversion failed, using now");
        now
    })
}

/// Replace tags with spaces and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let text = TAG_RE.replace_all(html, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    squeeze(&text)
}

pub fn squeeze(text: &str) -> String {
    WS_RE.replace_all(text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn counts() {
        assert_eq!(value_from_text("350"), Ok(350));
        assert_eq!(value_from_text(" 42 "), Ok(42));
        assert_eq!(value_from_text("1.2K"), Ok(1200));
        assert_eq!(value_from_text("3,5k"), Ok(3500));
        assert_eq!(value_from_text("12K"), Ok(12000));
        assert_eq!(value_from_text("1,234"), Ok(1234));
    }

    #[test]
    fn count_failures_are_errors() {
        let err = value_from_text("abc").unwrap_err();
        assert_eq!(err.kind, "count");
        assert_eq!(err.input, "abc");
        assert!(value_from_text("").is_err());
        assert!(value_from_text("1.5").is_err());
        assert!(value_from_text("xK").is_err());
    }

    #[test]
    fn month_first_twelve_hour() {
        assert_eq!(
            parse_date("Wednesday, April 5, 2017 at 2:30pm"),
            Some(at(2017, 4, 5, 14, 30))
        );
        assert_eq!(
            parse_date("Monday, January 2, 2017 at 9:05am"),
            Some(at(2017, 1, 2, 9, 5))
        );
    }

    #[test]
    fn day_first_twenty_four_hour() {
        assert_eq!(
            parse_date("Wednesday, 5 April 2017 at 14:30"),
            Some(at(2017, 4, 5, 14, 30))
        );
    }

    #[test]
    fn unparseable_date_falls_back_to_now() {
        let now = at(2020, 6, 1, 12, 0);
        assert_eq!(date_from_text("yesterday-ish", now), now);
        assert_eq!(date_from_text("", now), now);
    }

    #[test]
    fn html_is_flattened() {
        assert_eq!(
            strip_html("<p>Hello <b>big</b>\n\n world&nbsp;&amp; co</p>"),
            "Hello big world & co"
        );
        assert_eq!(strip_html(""), "");
    }
}
