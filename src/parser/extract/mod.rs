//! Field extractors over a unit's parsed markup. Each is a pure function of the
//! document; failures degrade to empty values and are logged, never raised.

pub mod authors;
pub mod comments;
pub mod counts;
pub mod dates;
pub mod text;

use scraper::{ElementRef, Selector};

use super::text_of;

/// Text of the first descendant of `el` matching `sel`, or empty.
pub(crate) fn first_text_within(el: ElementRef<'_>, sel: &Selector) -> String {
    el.select(sel).next().map(text_of).unwrap_or_default()
}
