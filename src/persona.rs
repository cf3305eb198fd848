use std::fmt;

use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime};
use serde::Deserialize;

/// How a persona's session is used once it is logged in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonaMode {
    /// Browse target pages and extract stories.
    #[default]
    Interactive,
    /// Obtain an API token, run the bulk downloader, then stop the worker.
    Bulk,
}

/// A credential identity. Immutable once loaded.
#[derive(Clone, Deserialize)]
pub struct Persona {
    pub id: String,
    pub secret: String,
    /// Egress profile name (e.g. an OpenVPN config file under the profile dir).
    #[serde(default)]
    pub egress: Option<String>,
    #[serde(default)]
    pub start_hour: u32,
    #[serde(default = "full_day")]
    pub end_hour: u32,
    #[serde(default)]
    pub mode: PersonaMode,
}

fn full_day() -> u32 {
    24
}

impl fmt::Debug for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persona")
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .field("egress", &self.egress)
            .field("start_hour", &self.start_hour)
            .field("end_hour", &self.end_hour)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Persona {
    pub fn is_bulk(&self) -> bool {
        self.mode == PersonaMode::Bulk
    }

    pub fn window(&self) -> Window {
        Window {
            start_hour: self.start_hour,
            end_hour: self.end_hour,
        }
    }
}

/// Daily activity window `[start, end)` in local hours. `start > end` wraps past
/// midnight; `start == end` (or 0..24) means always.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Window {
    /// Tests both the interval that opened yesterday and the one opening today.
    pub fn contains(&self, now: NaiveDateTime) -> bool {
        let start = self.start_hour % 24;
        let end = self.end_hour % 24;
        if start == end {
            return true;
        }
        let Some(opens_at) = NaiveTime::from_hms_opt(start, 0, 0) else {
            return true;
        };
        let length = ChronoDuration::hours(((end + 24 - start) % 24) as i64);

        [1, 0].into_iter().any(|days_back| {
            let open = (now.date() - ChronoDuration::days(days_back)).and_time(opens_at);
            open <= now && now < open + length
        })
    }
}

/// Round-robin persona selection.
pub struct PersonaScheduler {
    personas: Vec<Persona>,
    next: usize,
}

impl PersonaScheduler {
    pub fn new(personas: Vec<Persona>) -> Self {
        Self { personas, next: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }

    pub fn next_persona(&mut self) -> Option<&Persona> {
        if self.personas.is_empty() {
            return None;
        }
        let idx = self.next % self.personas.len();
        self.next = (idx + 1) % self.personas.len();
        self.personas.get(idx)
    }
}

pub fn in_window(persona: &Persona, now: NaiveDateTime) -> bool {
    persona.window().contains(now)
}

// ── Tests ──
