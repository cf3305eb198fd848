use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, error};

const MAX_PER_WINDOW: usize = 10;
const WINDOW: Duration = Duration::from_secs(5 * 60);

/// Limits outbound alerts to `MAX_PER_WINDOW` per subject per `WINDOW`.
/// Shared by reference between the workers that raise alerts.
pub struct AlertGovernor {
    history: Mutex<HashMap<String, VecDeque<Instant>>>,
    overflow: AtomicU64,
}

impl Default for AlertGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertGovernor {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
            overflow: AtomicU64::new(0),
        }
    }

    /// Emit an alert unless this subject has been raised too often recently.
    /// Returns whether the alert went out.
    pub fn alert(&self, subject: &str, message: &str) -> bool {
        if self.admit(subject, Instant::now()) {
            error!(alert = subject, "{message}");
            true
        } else {
            debug!(alert = subject, "alert overflow: {message}");
            false
        }
    }

    pub fn admit(&self, subject: &str, now: Instant) -> bool {
        let mut history = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let sent = history.entry(subject.to_string()).or_default();
        while sent
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= WINDOW)
        {
            sent.pop_front();
        }

        if sent.len() >= MAX_PER_WINDOW {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        sent.push_back(now);
        true
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_per_subject_then_overflow() {
        let g = AlertGovernor::new();
        let t0 = Instant::now();
        for _ in 0..10 {
            assert!(g.admit("login failed", t0));
        }
        assert!(!g.admit("login failed", t0 + Duration::from_secs(10)));
        assert!(g.admit("other subject", t0));
        assert_eq!(g.overflow_count(), 1);
    }

    #[test]
    fn window_slides() {
        let g = AlertGovernor::new();
        let t0 = Instant::now();
        for _ in 0..10 {
            g.admit("x", t0);
        }
        assert!(!g.admit("x", t0 + Duration::from_secs(299)));
        assert!(g.admit("x", t0 + WINDOW));
    }
}
