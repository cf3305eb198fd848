use std::time::Duration;

use crate::error::ApiError;

/// Error counts at or above this are fatal regardless of error class.
pub const MAX_ERRORS: u32 = 21;

/// Waits longer than this also renew the API token before retrying.
pub const TOKEN_RENEWAL_WAIT: Duration = Duration::from_secs(15 * 60);

const SCHEDULE: &[(u32, u64)] = &[
    (3, 5),
    (6, 30),
    (9, 2 * 60),
    (12, 5 * 60),
    (15, 15 * 60),
    (18, 30 * 60),
    (21, 60 * 60),
];

/// Wait before the next attempt, given the number of consecutive errors so far.
pub fn wait_for(error_count: u32) -> Result<Duration, ApiError> {
    SCHEDULE
        .iter()
        .find(|(below, _)| error_count < *below)
        .map(|(_, secs)| Duration::from_secs(*secs))
        .ok_or(ApiError::TooManyErrors(error_count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_boundaries() {
        assert_eq!(wait_for(0).unwrap(), Duration::from_secs(5));
        assert_eq!(wait_for(2).unwrap(), Duration::from_secs(5));
        assert_eq!(wait_for(3).unwrap(), Duration::from_secs(30));
        assert_eq!(wait_for(8).unwrap(), Duration::from_secs(120));
        assert_eq!(wait_for(11).unwrap(), Duration::from_secs(300));
        assert_eq!(wait_for(14).unwrap(), Duration::from_secs(900));
        assert_eq!(wait_for(17).unwrap(), Duration::from_secs(1800));
        assert_eq!(wait_for(20).unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn non_decreasing_then_fatal() {
        let waits: Vec<Duration> = (0..MAX_ERRORS).map(|n| wait_for(n).unwrap()).collect();
        assert!(waits.windows(2).all(|w| w[0] <= w[1]));
        assert!(matches!(wait_for(MAX_ERRORS), Err(ApiError::TooManyErrors(21))));
        assert!(wait_for(500).is_err());
    }
}
