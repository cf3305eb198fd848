use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, BrowserError, ExtractError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled")]
pub struct Cancelled;

impl From<Cancelled> for ApiError {
    fn from(_: Cancelled) -> Self {
        ApiError::Cancelled
    }
}

impl From<Cancelled> for BrowserError {
    fn from(_: Cancelled) -> Self {
        BrowserError::Cancelled
    }
}

impl From<Cancelled> for ExtractError {
    fn from(_: Cancelled) -> Self {
        ExtractError::Cancelled
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep(duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    if cancel.is_cancelled() {
        return Err(Cancelled);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

pub fn check(cancel: &CancellationToken) -> Result<(), Cancelled> {
    if cancel.is_cancelled() {
        Err(Cancelled)
    } else {
        Ok(())
    }
}

/// Uniform duration in `[min, max]`. A reversed range collapses to `min`.
pub fn random_between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let ms = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

/// Random point inside a `width` x `height` viewport, for pointer moves while idling.
pub fn random_point(width: u32, height: u32) -> (i64, i64) {
    let mut rng = rand::thread_rng();
    (
        rng.gen_range(0..width.max(1)) as i64,
        rng.gen_range(0..height.max(1)) as i64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_returns_early_on_cancel() {
        tokio::time::pause();
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let task = tokio::spawn(async move { sleep(Duration::from_secs(3600), &child).await });
        cancel.cancel();
        assert_eq!(task.await.unwrap(), Err(Cancelled));
    }

    #[tokio::test]
    async fn sleep_completes_without_cancel() {
        tokio::time::pause();
        let cancel = CancellationToken::new();
        assert_eq!(sleep(Duration::from_secs(60), &cancel).await, Ok(()));
        assert!(check(&cancel).is_ok());
    }

    #[test]
    fn random_between_stays_in_range() {
        let (min, max) = (Duration::from_secs(5), Duration::from_secs(15));
        for _ in 0..100 {
            let d = random_between(min, max);
            assert!(d >= min && d <= max);
        }
        assert_eq!(random_between(max, min), max);
    }
}
