use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use indicatif::ProgressBar;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MediaSettings;
use crate::db::{MediaJob, Store};
use crate::pacing;
use crate::reachability::Reachability;

const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Stored form of downloaded or captured image bytes.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchStats {
    pub claimed: usize,
    pub fetched: usize,
    pub errors: usize,
}

enum Outcome {
    Fetched(Vec<u8>),
    Missing(String),
    Cancelled,
}

/// Claims pending media rows and downloads them. Shares only the store
/// with the harvest worker.
pub struct MediaFetcher {
    client: reqwest::Client,
    store: Arc<Store>,
    reachability: Reachability,
    settings: MediaSettings,
}

impl MediaFetcher {
    pub fn new(
        store: Arc<Store>,
        reachability: Reachability,
        settings: MediaSettings,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder();
        if settings.timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(settings.timeout_secs));
        }
        Ok(Self {
            client: builder.build()?,
            store,
            reachability,
            settings,
        })
    }

    /// Run batches until cancelled, idling when nothing is pending.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let idle = Duration::from_secs(self.settings.idle_secs);
        while !cancel.is_cancelled() {
            let stats = self
                .run_batch(self.settings.batch_size, cancel, &ProgressBar::hidden())
                .await?;
            if stats.claimed == 0 && pacing::sleep(idle, cancel).await.is_err() {
                break;
            }
        }
        info!("media worker stopped");
        Ok(())
    }

    /// One claim-and-fetch pass over at most `limit` rows.
    pub async fn run_batch(
        &self,
        limit: usize,
        cancel: &CancellationToken,
        progress: &ProgressBar,
    ) -> Result<FetchStats> {
        let jobs = self.store.claim_pending_media(limit)?;
        let mut stats = FetchStats {
            claimed: jobs.len(),
            ..FetchStats::default()
        };
        progress.set_length(jobs.len() as u64);

        for job in jobs {
            match self.fetch(&job, cancel).await? {
                Outcome::Fetched(bytes) => {
                    debug!(id = job.id, bytes = bytes.len(), "media fetched");
                    self.store.complete_media(job.id, &encode(&bytes))?;
                    stats.fetched += 1;
                }
                Outcome::Missing(reason) => {
                    warn!(id = job.id, src = %job.src, reason = %reason, "media unavailable");
                    self.store.fail_media(job.id, &reason)?;
                    stats.errors += 1;
                }
                Outcome::Cancelled => break,
            }
            progress.inc(1);
        }

        if stats.claimed > 0 {
            info!(
                claimed = stats.claimed,
                fetched = stats.fetched,
                errors = stats.errors,
                "media batch done"
            );
        }
        Ok(stats)
    }

    async fn fetch(&self, job: &MediaJob, cancel: &CancellationToken) -> Result<Outcome> {
        let mut attempts = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            attempts += 1;
            if attempts > self.settings.max_attempts {
                if self.reachability.is_reachable().await {
                    bail!(
                        "cannot download media {} ({}): too many failed attempts",
                        job.id,
                        job.src
                    );
                }
                info!(wait_secs = self.settings.outage_wait_secs, "network down, waiting");
                let wait = Duration::from_secs(self.settings.outage_wait_secs);
                if pacing::sleep(wait, cancel).await.is_err() {
                    return Ok(Outcome::Cancelled);
                }
                attempts = 0;
                continue;
            }

            match self.client.get(&job.src).send().await {
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                    return Ok(Outcome::Missing("HTTP 404".into()));
                }
                Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                    Ok(bytes) => return Ok(Outcome::Fetched(bytes.to_vec())),
                    Err(e) => debug!(id = job.id, attempt = attempts, error = %e, "body read failed"),
                },
                Ok(resp) => debug!(id = job.id, attempt = attempts, status = %resp.status(), "download refused"),
                Err(e) => debug!(id = job.id, attempt = attempts, error = %e, "download failed"),
            }

            if pacing::sleep(RETRY_PAUSE, cancel).await.is_err() {
                return Ok(Outcome::Cancelled);
            }
        }
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReachabilitySettings;
    use crate::db::tests::temp_store;
    use crate::db::MediaRow;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings() -> MediaSettings {
        MediaSettings {
            batch_size: 10,
            max_attempts: 2,
            timeout_secs: 0,
            outage_wait_secs: 300,
            idle_secs: 60,
        }
    }

    fn reachability(server: &MockServer) -> Reachability {
        Reachability::new(&ReachabilitySettings {
            endpoints: vec![format!("{}/ip", server.uri())],
            timeout_secs: 0,
            retry_secs: 60,
        })
        .unwrap()
    }

    fn media(store: &Store, src: String) -> i64 {
        store
            .insert_media(&MediaRow {
                owner_id: "post-1".into(),
                src: Some(src),
                ..MediaRow::default()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn fetches_and_marks_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg-bytes".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        let a = media(&store, format!("{}/a.jpg", server.uri()));
        media(&store, format!("{}/gone.jpg", server.uri()));

        let fetcher = MediaFetcher::new(store.clone(), reachability(&server), settings()).unwrap();
        let stats = fetcher
            .run_batch(10, &CancellationToken::new(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(stats, FetchStats { claimed: 2, fetched: 1, errors: 1 });

        let conn = store.get("test").unwrap();
        let content: String = conn
            .query_row("SELECT content FROM media WHERE id = ?1", [a], |r| r.get(0))
            .unwrap();
        assert_eq!(content, encode(b"jpeg-bytes"));
        drop(conn);
        // nothing left to claim on a second pass
        let again = fetcher
            .run_batch(10, &CancellationToken::new(), &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(again.claimed, 0);
    }

    #[tokio::test]
    async fn exhausted_attempts_while_reachable_is_fatal() {
        tokio::time::pause();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky.jpg"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ip"))
            .respond_with(ResponseTemplate::new(200).set_body_string("203.0.113.7"))
            .mount(&server)
            .await;

        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        media(&store, format!("{}/flaky.jpg", server.uri()));

        let fetcher = MediaFetcher::new(store, reachability(&server), settings()).unwrap();
        let err = fetcher
            .run_batch(10, &CancellationToken::new(), &ProgressBar::hidden())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too many failed attempts"));
    }

    #[tokio::test]
    async fn cancelled_batch_leaves_rows_pending() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        media(&store, "http://127.0.0.1:9/x.jpg".into());
        let server = MockServer::start().await;
        let fetcher = MediaFetcher::new(store.clone(), reachability(&server), settings()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = fetcher
            .run_batch(10, &cancel, &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(stats.fetched, 0);
        assert_eq!(store.claim_pending_media(10).unwrap().len(), 1);
    }
}
