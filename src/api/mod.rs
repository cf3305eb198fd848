pub mod bulk;
pub mod error;
pub mod types;

use std::time::Duration;

use reqwest::header::WWW_AUTHENTICATE;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{self, TOKEN_RENEWAL_WAIT};
use crate::config::ApiSettings;
use crate::error::ApiError;
use crate::pacing;
use crate::session::TokenSource;
use types::Page;

const TRANSPORT_RETRY: Duration = Duration::from_secs(1);

/// Retry bookkeeping for one logical client session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Consecutive errors of the request in flight; zero after a success.
    pub errors: u32,
    pub requests_since_refresh: u64,
    pub token: Option<String>,
    pub renewals: u32,
}

/// Remote API client with the platform-specific recovery policies.
pub struct ApiClient<T: TokenSource> {
    http: reqwest::Client,
    tokens: T,
    settings: ApiSettings,
    state: RetryState,
    cancel: CancellationToken,
}

impl<T: TokenSource> ApiClient<T> {
    pub fn new(settings: ApiSettings, tokens: T, cancel: CancellationToken) -> Result<Self, ApiError> {
        let mut builder = reqwest::Client::builder();
        if settings.request_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(settings.request_timeout_secs));
        }
        let http = builder
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            tokens,
            settings,
            state: RetryState::default(),
            cancel,
        })
    }

    pub fn settings(&self) -> &ApiSettings {
        &self.settings
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.state
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// `{base}/{version}/{path}?limit=…&fields=…`. The token is added per request.
    pub fn endpoint(&self, path: &str, fields: Option<&str>) -> Result<String, ApiError> {
        let base = format!(
            "{}/{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.version,
            path.trim_start_matches('/')
        );
        let mut params = vec![("limit", self.settings.page_limit.to_string())];
        if let Some(fields) = fields {
            params.push(("fields", fields.to_string()));
        }
        Url::parse_with_params(&base, &params)
            .map(String::from)
            .map_err(|e| ApiError::Contract(format!("bad endpoint {base}: {e}")))
    }

    /// Replace (or add) the `access_token` query value with the current token.
    /// `next` cursors carry whatever token was current when they were issued.
    pub fn freshen(&self, url: &str) -> Result<Url, ApiError> {
        let mut parsed =
            Url::parse(url).map_err(|e| ApiError::Contract(format!("bad url {url}: {e}")))?;
        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(k, _)| k != "access_token")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        {
            let mut pairs = parsed.query_pairs_mut();
            pairs.clear();
            for (k, v) in &kept {
                pairs.append_pair(k, v);
            }
            if let Some(token) = &self.state.token {
                pairs.append_pair("access_token", token);
            }
        }
        Ok(parsed)
    }

    async fn renew(&mut self) -> Result<(), ApiError> {
        let token = self.tokens.renew().await?;
        self.state.token = Some(token);
        self.state.requests_since_refresh = 0;
        self.state.renewals += 1;
        info!(renewals = self.state.renewals, "API token renewed");
        Ok(())
    }

    fn empty() -> Value {
        json!({ "data": [] })
    }

    /// GET `url` under the recovery policies. Returns the decoded body, or an
    /// empty `{"data": []}` when the platform says the request can never succeed.
    pub async fn perform_request(&mut self, url: &str) -> Result<Value, ApiError> {
        if self.state.token.is_none()
            || self.state.requests_since_refresh >= self.settings.token_lifespan.max(1)
        {
            self.renew().await?;
        }
        self.state.requests_since_refresh += 1;
        self.state.errors = 0;

        let mut unexpected = 0;
        let mut expired = 0;
        loop {
            pacing::check(&self.cancel)?;
            let request = self.freshen(url)?;

            let resp = match self.http.get(request).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(errors = self.state.errors, error = %e, "transport error");
                    pacing::sleep(TRANSPORT_RETRY, &self.cancel).await?;
                    self.state.errors += 1;
                    continue;
                }
            };

            let status = resp.status();
            let www_auth = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = match resp.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(errors = self.state.errors, error = %e, "body read failed");
                    pacing::sleep(TRANSPORT_RETRY, &self.cancel).await?;
                    self.state.errors += 1;
                    continue;
                }
            };

            if status.is_success() {
                self.state.errors = 0;
                return Ok(serde_json::from_str(&body)?);
            }

            match error::classify(status.as_u16(), www_auth.as_deref(), &body) {
                ApiError::RateLimited(msg) => {
                    let step = Duration::from_secs(self.settings.rate_limit_step_secs.max(1));
                    let steps = (self.settings.rate_limit_wait_secs / step.as_secs()).max(1);
                    warn!(msg = %msg, wait_secs = steps * step.as_secs(), "rate limited");
                    for _ in 0..steps {
                        pacing::sleep(step, &self.cancel).await?;
                        self.renew().await?;
                    }
                }
                ApiError::Unexpected(msg) => {
                    if unexpected >= self.settings.unexpected_retries {
                        error!(msg = %msg, "unexpected platform error persists, returning no data");
                        return Ok(Self::empty());
                    }
                    unexpected += 1;
                    let wait = Duration::from_secs(self.settings.unexpected_delay_secs);
                    warn!(msg = %msg, attempt = unexpected, "unexpected platform error");
                    pacing::sleep(wait, &self.cancel).await?;
                    self.renew().await?;
                }
                ApiError::SessionExpired(msg) => {
                    if expired >= self.settings.session_retries {
                        error!(msg = %msg, "session still expired after renewals");
                        return Err(ApiError::SessionExpired(msg));
                    }
                    expired += 1;
                    warn!(msg = %msg, attempt = expired, "session expired, renewing token");
                    self.renew().await?;
                }
                ApiError::Unsupported(msg) => {
                    warn!(msg = %msg, "unsupported request, returning no data");
                    return Ok(Self::empty());
                }
                ApiError::Http { status, message } => {
                    let wait = backoff::wait_for(self.state.errors)?;
                    warn!(
                        status,
                        message = %message,
                        errors = self.state.errors,
                        wait_secs = wait.as_secs(),
                        "HTTP error"
                    );
                    pacing::sleep(wait, &self.cancel).await?;
                    if wait > TOKEN_RENEWAL_WAIT {
                        self.renew().await?;
                    }
                }
                other => {
                    error!(error = %other, "platform error");
                    return Err(other);
                }
            }
            self.state.errors += 1;
            debug!(errors = self.state.errors, "retrying request");
        }
    }

    pub async fn get_page<R: DeserializeOwned>(&mut self, url: &str) -> Result<Page<R>, ApiError> {
        let value = self.perform_request(url).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Every item of a list endpoint, following `next` cursors until absent.
    pub async fn fetch_all<R: DeserializeOwned>(&mut self, url: &str) -> Result<Vec<R>, ApiError> {
        let mut items = Vec::new();
        let mut page: Page<R> = self.get_page(url).await?;
        loop {
            let next = page.next().map(str::to_string);
            items.append(&mut page.data);
            match next {
                Some(next) => page = self.get_page(&next).await?,
                None => return Ok(items),
            }
        }
    }
}

// ── Tests ──
