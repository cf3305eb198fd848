use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::ApiError;

static RATE_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(#17\) User request limit reached").unwrap());
static UNEXPECTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"An unexpected error has occurred|An unknown error has occurred").unwrap()
});
static EXPIRED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Session has expired").unwrap());
static UNSUPPORTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Unsupported get request").unwrap());

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: PlatformError,
}

#[derive(Debug, Deserialize)]
struct PlatformError {
    message: String,
}

/// The platform's own error message: the `WWW-Authenticate` header when
/// present, else `error.message` in a JSON body.
pub fn platform_message(www_authenticate: Option<&str>, body: &str) -> Option<String> {
    www_authenticate
        .map(str::to_string)
        .or_else(|| {
            serde_json::from_str::<ErrorEnvelope>(body)
                .ok()
                .map(|e| e.error.message)
        })
        .filter(|m| !m.trim().is_empty())
}

/// Map a non-success response to its recovery class.
pub fn classify(status: u16, www_authenticate: Option<&str>, body: &str) -> ApiError {
    let Some(message) = platform_message(www_authenticate, body) else {
        let message = body.trim().chars().take(200).collect();
        return ApiError::Http { status, message };
    };

    if RATE_LIMIT_RE.is_match(&message) {
        ApiError::RateLimited(message)
    } else if UNEXPECTED_RE.is_match(&message) {
        ApiError::Unexpected(message)
    } else if EXPIRED_RE.is_match(&message) {
        ApiError::SessionExpired(message)
    } else if UNSUPPORTED_RE.is_match(&message) {
        ApiError::Unsupported(message)
    } else {
        ApiError::Platform(message)
    }
}
