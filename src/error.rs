use thiserror::Error;

/// A piece of rendered text that could not be turned into a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not parse {kind} from {input:?}")]
pub struct ParseError {
    pub kind: &'static str,
    pub input: String,
}

impl ParseError {
    pub fn new(kind: &'static str, input: &str) -> Self {
        Self {
            kind,
            input: input.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser transport error: {0}")]
    Transport(String),

    #[error("webdriver error ({status}): {message}")]
    Driver { status: u16, message: String },

    #[error("no such element: {0}")]
    NoSuchElement(String),

    #[error("stale element reference: {0}")]
    StaleElement(String),

    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(std::time::Duration, String),

    #[error("browser wait cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for BrowserError {
    fn from(err: reqwest::Error) -> Self {
        BrowserError::Transport(err.to_string())
    }
}

/// Page-level extraction failure. Per-unit problems are logged, not raised.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Browser(BrowserError),

    #[error("extraction cancelled")]
    Cancelled,
}

impl From<BrowserError> for ExtractError {
    fn from(err: BrowserError) -> Self {
        match err {
            BrowserError::Cancelled => ExtractError::Cancelled,
            other => ExtractError::Browser(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no database connection available: {0}")]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum EgressError {
    /// The egress already looks active (our address differs from the base address).
    /// Callers treat this as a short-circuit, not a failure.
    #[error("egress already seems to be active")]
    AlreadyActive,

    #[error("egress process failed to start: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("egress process exited before the tunnel came up: {0}")]
    Terminated(String),

    #[error("egress tunnel not up after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Error)]
#[error("no address-echo endpoint answered ({tried} tried)")]
pub struct ReachabilityError {
    pub tried: usize,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("operation needs an active session, current state is {0}")]
    InvalidState(crate::session::SessionState),

    #[error("login failed for {persona}: {reason}")]
    Login { persona: String, reason: String },

    #[error("could not obtain an API token: {0}")]
    Token(String),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error(transparent)]
    Egress(#[from] EgressError),
}

/// Outcome taxonomy of a remote API call. Each platform-classified variant
/// has its own recovery policy in [`crate::api::ApiClient::perform_request`].
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unexpected platform error: {0}")]
    Unexpected(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("unsupported request: {0}")]
    Unsupported(String),

    #[error("platform error: {0}")]
    Platform(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("too many errors: {0}")]
    TooManyErrors(u32),

    #[error("response violates expected shape: {0}")]
    Contract(String),

    #[error("token renewal failed: {0}")]
    Token(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Contract(err.to_string())
    }
}
