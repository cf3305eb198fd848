use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::{wait_for_element, Browser, Launcher};
use crate::config::BrowserSettings;
use crate::egress::{EgressHandle, EgressProvider};
use crate::error::{ApiError, BrowserError, EgressError, SessionError};
use crate::pacing;
use crate::persona::Persona;

const EMAIL_INPUT: &str = "input#email";
const PASSWORD_INPUT: &str = "input#pass";
const LOGIN_BUTTON: &str = "label#loginbutton input";
const LOGGED_IN_MARKER: &str = "div#mainContainer";
const ACCOUNT_MENU: &str = "div#userNavigationLabel";
const LOGOUT_CONTROL: &str = r#"form[action*="logout"] button, a[href*="logout"]"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    Authenticating,
    Active,
    Stale,
    LoggingOut,
    /// Absorbing: the worker discards the session and starts over.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Empty => "empty",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Stale => "stale",
            SessionState::LoggingOut => "logging out",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One authenticated, time-bounded browser context bound to a persona.
/// Owned exclusively by one harvest worker.
pub struct Session {
    state: SessionState,
    persona: Option<Persona>,
    expires: Option<DateTime<Utc>>,
    browser: Option<Box<dyn Browser>>,
    egress: Option<Box<dyn EgressHandle>>,
    settings: BrowserSettings,
    min_lifespan: Duration,
    max_lifespan: Duration,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        settings: BrowserSettings,
        min_lifespan: Duration,
        max_lifespan: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state: SessionState::Empty,
            persona: None,
            expires: None,
            browser: None,
            egress: None,
            settings,
            min_lifespan,
            max_lifespan,
            cancel,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current state, after applying the lazy `Active → Stale` transition.
    pub fn observe(&mut self, now: DateTime<Utc>) -> SessionState {
        if self.state == SessionState::Active && self.is_stale(now) {
            info!(persona = self.persona_id(), "session stale");
            self.state = SessionState::Stale;
        }
        self.state
    }

    /// Pure: whether `now` is at or past the expiration.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| now >= expires)
    }

    pub fn persona(&self) -> Option<&Persona> {
        self.persona.as_ref()
    }

    fn persona_id(&self) -> &str {
        self.persona.as_ref().map(|p| p.id.as_str()).unwrap_or("-")
    }

    /// False once a held egress tunnel has died. Sessions without a tunnel
    /// handle are always alive.
    pub fn egress_alive(&mut self) -> bool {
        match self.egress.as_mut() {
            Some(handle) => handle.is_alive(),
            None => true,
        }
    }

    /// The automation handle, available while logged in.
    pub fn browser(&self) -> Result<&dyn Browser, SessionError> {
        match (&self.state, &self.browser) {
            (SessionState::Active | SessionState::Stale, Some(b)) => Ok(b.as_ref()),
            _ => Err(SessionError::InvalidState(self.state)),
        }
    }

    /// `Empty → Authenticating → Active`, or `Failed` after releasing whatever
    /// was acquired along the way.
    pub async fn authenticate(
        &mut self,
        persona: &Persona,
        launcher: &dyn Launcher,
        egress: &dyn EgressProvider,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Empty {
            return Err(SessionError::InvalidState(self.state));
        }
        self.state = SessionState::Authenticating;
        self.persona = Some(persona.clone());
        info!(persona = %persona.id, "authenticating");

        match self.login(persona, launcher, egress).await {
            Ok(()) => {
                let lifespan = pacing::random_between(self.min_lifespan, self.max_lifespan);
                self.expires = chrono::Duration::from_std(lifespan)
                    .ok()
                    .map(|d| now + d);
                self.state = SessionState::Active;
                info!(
                    persona = %persona.id,
                    lifespan_mins = lifespan.as_secs() / 60,
                    "session active"
                );
                Ok(())
            }
            Err(e) => {
                warn!(persona = %persona.id, error = %e, "login failed");
                self.release().await;
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn login(
        &mut self,
        persona: &Persona,
        launcher: &dyn Launcher,
        egress: &dyn EgressProvider,
    ) -> Result<(), SessionError> {
        if let Some(profile) = &persona.egress {
            match egress.acquire(profile).await {
                Ok(handle) => self.egress = Some(handle),
                Err(EgressError::AlreadyActive) => {
                    info!(profile, "egress already active, continuing without a handle");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let browser = self.browser.insert(launcher.launch().await?);
        let wait = self.settings.wait();
        browser.navigate(&self.settings.base_url).await?;

        let cancel = &self.cancel;

        let email = wait_for_element(browser.as_ref(), EMAIL_INPUT, wait, cancel).await?;
        browser.type_text(&email, &persona.id).await?;
        let password = wait_for_element(browser.as_ref(), PASSWORD_INPUT, wait, cancel).await?;
        browser.type_text(&password, &persona.secret).await?;
        let button = wait_for_element(browser.as_ref(), LOGIN_BUTTON, wait, cancel).await?;
        browser.click(&button).await?;

        wait_for_element(browser.as_ref(), LOGGED_IN_MARKER, wait, cancel)
            .await
            .map_err(|e| match e {
                BrowserError::Cancelled => SessionError::Browser(e),
                e => SessionError::Login {
                    persona: persona.id.clone(),
                    reason: format!("not logged in after submit: {e}"),
                },
            })?;
        Ok(())
    }

    /// `Active | Stale → LoggingOut → Empty`. Egress and browser are released
    /// on every path; a failed logout leaves the session `Failed`.
    pub async fn logout(&mut self) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Active | SessionState::Stale) {
            return Err(SessionError::InvalidState(self.state));
        }
        self.state = SessionState::LoggingOut;
        info!(persona = self.persona_id(), "logging out");

        let result = self.sign_out().await;
        self.release().await;
        match result {
            Ok(()) => {
                self.reset();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "logout failed");
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn sign_out(&self) -> Result<(), SessionError> {
        let browser = self
            .browser
            .as_deref()
            .ok_or(SessionError::InvalidState(self.state))?;
        let wait = self.settings.wait();

        browser.navigate(&self.settings.base_url).await?;
        if let Some(menu) = browser.find_all(ACCOUNT_MENU).await?.into_iter().next() {
            browser.click(&menu).await?;
        }
        let control = wait_for_element(browser, LOGOUT_CONTROL, wait, &self.cancel).await?;
        browser.click(&control).await?;
        wait_for_element(browser, EMAIL_INPUT, wait, &self.cancel).await?;
        Ok(())
    }

    /// Drop a session regardless of state, releasing what it holds.
    pub async fn discard(&mut self) {
        debug!(state = %self.state, "discarding session");
        self.release().await;
        self.reset();
    }

    pub fn fail(&mut self) {
        self.state = SessionState::Failed;
    }

    async fn release(&mut self) {
        if let Some(browser) = self.browser.take() {
            if let Err(e) = browser.quit().await {
                debug!(error = %e, "browser quit failed");
            }
        }
        if let Some(handle) = self.egress.take() {
            if let Err(e) = handle.release().await {
                warn!(error = %e, "egress release failed");
            }
        }
    }

    fn reset(&mut self) {
        self.state = SessionState::Empty;
        self.persona = None;
        self.expires = None;
    }

    /// Read an API token from the token page of the logged-in browser.
    pub async fn fetch_token(&self) -> Result<String, SessionError> {
        let browser = self.browser()?;
        browser.navigate(&self.settings.token_url).await?;
        let input = wait_for_element(
            browser,
            &self.settings.token_selector,
            self.settings.wait(),
            &self.cancel,
        )
        .await?;
        let token = browser
            .attribute(&input, "value")
            .await?
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SessionError::Token("token field is empty".into()))?;
        debug!(persona = self.persona_id(), "token renewed");
        Ok(token)
    }
}

/// Where the API client gets fresh tokens from.
#[async_trait]
pub trait TokenSource: Send {
    async fn renew(&mut self) -> Result<String, ApiError>;
}

#[async_trait]
impl TokenSource for Session {
    async fn renew(&mut self) -> Result<String, ApiError> {
        self.fetch_token()
            .await
            .map_err(|e| ApiError::Token(e.to_string()))
    }
}

#[async_trait]
impl<T: TokenSource + ?Sized> TokenSource for &mut T {
    async fn renew(&mut self) -> Result<String, ApiError> {
        (**self).renew().await
    }
}

// ── Tests ──
