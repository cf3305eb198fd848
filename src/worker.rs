use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alerts::AlertGovernor;
use crate::api::bulk::{BulkCounters, BulkDownloader};
use crate::api::ApiClient;
use crate::browser::{Browser, Launcher};
use crate::config::Settings;
use crate::db::{LoginAction, Store, Target};
use crate::egress::EgressProvider;
use crate::error::{ApiError, ExtractError};
use crate::extractor::{extract_page, ExtractOptions, Flow, PageSummary};
use crate::pacing;
use crate::parser::Story;
use crate::persona::{in_window, PersonaScheduler};
use crate::reachability::Reachability;
use crate::session::{Session, SessionState};

/// Consecutive failed logins tolerated while the network is fine.
const MAX_LOGIN_FAILURES: u32 = 3;

/// What a single cycle did.
#[derive(Debug)]
pub enum StepOutcome {
    /// The network was down; we waited for it to come back.
    Suspended,
    Created,
    Discarded,
    Authenticated,
    LoginFailed,
    LoggedOut,
    LogoutFailed,
    Harvested { target: String, stories: usize },
    /// Extraction failed while the network was up; the target is rotated to
    /// the back of the queue and the session is now `Failed`.
    HarvestFailed,
    /// The session's egress tunnel died; the session is now `Failed`.
    EgressLost,
    /// Nothing to do this cycle: no persona in window, or no target.
    Idle,
    Exit(WorkerExit),
}

#[derive(Debug)]
pub enum WorkerExit {
    Cancelled,
    BulkComplete(BulkCounters),
    Fatal(String),
    MaxCycles,
}

/// Drives one session over time, one state transition per cycle.
pub struct HarvestWorker {
    settings: Settings,
    store: Arc<Store>,
    launcher: Box<dyn Launcher>,
    egress: Box<dyn EgressProvider>,
    reachability: Reachability,
    scheduler: PersonaScheduler,
    alerts: Arc<AlertGovernor>,
    session: Option<Session>,
    login_failures: u32,
    reload_pending: bool,
    cancel: CancellationToken,
}

impl HarvestWorker {
    pub fn new(
        settings: Settings,
        store: Arc<Store>,
        launcher: Box<dyn Launcher>,
        egress: Box<dyn EgressProvider>,
        reachability: Reachability,
        alerts: Arc<AlertGovernor>,
        cancel: CancellationToken,
    ) -> Self {
        let scheduler = PersonaScheduler::new(settings.personas.clone());
        Self {
            settings,
            store,
            launcher,
            egress,
            reachability,
            scheduler,
            alerts,
            session: None,
            login_failures: 0,
            reload_pending: false,
            cancel,
        }
    }

    /// Loop until cancelled, a fatal condition, bulk completion or `max_cycles`.
    pub async fn run(&mut self, max_cycles: Option<u64>) -> Result<WorkerExit> {
        if self.scheduler.is_empty() {
            warn!("no personas configured, nothing will be harvested");
        }
        let mut cycles = 0;
        let exit = loop {
            if max_cycles.is_some_and(|max| cycles >= max) {
                break WorkerExit::MaxCycles;
            }
            cycles += 1;

            let outcome = match self.step(Local::now()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.shutdown().await;
                    return Err(e);
                }
            };
            debug!(cycle = cycles, ?outcome, "cycle done");
            match outcome {
                StepOutcome::Exit(exit) => break exit,
                StepOutcome::Idle => {
                    let pause = self.settings.harvest.cycle_pause();
                    if pacing::sleep(pause, &self.cancel).await.is_err() {
                        break WorkerExit::Cancelled;
                    }
                }
                _ => {}
            }
        };

        self.shutdown().await;
        info!(cycles, exit = ?exit, "harvest worker stopped");
        info!(report = %self.store.report(), "connection pool");
        Ok(exit)
    }

    /// Exactly one of: wait out an outage, create a session, discard a failed
    /// one, authenticate, log out a stale session, or harvest one target.
    pub async fn step(&mut self, now: DateTime<Local>) -> Result<StepOutcome> {
        if self.cancel.is_cancelled() {
            return Ok(StepOutcome::Exit(WorkerExit::Cancelled));
        }
        match self.reachability.wait_until_reachable(&self.cancel).await {
            Ok(true) => {
                self.reload_pending = true;
                return Ok(StepOutcome::Suspended);
            }
            Ok(false) => {}
            Err(_) => return Ok(StepOutcome::Exit(WorkerExit::Cancelled)),
        }

        let Some(mut session) = self.session.take() else {
            self.session = Some(Session::new(
                self.settings.browser.clone(),
                self.settings.harvest.min_lifespan(),
                self.settings.harvest.max_lifespan(),
                self.cancel.clone(),
            ));
            debug!("session created");
            return Ok(StepOutcome::Created);
        };

        let outcome = match session.observe(now.with_timezone(&Utc)) {
            SessionState::Empty => self.authenticate(&mut session, now).await,
            SessionState::Stale => self.logout(&mut session, now).await,
            SessionState::Active => self.active(&mut session, now).await,
            SessionState::Failed | SessionState::Authenticating | SessionState::LoggingOut => {
                session.discard().await;
                return Ok(StepOutcome::Discarded);
            }
        };
        self.session = Some(session);
        outcome
    }

    async fn authenticate(
        &mut self,
        session: &mut Session,
        now: DateTime<Local>,
    ) -> Result<StepOutcome> {
        let Some(persona) = self.scheduler.next_persona().cloned() else {
            return Ok(StepOutcome::Idle);
        };
        if !in_window(&persona, now.naive_local()) {
            debug!(persona = %persona.id, "outside activity window");
            return Ok(StepOutcome::Idle);
        }

        let result = session
            .authenticate(
                &persona,
                self.launcher.as_ref(),
                self.egress.as_ref(),
                now.with_timezone(&Utc),
            )
            .await;
        if result.is_err() && self.cancel.is_cancelled() {
            return Ok(StepOutcome::Exit(WorkerExit::Cancelled));
        }
        self.store
            .record_login(&persona.id, LoginAction::Login, result.is_ok(), now.naive_local())
            .context("recording login")?;

        match result {
            Ok(()) => {
                self.login_failures = 0;
                self.reload_pending = false;
                Ok(StepOutcome::Authenticated)
            }
            Err(e) => {
                self.login_failures += 1;
                self.alerts
                    .alert("login failed", &format!("{} (attempt {}): {e}", persona.id, self.login_failures));
                if self.login_failures >= MAX_LOGIN_FAILURES {
                    if self.reachability.is_reachable().await {
                        return Ok(StepOutcome::Exit(WorkerExit::Fatal(format!(
                            "{} consecutive login failures, last: {e}",
                            self.login_failures
                        ))));
                    }
                    self.login_failures = 0;
                }
                Ok(StepOutcome::LoginFailed)
            }
        }
    }

    async fn logout(&mut self, session: &mut Session, now: DateTime<Local>) -> Result<StepOutcome> {
        let persona = session.persona().map(|p| p.id.clone()).unwrap_or_default();
        let result = session.logout().await;
        if result.is_err() && self.cancel.is_cancelled() {
            return Ok(StepOutcome::Exit(WorkerExit::Cancelled));
        }
        self.store
            .record_login(&persona, LoginAction::Logout, result.is_ok(), now.naive_local())
            .context("recording logout")?;

        match result {
            Ok(()) => Ok(StepOutcome::LoggedOut),
            Err(e) => {
                self.alerts.alert("logout failed", &format!("{persona}: {e}"));
                // with a healthy network the browser state can no longer be trusted
                if self.reachability.is_reachable().await {
                    return Ok(StepOutcome::Exit(WorkerExit::Fatal(format!(
                        "logout of {persona} failed: {e}"
                    ))));
                }
                Ok(StepOutcome::LogoutFailed)
            }
        }
    }

    async fn active(&mut self, session: &mut Session, now: DateTime<Local>) -> Result<StepOutcome> {
        if !session.egress_alive() {
            let persona = session.persona().map(|p| p.id.clone()).unwrap_or_default();
            warn!(persona = %persona, "egress tunnel died, dropping the session");
            self.alerts.alert("egress lost", &persona);
            session.fail();
            return Ok(StepOutcome::EgressLost);
        }
        if session.persona().is_some_and(|p| p.is_bulk()) {
            return self.bulk(session, now).await;
        }
        self.harvest(session, now).await
    }

    async fn bulk(&mut self, session: &mut Session, now: DateTime<Local>) -> Result<StepOutcome> {
        info!("bulk persona, running the API downloader");
        let client = ApiClient::new(self.settings.api.clone(), &mut *session, self.cancel.clone())
            .context("building API client")?;

        match BulkDownloader::new(client, &self.store).run().await {
            Ok(counters) => {
                let persona = session.persona().map(|p| p.id.clone()).unwrap_or_default();
                let logged_out = session.logout().await;
                if let Err(e) = &logged_out {
                    warn!(error = %e, "logout after bulk download failed");
                }
                self.store
                    .record_login(&persona, LoginAction::Logout, logged_out.is_ok(), now.naive_local())
                    .context("recording logout")?;
                Ok(StepOutcome::Exit(WorkerExit::BulkComplete(counters)))
            }
            Err(ApiError::Cancelled) => Ok(StepOutcome::Exit(WorkerExit::Cancelled)),
            Err(e) => {
                self.alerts.alert("bulk download failed", &e.to_string());
                session.discard().await;
                Ok(StepOutcome::Exit(WorkerExit::Fatal(format!("bulk download: {e}"))))
            }
        }
    }

    async fn harvest(&mut self, session: &mut Session, now: DateTime<Local>) -> Result<StepOutcome> {
        let Some(target) = self.store.next_target().context("selecting target")? else {
            debug!("no targets to visit");
            return Ok(StepOutcome::Idle);
        };
        let browser = session.browser()?;
        if self.reload_pending {
            info!("reloading page after outage");
        }

        let run_id = format!("{}_{}", target.id, now.format("%Y%m%d%H%M%S"));
        let mut stored = 0;
        let mut store_error = None;
        let result = self
            .visit(browser, &target, |store, story| {
                match store.insert_story(Some(target.id), &run_id, &story) {
                    Ok(true) => {
                        stored += 1;
                        Flow::Continue
                    }
                    Ok(false) => {
                        info!(story_id = %story.id, "already stored, stopping this page");
                        Flow::StopPage
                    }
                    Err(e) => {
                        store_error = Some(e);
                        Flow::StopPage
                    }
                }
            })
            .await;
        if let Some(e) = store_error {
            return Err(e).context("storing story");
        }

        match result {
            Ok(summary) => {
                self.reload_pending = false;
                self.store
                    .mark_visited(target.id, now.naive_local())
                    .context("marking target visited")?;
                info!(
                    target = %target.name,
                    run_id = %run_id,
                    stored,
                    seen = summary.stories,
                    failed = summary.failed,
                    "target harvested"
                );
                Ok(StepOutcome::Harvested {
                    target: target.name,
                    stories: stored,
                })
            }
            Err(ExtractError::Cancelled) => Ok(StepOutcome::Exit(WorkerExit::Cancelled)),
            Err(e) => {
                if !self.reachability.is_reachable().await {
                    warn!(target = %target.name, error = %e, "extraction failed during an outage");
                    self.reload_pending = true;
                    return Ok(StepOutcome::Suspended);
                }
                self.alerts
                    .alert("extraction failed", &format!("{}: {e}", target.name));
                // failed targets go to the back of the rotation
                self.store
                    .mark_visited(target.id, now.naive_local())
                    .context("marking target visited")?;
                session.fail();
                Ok(StepOutcome::HarvestFailed)
            }
        }
    }

    async fn visit<F>(
        &self,
        browser: &dyn Browser,
        target: &Target,
        mut sink: F,
    ) -> Result<PageSummary, ExtractError>
    where
        F: FnMut(&Store, Story) -> Flow,
    {
        if self.reload_pending {
            let current = browser.current_url().await?;
            browser.navigate(&current).await?;
        }
        let url = format!(
            "{}/{}",
            self.settings.browser.base_url.trim_end_matches('/'),
            target.name
        );
        info!(target = %target.name, url = %url, "visiting target");
        browser.navigate(&url).await?;

        let opts = ExtractOptions::from_settings(&self.settings.harvest, &self.settings.browser);
        let store = self.store.as_ref();
        extract_page(browser, &opts, &self.cancel, |story| sink(store, story)).await
    }

    async fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.discard().await;
        }
    }
}

// ── Tests ──
