use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::extractor::FeedKind;
use crate::persona::Persona;

const DEFAULT_CONFIG_FILE: &str = "harvest.toml";

/// All runtime settings. Every section has defaults, so an empty
/// environment yields a usable (if persona-less) configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db: DbSettings,
    pub browser: BrowserSettings,
    pub harvest: HarvestSettings,
    pub api: ApiSettings,
    pub egress: EgressSettings,
    pub reachability: ReachabilitySettings,
    pub media: MediaSettings,
    pub personas: Vec<Persona>,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbSettings {
    pub path: PathBuf,
    pub pool_size: usize,
    /// How long a caller waits for a free pooled connection before erroring.
    pub checkout_timeout_secs: u64,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/harvest.sqlite"),
            pool_size: 10,
            checkout_timeout_secs: 30,
        }
    }
}

impl DbSettings {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.checkout_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub headless: bool,
    pub width: u32,
    pub height: u32,
    pub base_url: String,
    /// Page that exposes an API token to the logged-in persona.
    pub token_url: String,
    pub token_selector: String,
    pub wait_secs: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".into(),
            headless: true,
            width: 1200,
            height: 2000,
            base_url: "https://www.facebook.com".into(),
            token_url: "https://developers.facebook.com/tools/explorer".into(),
            token_selector: "input[placeholder=\"Access Token\"]".into(),
            wait_secs: 15,
        }
    }
}

impl BrowserSettings {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvestSettings {
    pub feed_kind: FeedKind,
    pub max_stories: usize,
    pub expand_comments: bool,
    pub get_images: bool,
    pub min_image_size: u32,
    pub story_min_delay_secs: u64,
    pub story_max_delay_secs: u64,
    /// Move the pointer around while waiting between stories.
    pub obfuscate: bool,
    pub lifespan_hours: f64,
    pub lifespan_jitter_hours: f64,
    /// Pause between worker cycles (also used when no persona is in its window).
    pub cycle_pause_secs: u64,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            feed_kind: FeedKind::User,
            max_stories: 100,
            expand_comments: true,
            get_images: true,
            min_image_size: 100,
            story_min_delay_secs: 5,
            story_max_delay_secs: 15,
            obfuscate: true,
            lifespan_hours: 2.0,
            lifespan_jitter_hours: 0.25,
            cycle_pause_secs: 60,
        }
    }
}

impl HarvestSettings {
    pub fn min_lifespan(&self) -> Duration {
        hours((self.lifespan_hours - self.lifespan_jitter_hours).max(0.0))
    }

    pub fn max_lifespan(&self) -> Duration {
        hours(self.lifespan_hours + self.lifespan_jitter_hours)
    }

    pub fn cycle_pause(&self) -> Duration {
        Duration::from_secs(self.cycle_pause_secs)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("lifespan_hours", self.lifespan_hours),
            ("lifespan_jitter_hours", self.lifespan_jitter_hours),
        ] {
            ensure!(
                value.is_finite() && value >= 0.0,
                "harvest.{name} must be a non-negative number of hours, got {value}"
            );
        }
        Duration::try_from_secs_f64((self.lifespan_hours + self.lifespan_jitter_hours) * 3600.0)
            .context("harvest lifespan is out of range")?;
        Ok(())
    }
}

/// Saturates to zero on values `validate` rejects.
fn hours(h: f64) -> Duration {
    Duration::try_from_secs_f64(h * 3600.0).unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub version: String,
    pub page_limit: u32,
    /// Requests after which the token is renewed proactively.
    pub token_lifespan: u64,
    pub rate_limit_wait_secs: u64,
    pub rate_limit_step_secs: u64,
    pub unexpected_retries: u32,
    pub unexpected_delay_secs: u64,
    pub session_retries: u32,
    pub max_posts: usize,
    pub days_depth: i64,
    pub request_timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com".into(),
            version: "v2.6".into(),
            page_limit: 100,
            token_lifespan: 2000,
            rate_limit_wait_secs: 60 * 60,
            rate_limit_step_secs: 5 * 60,
            unexpected_retries: 3,
            unexpected_delay_secs: 10,
            session_retries: 3,
            max_posts: 500,
            days_depth: 14,
            request_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EgressSettings {
    pub command: String,
    pub use_sudo: bool,
    pub profile_dir: PathBuf,
    pub connect_timeout_secs: u64,
}

impl Default for EgressSettings {
    fn default() -> Self {
        Self {
            command: "openvpn".into(),
            use_sudo: true,
            profile_dir: PathBuf::from("vpn"),
            connect_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReachabilitySettings {
    pub endpoints: Vec<String>,
    /// Per-probe client timeout; 0 disables it.
    pub timeout_secs: u64,
    /// Sleep between probes while the network is down.
    pub retry_secs: u64,
}

impl Default for ReachabilitySettings {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "http://checkip.amazonaws.com/".into(),
                "https://api.ipify.org".into(),
                "http://icanhazip.com/".into(),
                "https://ipapi.co/ip/".into(),
            ],
            timeout_secs: 40,
            retry_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaSettings {
    pub batch_size: usize,
    pub max_attempts: u32,
    /// Per-download client timeout; 0 disables it.
    pub timeout_secs: u64,
    pub outage_wait_secs: u64,
    pub idle_secs: u64,
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 10,
            timeout_secs: 20,
            outage_wait_secs: 5 * 60,
            idle_secs: 60,
        }
    }
}

/// Defaults, then `harvest.toml` (or `path`), then `HARVEST__SECTION__KEY` env vars.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let file = match path {
        Some(p) => File::from(p).required(true),
        None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };

    let settings: Settings = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix("HARVEST")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to read configuration")?
        .try_deserialize()
        .context("Invalid configuration")?;
    settings.harvest.validate().context("Invalid configuration")?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let s = Settings::default();
        assert_eq!(s.api.version, "v2.6");
        assert_eq!(s.api.token_lifespan, 2000);
        assert_eq!(s.harvest.min_image_size, 100);
        assert_eq!(s.reachability.endpoints.len(), 4);
        assert!(s.harvest.min_lifespan() < s.harvest.max_lifespan());
        assert_eq!(s.harvest.min_lifespan(), Duration::from_secs(6300));
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            f,
            r#"
targets = ["some.page", "someone.else"]

[harvest]
max_stories = 7
feed_kind = "page"

[[personas]]
id = "alice@example.com"
secret = "pw"
start_hour = 20
end_hour = 4

[[personas]]
id = "bulk@example.com"
secret = "pw2"
mode = "bulk"
"#
        )
        .unwrap();

        let s = load(Some(f.path())).unwrap();
        assert_eq!(s.harvest.max_stories, 7);
        assert_eq!(s.harvest.feed_kind, FeedKind::Page);
        assert!(s.harvest.expand_comments);
        assert_eq!(s.targets.len(), 2);
        assert_eq!(s.personas.len(), 2);
        assert!(s.personas[1].is_bulk());
        assert_eq!(s.personas[0].start_hour, 20);
        assert_eq!(s.personas[1].end_hour, 24);
    }

    #[test]
    fn negative_or_nan_lifespan_is_rejected() {
        for bad in ["-1.0", "nan"] {
            let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
            writeln!(f, "[harvest]\nlifespan_hours = {bad}").unwrap();
            let err = load(Some(f.path())).unwrap_err();
            assert!(format!("{err:#}").contains("lifespan_hours"), "{err:#}");
        }

        let s = HarvestSettings {
            lifespan_hours: f64::NAN,
            ..HarvestSettings::default()
        };
        assert_eq!(s.max_lifespan(), Duration::ZERO);
    }
}
