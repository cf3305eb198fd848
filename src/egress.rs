use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::EgressSettings;
use crate::error::EgressError;
use crate::reachability::Reachability;

const READY_MARKER: &str = "Initialization Sequence Completed";

/// A live network identity. Dropping without `release` leaves cleanup to the OS.
#[async_trait]
pub trait EgressHandle: Send + Sync {
    fn profile(&self) -> &str;
    fn is_alive(&mut self) -> bool;
    async fn release(self: Box<Self>) -> Result<(), EgressError>;
}

#[async_trait]
pub trait EgressProvider: Send + Sync {
    /// `EgressError::AlreadyActive` means some identity is already up; callers
    /// proceed without a handle.
    async fn acquire(&self, profile: &str) -> Result<Box<dyn EgressHandle>, EgressError>;
}

/// Runs one `openvpn <profile>` process per acquired identity.
pub struct OpenVpnProvider {
    settings: EgressSettings,
    reachability: Reachability,
    base_address: Option<String>,
}

impl OpenVpnProvider {
    /// Records our address without any tunnel, used to detect an already-active one.
    pub async fn new(settings: EgressSettings, reachability: Reachability) -> Self {
        let base_address = match reachability.own_address().await {
            Ok(addr) => {
                info!(addr, "base address");
                Some(addr)
            }
            Err(e) => {
                warn!(error = %e, "base address unknown");
                None
            }
        };
        Self {
            settings,
            reachability,
            base_address,
        }
    }

    async fn already_active(&self) -> bool {
        match (&self.base_address, self.reachability.own_address().await) {
            (Some(base), Ok(current)) => *base != current,
            _ => false,
        }
    }

    fn command(&self, profile: &str) -> Command {
        let config: PathBuf = self.settings.profile_dir.join(profile);
        let mut cmd = if self.settings.use_sudo {
            let mut c = Command::new("sudo");
            c.arg(&self.settings.command);
            c
        } else {
            Command::new(&self.settings.command)
        };
        cmd.arg(config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl EgressProvider for OpenVpnProvider {
    async fn acquire(&self, profile: &str) -> Result<Box<dyn EgressHandle>, EgressError> {
        if self.already_active().await {
            info!(profile, "egress probably active already");
            return Err(EgressError::AlreadyActive);
        }

        let timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        let mut child = self.command(profile).spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EgressError::Terminated("no stdout".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let ready = tokio::time::timeout(timeout, async {
            while let Some(line) = lines.next_line().await? {
                debug!(profile, "openvpn: {line}");
                if line.contains(READY_MARKER) {
                    return Ok::<bool, std::io::Error>(true);
                }
            }
            Ok(false)
        })
        .await;

        match ready {
            Ok(Ok(true)) => {
                let profile_name = profile.to_string();
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(profile = %profile_name, "openvpn: {line}");
                    }
                });
                if let Ok(addr) = self.reachability.own_address().await {
                    info!(profile, addr, "egress up");
                }
                Ok(Box::new(OpenVpnTunnel {
                    child,
                    profile: profile.to_string(),
                    use_sudo: self.settings.use_sudo,
                    command: self.settings.command.clone(),
                }))
            }
            Ok(Ok(false)) => {
                let mut stderr = String::new();
                if let Some(mut err) = child.stderr.take() {
                    let _ = err.read_to_string(&mut stderr).await;
                }
                let _ = child.wait().await;
                warn!(profile, stderr = %stderr.trim(), "openvpn exited early");
                Err(EgressError::Terminated(stderr.trim().to_string()))
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                Err(EgressError::Spawn(e))
            }
            Err(_) => {
                warn!(profile, "openvpn timeout, killing");
                let _ = child.kill().await;
                Err(EgressError::Timeout(timeout))
            }
        }
    }
}

pub struct OpenVpnTunnel {
    child: Child,
    profile: String,
    use_sudo: bool,
    command: String,
}

#[async_trait]
impl EgressHandle for OpenVpnTunnel {
    fn profile(&self) -> &str {
        &self.profile
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn release(mut self: Box<Self>) -> Result<(), EgressError> {
        if self.use_sudo {
            // the privileged child is not ours to signal
            let status = Command::new("sudo")
                .args(["killall", "-9", &self.command])
                .status()
                .await?;
            debug!(%status, "killall openvpn");
        } else if self.is_alive() {
            self.child.kill().await?;
        }
        let _ = self.child.wait().await;
        info!(profile = %self.profile, "egress released");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ReachabilitySettings;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn echo_server(addr: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(addr))
            .mount(&server)
            .await;
        server
    }

    async fn provider(dir: &tempfile::TempDir, server: &MockServer) -> OpenVpnProvider {
        let reach = Reachability::new(&ReachabilitySettings {
            endpoints: vec![server.uri()],
            timeout_secs: 5,
            retry_secs: 1,
        })
        .unwrap();
        let settings = EgressSettings {
            command: "sh".into(),
            use_sudo: false,
            profile_dir: dir.path().to_path_buf(),
            connect_timeout_secs: 5,
        };
        OpenVpnProvider::new(settings, reach).await
    }

    #[tokio::test]
    async fn tunnel_comes_up_on_marker_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ok.ovpn"),
            "echo 'Thu Apr  6 Initialization Sequence Completed'\nsleep 30\n",
        )
        .unwrap();
        let server = echo_server("198.51.100.1").await;
        let p = provider(&dir, &server).await;

        let mut handle = p.acquire("ok.ovpn").await.unwrap();
        assert_eq!(handle.profile(), "ok.ovpn");
        assert!(handle.is_alive());
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn early_exit_is_terminated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.ovpn"), "echo 'auth failed' >&2\nexit 1\n").unwrap();
        let server = echo_server("198.51.100.1").await;
        let p = provider(&dir, &server).await;

        let err = p.acquire("bad.ovpn").await.err().unwrap();
        assert!(matches!(err, EgressError::Terminated(msg) if msg.contains("auth failed")));
    }
}
