//! C4: SSH transport. Host-key discovery through `ssh-keyscan`, TOFU
//! verification through C3, session establishment through `openssh`, and
//! command execution through `nixops_command::RemoteCommand` (spec §4.4).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nixops_command::handler::Handler;
use nixops_command::RemoteCommand;
use openssh::{KnownHosts as OpensshKnownHosts, Session, SessionBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::errors::SshError;
use crate::known_hosts::{HostKey, KnownHosts};

#[derive(Debug, Clone)]
pub struct ConnectSpec {
    pub host: String,
    pub port: u16,
    pub user: String,
}

pub struct ProbeResult {
    pub reachable: bool,
    pub latency: Duration,
}

pub struct SshTransport {
    known_hosts: Arc<KnownHosts>,
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(known_hosts: Arc<KnownHosts>, connect_timeout: Duration) -> Self {
        Self {
            known_hosts,
            connect_timeout,
        }
    }

    /// Fetches the host's current key via `ssh-keyscan`, reconciles it
    /// against C3, then opens an authenticated session pinned to the exact
    /// same `known_hosts` file C3 maintains.
    #[instrument(skip(self, key_path), fields(host = %spec.host, port = spec.port))]
    pub async fn open_session(
        &self,
        spec: &ConnectSpec,
        key_path: &Path,
    ) -> Result<Arc<Session>, SshError> {
        self.pin_host_key(spec).await?;
        let destination = format!("{}@{}", spec.user, spec.host);
        let mut builder = SessionBuilder::default();
        builder
            .port(spec.port)
            .keyfile(key_path)
            .known_hosts_check(OpensshKnownHosts::Strict)
            .user_known_hosts_file(self.known_hosts.path())
            .connect_timeout(self.connect_timeout);
        let session = builder
            .connect(&destination)
            .await
            .map_err(|e| classify_connect_error(&spec.host, e))?;
        Ok(Arc::new(session))
    }

    /// Resolves the host's current key through `ssh-keyscan` and runs it
    /// through C3's TOFU check before any authenticated session is opened.
    async fn pin_host_key(&self, spec: &ConnectSpec) -> Result<(), SshError> {
        let observed = keyscan(&spec.host, spec.port).await?;
        self.known_hosts.verify_or_learn(observed).await?;
        Ok(())
    }

    /// `probe(host)` (spec §4.4): attempts to open a session and run a
    /// trivial command, reporting reachability and latency without treating
    /// auth/host-key failures as "unreachable" — those are distinct
    /// dispositions the reconcile loop handles separately.
    pub async fn probe(&self, spec: &ConnectSpec, key_path: &Path) -> Result<ProbeResult, SshError> {
        let start = Instant::now();
        let session = match self.open_session(spec, key_path).await {
            Ok(s) => s,
            Err(SshError::Unreachable(_)) => {
                return Ok(ProbeResult {
                    reachable: false,
                    latency: start.elapsed(),
                })
            }
            Err(e) => return Err(e),
        };
        let cancel = CancellationToken::new();
        let mut handler = nixops_command::handler::NoopHandler;
        let cmd = RemoteCommand::on_session("true", session);
        let ran = cmd
            .run(Duration::from_secs(10), &cancel, &mut handler)
            .await;
        Ok(ProbeResult {
            reachable: ran.is_ok(),
            latency: start.elapsed(),
        })
    }

    pub async fn run(
        &self,
        session: &Arc<Session>,
        program: &str,
        args: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
        handler: &mut dyn Handler,
    ) -> Result<i32, SshError> {
        let mut cmd = RemoteCommand::on_session(program, session.clone());
        cmd.args(args);
        cmd.run(timeout, cancel, handler)
            .await
            .map_err(map_command_err)
    }

    pub async fn run_captured(
        &self,
        session: &Arc<Session>,
        program: &str,
        args: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
        handler: &mut dyn Handler,
    ) -> Result<(i32, Vec<u8>), SshError> {
        let mut cmd = RemoteCommand::on_session(program, session.clone());
        cmd.args(args);
        cmd.run_captured(timeout, cancel, handler)
            .await
            .map_err(map_command_err)
    }
}

fn map_command_err(e: nixops_command::CommandError) -> SshError {
    match e {
        nixops_command::CommandError::Timeout(_) => SshError::Timeout,
        nixops_command::CommandError::Cancelled => SshError::Timeout,
        nixops_command::CommandError::Io(io) => SshError::Io(io.to_string()),
        nixops_command::CommandError::Ssh(s) => SshError::Io(s),
        nixops_command::CommandError::NonZeroExit { code, .. } => {
            SshError::RemoteExecFailed { exit: code }
        }
    }
}

fn classify_connect_error(host: &str, e: openssh::Error) -> SshError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("host key") || lower.contains("known_hosts") {
        SshError::HostKeyMismatch(host.to_owned(), "unknown".into(), "unknown".into())
    } else if lower.contains("permission denied") || lower.contains("authentication") {
        SshError::AuthFailed(msg)
    } else if lower.contains("timed out")
        || lower.contains("connection refused")
        || lower.contains("no route to host")
        || lower.contains("unreachable")
    {
        SshError::Unreachable(host.to_owned())
    } else {
        SshError::Io(msg)
    }
}

/// Runs `ssh-keyscan -t ed25519 <host> -p <port>` locally and parses the
/// first returned key line. `ssh-keyscan` itself performs no host-key
/// checking, which is exactly why its output must be run through C3 before
/// it's trusted for anything.
async fn keyscan(host: &str, port: u16) -> Result<HostKey, SshError> {
    let mut cmd = RemoteCommand::local("ssh-keyscan");
    cmd.args(["-t", "ed25519", "-p"]);
    cmd.arg(port.to_string());
    cmd.arg(host);
    let cancel = CancellationToken::new();
    let mut handler = nixops_command::handler::NoopHandler;
    let (_, out) = cmd
        .run_captured(Duration::from_secs(10), &cancel, &mut handler)
        .await
        .map_err(|_| SshError::Unreachable(host.to_owned()))?;
    let text = String::from_utf8_lossy(&out);
    debug!(host, "ssh-keyscan output received");
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        if let (Some(h), Some(keytype), Some(key)) = (parts.next(), parts.next(), parts.next()) {
            return Ok(HostKey {
                host: h.to_owned(),
                keytype: keytype.to_owned(),
                base64_key: key.to_owned(),
            });
        }
    }
    Err(SshError::Unreachable(host.to_owned()))
}
