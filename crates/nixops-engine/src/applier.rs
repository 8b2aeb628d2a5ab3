//! C8: remote applier. Invokes the system-config toolchain over an already
//! open, host-key-pinned SSH session (spec §4.8) in one of two modes, under
//! a strict timeout with streamed + tailed output.

use std::sync::Arc;
use std::time::Duration;

use nixops_command::handler::{Handler, TeeHandler};
use openssh::Session;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::{ApplyError, SshError};
use crate::ssh::SshTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// First-ever activation of a host with no existing NixOS install: an
    /// in-kernel handoff (kexec) into the target generation.
    Bootstrap,
    /// A normal `switch-to-configuration`-style activation on an already
    /// bootstrapped host.
    Switch,
}

impl ApplyMode {
    fn program(self) -> &'static str {
        match self {
            ApplyMode::Bootstrap => "nixos-remote-bootstrap",
            ApplyMode::Switch => "nixos-remote-switch",
        }
    }
}

pub struct ApplyRequest {
    pub mode: ApplyMode,
    pub flake_selector: String,
    pub timeout: Duration,
    pub tail_cap_bytes: usize,
}

/// Runs the apply, streaming every line through `PlainHandler`-equivalent
/// tracing while also retaining a bounded tail for the failure path. Any
/// non-zero exit is `ApplyError::Failed` with that tail attached (spec §4.8,
/// §7 "captured tail of output").
pub async fn apply(
    transport: &SshTransport,
    session: &Arc<Session>,
    req: &ApplyRequest,
    cancel: &CancellationToken,
) -> Result<(), ApplyError> {
    info!(mode = ?req.mode, flake = %req.flake_selector, "starting remote apply");
    let mut forward = nixops_command::handler::PlainHandler;
    let mut tee = TeeHandler::new(&mut forward, req.tail_cap_bytes);
    let args = match req.mode {
        ApplyMode::Bootstrap => vec!["--flake".to_owned(), req.flake_selector.clone()],
        ApplyMode::Switch => vec![
            "switch".to_owned(),
            "--flake".to_owned(),
            req.flake_selector.clone(),
        ],
    };
    let result = transport
        .run(
            session,
            req.mode.program(),
            &args,
            req.timeout,
            cancel,
            &mut tee as &mut dyn Handler,
        )
        .await;
    let tail = tee.into_tail();
    match result {
        Ok(_) => Ok(()),
        Err(SshError::Timeout) => Err(ApplyError::Timeout(req.timeout)),
        Err(SshError::RemoteExecFailed { exit }) => Err(ApplyError::Failed { exit, tail }),
        Err(other) => Err(ApplyError::Ssh(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_names_differ_by_mode() {
        assert_ne!(ApplyMode::Bootstrap.program(), ApplyMode::Switch.program());
    }
}
