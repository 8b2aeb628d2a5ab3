//! The master error type the reconcile loop (C9) classifies against spec
//! §7's disposition table, plus the per-component errors that fold into it.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("secret missing: {0}/{1}")]
    SecretMissing(String, String),
    #[error("secret key {2} missing on {0}/{1}")]
    SecretKeyMissing(String, String, String),
    #[error("secret malformed: {0}")]
    SecretMalformed(String),
    #[error("io error materializing key file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("host key mismatch for {0}: expected {1}, observed {2}")]
    HostKeyMismatch(String, String, String),
    #[error("remote command failed with exit {exit}")]
    RemoteExecFailed { exit: i32 },
    #[error("timed out")]
    Timeout,
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("ref not found: {0}")]
    RefNotFound(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("git error: {0}")]
    Git(#[from] git2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("unsafe path: {0}")]
    UnsafePath(String),
    #[error("path collision: {0}")]
    PathCollision(String),
    #[error("additionalFiles[{0}].path={1} sets none or more than one of inline/secretRef/hardwareFacts")]
    AmbiguousSource(usize, String),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("apply failed with exit {exit}, tail:\n{tail}")]
    Failed { exit: i32, tail: String },
    #[error("apply timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Ssh(#[from] SshError),
}

/// The engine-wide error every reconcile step funnels into so C9 can apply
/// one classification table (spec §7) regardless of which component failed.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("machineRef {0} not found")]
    MissingMachine(String),
    #[error("{0} is already owned by {1}")]
    OwnershipConflict(String, String),
    #[error(transparent)]
    Ssh(#[from] SshError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Inject(#[from] InjectError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Store(#[from] nixops_resource::StoreError),
    #[error("status patch conflicted repeatedly")]
    StatusConflict,
}

/// How the scheduler (C10) should react to a given failure, per spec §7's
/// disposition column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back off briefly and retry automatically.
    RetryShort,
    /// Back off for a long interval (the `Unreachable` cap, spec §5: "a
    /// separate longer cap (>=5 min)").
    RetryLong,
    /// Surface in status/condition and wait for a spec edit or operator
    /// action; still re-queued, but at a conservative cadence.
    Terminal,
}

impl EngineError {
    pub fn disposition(&self) -> Disposition {
        match self {
            EngineError::Ssh(SshError::Unreachable(_)) => Disposition::RetryLong,
            EngineError::Ssh(_) => Disposition::RetryShort,
            EngineError::Git(GitError::RefNotFound(_)) => Disposition::Terminal,
            EngineError::Git(GitError::AuthFailed(_)) => Disposition::Terminal,
            EngineError::Git(_) => Disposition::RetryShort,
            EngineError::Vault(_) => Disposition::Terminal,
            EngineError::Inject(_) => Disposition::Terminal,
            EngineError::Apply(ApplyError::Failed { .. }) => Disposition::Terminal,
            EngineError::Apply(_) => Disposition::RetryShort,
            EngineError::MissingMachine(_) => Disposition::Terminal,
            EngineError::OwnershipConflict(_, _) => Disposition::Terminal,
            EngineError::Store(nixops_resource::StoreError::Conflict(_, _, _)) => {
                Disposition::RetryShort
            }
            EngineError::Store(_) => Disposition::RetryShort,
            EngineError::StatusConflict => Disposition::RetryShort,
        }
    }

    /// The `reason` surfaced on the NixosConfiguration's `Ready`/`Applied`
    /// condition and in the `ApplyFailed`/`ReconcileFailed` event.
    pub fn condition_reason(&self) -> &'static str {
        match self {
            EngineError::MissingMachine(_) => "MissingMachine",
            EngineError::OwnershipConflict(_, _) => "Conflict",
            EngineError::Ssh(SshError::Unreachable(_)) => "Unreachable",
            EngineError::Ssh(SshError::AuthFailed(_)) => "AuthFailed",
            EngineError::Ssh(SshError::HostKeyMismatch(_, _, _)) => "HostKeyMismatch",
            EngineError::Ssh(SshError::RemoteExecFailed { .. }) => "RemoteExecFailed",
            EngineError::Ssh(SshError::Timeout) => "Timeout",
            EngineError::Ssh(SshError::Io(_)) => "IO",
            EngineError::Git(GitError::RefNotFound(_)) => "RefNotFound",
            EngineError::Git(GitError::AuthFailed(_)) => "AuthFailed",
            EngineError::Git(GitError::NetworkError(_)) => "NetworkError",
            EngineError::Git(_) => "GitError",
            EngineError::Vault(_) => "SecretMissing",
            EngineError::Inject(InjectError::PathCollision(_)) => "PathCollision",
            EngineError::Inject(_) => "InjectError",
            EngineError::Apply(ApplyError::Failed { .. }) => "ApplyFailed",
            EngineError::Apply(ApplyError::Timeout(_)) => "Timeout",
            EngineError::Apply(ApplyError::Ssh(_)) => "ApplyError",
            EngineError::Store(nixops_resource::StoreError::Conflict(_, _, _)) => "ConflictError",
            EngineError::Store(_) => "StoreError",
            EngineError::StatusConflict => "ConflictError",
        }
    }
}
