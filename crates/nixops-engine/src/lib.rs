//! C2-C10: everything the reconcile loop needs beyond the typed resource
//! store (`nixops_resource`) and the streaming command runner
//! (`nixops_command`) that this crate builds on.

pub mod applier;
pub mod errors;
pub mod facts;
pub mod fingerprint;
pub mod git_workspace;
pub mod injector;
pub mod known_hosts;
pub mod leader;
pub mod metrics;
pub mod reconcile;
pub mod scheduler;
pub mod ssh;
pub mod vault;

pub use errors::{ApplyError, Disposition, EngineError, GitError, InjectError, SshError, VaultError};
pub use known_hosts::KnownHosts;
pub use leader::{LeaderElector, LeaseError};
pub use metrics::Metrics;
pub use reconcile::{error_policy, reconcile, EngineContext, RetryTracker};
pub use scheduler::{Scheduler, TickIntervals};
pub use ssh::{ConnectSpec, SshTransport};
pub use vault::Vault;
