//! Every spec §6 tunable as a `clap::Parser` field, the same flag-or-env
//! pattern `FleetOpts` uses in `crates/fleet-base/src/opts.rs`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, author, about = "NixOS fleet reconciliation operator")]
pub struct OperatorOpts {
    /// Base directory for per-reconcile scratch state (git checkouts, key
    /// material). Defaults to a memory-backed scratch path.
    #[arg(long, env = "NIXOPS_WORKSPACE_BASE", default_value = "/dev/shm/nixops-operator")]
    pub workspace_base: PathBuf,

    /// OpenSSH `known_hosts`-format file this process both consults and
    /// appends to (spec §4.3 TOFU).
    #[arg(long, env = "NIXOPS_KNOWN_HOSTS_PATH", default_value = "/var/lib/nixops-operator/known_hosts")]
    pub known_hosts_path: PathBuf,

    /// Periodic tick for converged NixosConfigurations.
    #[arg(long, env = "NIXOPS_CONFIGURATION_INTERVAL_SECS", default_value_t = 120)]
    pub configuration_interval_secs: u64,

    /// Periodic tick for Machines.
    #[arg(long, env = "NIXOPS_MACHINE_INTERVAL_SECS", default_value_t = 60)]
    pub machine_interval_secs: u64,

    /// Upper bound on one remote apply invocation (spec §4.8 default 3600s).
    #[arg(long, env = "NIXOPS_APPLY_TIMEOUT_SECS", default_value_t = 3600)]
    pub apply_timeout_secs: u64,

    /// Timeout for the reachability probe.
    #[arg(long, env = "NIXOPS_PROBE_TIMEOUT_SECS", default_value_t = 15)]
    pub probe_timeout_secs: u64,

    /// Timeout for hardware fact gathering.
    #[arg(long, env = "NIXOPS_FACTS_TIMEOUT_SECS", default_value_t = 30)]
    pub facts_timeout_secs: u64,

    /// SSH connect timeout (spec §4.4).
    #[arg(long, env = "NIXOPS_SSH_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub ssh_connect_timeout_secs: u64,

    /// Initial backoff delay for transient errors (spec §5).
    #[arg(long, env = "NIXOPS_RETRY_INITIAL_DELAY_SECS", default_value_t = 2)]
    pub retry_initial_delay_secs: u64,

    /// Backoff cap for transient errors (spec §5).
    #[arg(long, env = "NIXOPS_RETRY_CAP_SECS", default_value_t = 30)]
    pub retry_cap_secs: u64,

    /// Backoff cap applied to `Unreachable` classifications (spec §5: "a
    /// separate longer cap, >=5 min").
    #[arg(long, env = "NIXOPS_UNREACHABLE_RETRY_CAP_SECS", default_value_t = 600)]
    pub unreachable_retry_cap_secs: u64,

    /// Exponential backoff base (spec §5 default 2.0).
    #[arg(long, env = "NIXOPS_RETRY_BASE", default_value_t = 2.0)]
    pub retry_base: f64,

    /// Global concurrency cap across all active reconciles (spec §5).
    #[arg(long, env = "NIXOPS_MAX_PARALLEL_RECONCILES", default_value_t = 16)]
    pub max_parallel_reconciles: usize,

    /// Bytes of applier stdout/stderr retained for status/event surfacing
    /// (spec §4.8/§7 "captured tail of output").
    #[arg(long, env = "NIXOPS_APPLY_TAIL_CAP_BYTES", default_value_t = 16 * 1024)]
    pub apply_tail_cap_bytes: usize,

    /// Drain period before forced teardown on shutdown (spec §4.9
    /// "Cancellation and timeouts", <=30s).
    #[arg(long, env = "NIXOPS_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Port for Prometheus `/metrics`.
    #[arg(long, env = "NIXOPS_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Port for `/healthz`, `/readyz`, `/startupz`.
    #[arg(long, env = "NIXOPS_HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,

    /// `RUST_LOG`-style env-filter directive, e.g. `info` or
    /// `nixops_engine=debug`.
    #[arg(long, env = "NIXOPS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// `text` (default, human-readable) or `json` (structured).
    #[arg(long, env = "NIXOPS_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Namespace holding the leader-election Lease. Defaults to the
    /// operator's own namespace via the downward API.
    #[arg(long, env = "NIXOPS_LEASE_NAMESPACE", default_value = "default")]
    pub lease_namespace: String,

    /// Name of the Lease object used for leader election.
    #[arg(long, env = "NIXOPS_LEASE_NAME", default_value = "nixops-operator")]
    pub lease_name: String,

    /// This replica's unique identity in the Lease (defaults to the pod
    /// hostname, the same `hostname::get()` fallback `FleetOpts` uses).
    #[arg(long, env = "NIXOPS_LEASE_IDENTITY")]
    pub lease_identity: Option<String>,

    /// How long a held lease is valid without renewal.
    #[arg(long, env = "NIXOPS_LEASE_DURATION_SECS", default_value_t = 15)]
    pub lease_duration_secs: u64,
}

impl OperatorOpts {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn facts_timeout(&self) -> Duration {
        Duration::from_secs(self.facts_timeout_secs)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn resolved_lease_identity(&self) -> String {
        self.lease_identity.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "nixops-operator".to_owned())
        })
    }
}
