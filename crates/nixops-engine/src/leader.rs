//! Leader election over a `coordination.k8s.io/v1` Lease (spec §5 "Leader
//! election"). Not itself one of C1-C10; every replica keeps its watch
//! caches warm, but only the current holder drives `Controller::run`, the
//! same separation `cmds/nixops-operator` uses between the watch setup and
//! the reconcile future.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tracing::{debug, info};

const FIELD_MANAGER: &str = "nixops-operator";

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// One participant in leader election for a single named Lease. Holds no
/// lock itself; `tick()` is called on an interval and reports whether this
/// identity currently holds the lease.
pub struct LeaderElector {
    api: Api<Lease>,
    name: String,
    identity: String,
    lease_duration: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, name: &str, identity: String, lease_duration: Duration) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_owned(),
            identity,
            lease_duration,
        }
    }

    /// Attempts to acquire or renew the lease. Returns whether `self` holds
    /// it after this call. Never panics on contention: losing a race just
    /// means `false` this tick, retried next tick.
    pub async fn tick(&self) -> Result<bool, LeaseError> {
        let now = Utc::now();
        let existing = self.api.get_opt(&self.name).await?;

        let holds_already = existing
            .as_ref()
            .and_then(|l| l.spec.as_ref())
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.identity.as_str());

        let expired = existing
            .as_ref()
            .and_then(|l| l.spec.as_ref())
            .and_then(|s| s.renew_time.as_ref())
            .map(|t| {
                let age = now.signed_duration_since(t.0);
                age.to_std().unwrap_or(Duration::ZERO) > self.lease_duration
            })
            .unwrap_or(true);

        if !holds_already && !expired {
            debug!(lease = %self.name, "lease held by another identity, not expired");
            return Ok(false);
        }

        let acquire_time = existing
            .as_ref()
            .and_then(|l| l.spec.as_ref())
            .and_then(|s| if holds_already { s.acquire_time.clone() } else { None })
            .unwrap_or(MicroTime(now));

        let transitions = existing
            .as_ref()
            .and_then(|l| l.spec.as_ref())
            .and_then(|s| s.lease_transitions)
            .unwrap_or(0)
            + if holds_already { 0 } else { 1 };

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(acquire_time),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        };

        self.api
            .patch(
                &self.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&lease),
            )
            .await?;

        if !holds_already {
            info!(lease = %self.name, identity = %self.identity, "acquired leader lease");
        }
        Ok(true)
    }

    pub fn name_any(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renew_time_age_uses_lease_duration_as_the_expiry_boundary() {
        let duration = Duration::from_secs(15);
        let now = Utc::now();
        let stale = now - chrono::Duration::seconds(30);
        let age = now.signed_duration_since(stale);
        assert!(age.to_std().unwrap() > duration);
    }
}
