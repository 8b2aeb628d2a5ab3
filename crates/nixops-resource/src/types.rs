//! The two custom resource kinds (spec §3) and their shared sub-types.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use nixops_shared::SecretKeyRef;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_ssh_port() -> u16 {
    22
}

fn default_git_ref() -> String {
    "HEAD".to_owned()
}

fn default_true() -> bool {
    true
}

/// A generic status condition, the same shape Kubernetes' own API
/// conventions and every controller in the retrieval pack use.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

pub fn upsert_condition(conditions: &mut Vec<Condition>, mut new: Condition) {
    new.last_transition_time.get_or_insert_with(Utc::now);
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) {
        if existing.status != new.status {
            *existing = new;
        } else {
            // Status unchanged: keep the original transition time, only
            // refresh reason/message.
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

/// spec §3 "Machine": one remotely reachable host.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "nixops.example.io",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines",
    namespaced,
    status = "MachineStatus",
    shortname = "mach"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// DNS name or IPv4/IPv6 literal.
    pub hostname: String,
    pub ssh_user: String,
    /// Secret containing the `ssh-privatekey` (PEM) field.
    pub ssh_key_secret_ref: SecretKeyRef,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default)]
    pub reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reachable_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub facts: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub has_configuration: bool,
    #[serde(default)]
    pub applied_configuration: String,
    #[serde(default)]
    pub applied_commit: String,
    #[serde(default)]
    pub applied_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// One `additionalFiles` entry (spec §3, §4.6). Exactly one of `inline`,
/// `secretRef`, `hardwareFacts` must be set; validated by the file injector
/// rather than the schema, since CRD `oneOf` support across client
/// generators is inconsistent.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_facts: Option<bool>,
}

/// spec §3 "NixosConfiguration": desired state for exactly one Machine.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "nixops.example.io",
    version = "v1alpha1",
    kind = "NixosConfiguration",
    plural = "nixosconfigurations",
    namespaced,
    status = "NixosConfigurationStatus",
    shortname = "nixcfg"
)]
#[serde(rename_all = "camelCase")]
pub struct NixosConfigurationSpec {
    pub git_repo: String,
    #[serde(default = "default_git_ref")]
    pub git_ref: String,
    pub flake: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_subdir: Option<String>,
    #[serde(default)]
    pub full_install: bool,
    pub machine_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_credentials_secret_ref: Option<SecretKeyRef>,
    #[serde(default)]
    pub additional_files: Vec<AdditionalFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_remove_flake: Option<String>,
    /// Q2: whether tear-down should proceed when the Machine is
    /// unreachable. Defaults to `true` (skip tear-down, still release
    /// ownership and finalize) per DESIGN.md's open-question resolution.
    #[serde(default = "default_true")]
    pub skip_on_unreachable: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    Pending,
    Resolving,
    Building,
    Applying,
    Applied,
    Failed,
    Deleting,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Resolving => "Resolving",
            Phase::Building => "Building",
            Phase::Applying => "Applying",
            Phase::Applied => "Applied",
            Phase::Failed => "Failed",
            Phase::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NixosConfigurationStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub applied_commit: String,
    #[serde(default)]
    pub applied_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

pub const FINALIZER: &str = "nixosconfigurations.nixops.example.io/finalizer";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_condition_replaces_on_status_change_and_keeps_transition_time_otherwise() {
        let mut conditions = Vec::new();
        upsert_condition(
            &mut conditions,
            Condition {
                type_: "Reachable".into(),
                status: "False".into(),
                reason: Some("Probing".into()),
                message: None,
                last_transition_time: None,
            },
        );
        let first_time = conditions[0].last_transition_time;

        upsert_condition(
            &mut conditions,
            Condition {
                type_: "Reachable".into(),
                status: "False".into(),
                reason: Some("StillDown".into()),
                message: None,
                last_transition_time: None,
            },
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason.as_deref(), Some("StillDown"));
        assert_eq!(conditions[0].last_transition_time, first_time);

        upsert_condition(
            &mut conditions,
            Condition {
                type_: "Reachable".into(),
                status: "True".into(),
                reason: Some("Probed".into()),
                message: None,
                last_transition_time: None,
            },
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
        assert_ne!(conditions[0].last_transition_time, first_time);
    }
}
