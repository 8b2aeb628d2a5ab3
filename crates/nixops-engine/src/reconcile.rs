//! C9: the reconcile loop state machine (spec §4.9). One invocation per
//! `NixosConfiguration` change or tick; `kube::runtime::Controller` (wired
//! in `cmds/nixops-operator`) supplies per-object mutual exclusion and
//! watch-triggered re-queues, this function supplies everything inside one
//! tick.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::Resource;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use nixops_resource::{
    upsert_condition, Condition, Machine, MachineStatus, NixosConfiguration,
    NixosConfigurationStatus, Phase, ResourceStore, FINALIZER,
};

use crate::applier::{self, ApplyMode, ApplyRequest};
use crate::errors::{Disposition, EngineError, SshError};
use crate::facts;
use crate::fingerprint::{self, DesiredState};
use crate::git_workspace::{self, OwnedGitCredential};
use crate::injector;
use crate::metrics::Metrics;
use crate::scheduler::Scheduler;
use crate::ssh::{ConnectSpec, SshTransport};
use crate::vault::Vault;

pub struct EngineContext {
    pub store: ResourceStore,
    pub vault: Vault,
    pub ssh: SshTransport,
    pub scheduler: Scheduler,
    pub metrics: Metrics,
    pub retries: RetryTracker,
    pub workspace_base: PathBuf,
    pub apply_timeout: Duration,
    pub probe_timeout: Duration,
    pub facts_timeout: Duration,
    pub apply_tail_cap_bytes: usize,
}

/// Tracks consecutive-failure counts per resource key for backoff math;
/// reset on success (spec §4.9 step 7 "retry counter... resets on
/// success"). Keyed by `namespace/name`.
#[derive(Default)]
pub struct RetryTracker {
    attempts: std::sync::Mutex<std::collections::HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut map = self.attempts.lock().unwrap();
        let entry = map.entry(key.to_owned()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn reset(&self, key: &str) {
        self.attempts.lock().unwrap().remove(key);
    }
}

fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

/// `kube::CustomResource`'s generated `status` field is `Option<S>` (absent
/// until the first status subresource write); every read site treats a
/// missing status as the type's `Default`, same as a freshly created
/// object that hasn't been reconciled yet.
fn machine_status(machine: &Machine) -> MachineStatus {
    machine.status.clone().unwrap_or_default()
}

#[instrument(skip_all, fields(namespace = %nc.namespace().unwrap_or_default(), name = %nc.name_any()))]
pub async fn reconcile(
    nc: Arc<NixosConfiguration>,
    ctx: Arc<EngineContext>,
) -> Result<Action, EngineError> {
    let _permit = ctx.scheduler.concurrency.acquire().await;
    let start = Instant::now();
    let namespace = nc.namespace().unwrap_or_else(|| "default".to_owned());
    let name = nc.name_any();
    let key = format!("{namespace}/{name}");
    let nc_api: Api<NixosConfiguration> = ctx.store.api(&namespace);
    let machine_api: Api<Machine> = ctx.store.api(&namespace);

    if nc.meta().deletion_timestamp.is_some() {
        let outcome = handle_deletion(&nc, &ctx, &nc_api, &machine_api)
            .await
            .map(|action| (action, "success"));
        return finish(&ctx, &key, outcome, start);
    }

    ctx.store.add_finalizer(&nc_api, &name, FINALIZER).await?;

    let outcome = reconcile_active(&nc, &ctx, &namespace, &name, &nc_api, &machine_api).await;
    finish(&ctx, &key, outcome, start)
}

/// `label` is the `reconciles_total`/`reconcile_duration_seconds` result
/// value: `"noop"` for the idempotence short-circuit (spec §8 scenario 3),
/// `"success"` for everything else that didn't error.
fn finish(
    ctx: &EngineContext,
    key: &str,
    outcome: Result<(Action, &'static str), EngineError>,
    start: Instant,
) -> Result<Action, EngineError> {
    let elapsed = start.elapsed();
    match &outcome {
        Ok((_, label)) => {
            ctx.retries.reset(key);
            ctx.metrics
                .reconciles_total
                .with_label_values(&[label])
                .inc();
            ctx.metrics
                .reconcile_duration_seconds
                .with_label_values(&[label])
                .observe(elapsed.as_secs_f64());
        }
        Err(e) => {
            ctx.retries.record_failure(key);
            ctx.metrics
                .reconciles_total
                .with_label_values(&["failure"])
                .inc();
            ctx.metrics
                .reconcile_duration_seconds
                .with_label_values(&["failure"])
                .observe(elapsed.as_secs_f64());
            warn!(error = %e, "reconcile failed");
        }
    }
    outcome.map(|(action, _)| action)
}

async fn reconcile_active(
    nc: &NixosConfiguration,
    ctx: &EngineContext,
    namespace: &str,
    name: &str,
    nc_api: &Api<NixosConfiguration>,
    machine_api: &Api<Machine>,
) -> Result<(Action, &'static str), EngineError> {
    // Step 2: resolve Machine.
    let machine = ctx
        .store
        .get(machine_api, &nc.spec.machine_ref)
        .await
        .map_err(|_| EngineError::MissingMachine(nc.spec.machine_ref.clone()))?;

    let connect = ConnectSpec {
        host: machine.spec.hostname.clone(),
        port: machine.spec.ssh_port,
        user: machine.spec.ssh_user.clone(),
    };

    // Probe reachability through C4, guarded by C3 inside `open_session`.
    let ssh_cred = ctx
        .vault
        .ssh_key(namespace, &machine.spec.ssh_key_secret_ref)
        .await?;
    let key_guard = ctx
        .vault
        .materialize_key_file(&ssh_cred, &ctx.workspace_base)
        .await?;
    let probe = ctx.ssh.probe(&connect, key_guard.path()).await;

    let probe = match probe {
        Ok(p) => p,
        Err(e) => {
            mark_unreachable(ctx, machine_api, &machine).await?;
            return Err(classify_ssh_failure(ctx, e));
        }
    };
    if !probe.reachable {
        mark_unreachable(ctx, machine_api, &machine).await?;
        return Err(EngineError::Ssh(SshError::Unreachable(connect.host.clone())));
    }

    // Ownership (invariant I: at most one NixosConfiguration owns a
    // Machine at a time).
    let machine_state = machine_status(&machine);
    if !machine_state.applied_configuration.is_empty()
        && machine_state.applied_configuration != name
    {
        return Err(EngineError::OwnershipConflict(
            machine_state.applied_configuration.clone(),
            name.to_owned(),
        ));
    }

    // Step 3-4: materialize workspace, resolve `additionalFiles` against the
    // Machine's last-known facts (no fresh SSH round trip yet) and compute
    // what the fingerprint would be if nothing needs to change.
    let git_cred = match &nc.spec.git_credentials_secret_ref {
        Some(secret_ref) => Some(OwnedGitCredential::from_vault(
            &ctx.vault.git_credentials(namespace, secret_ref).await?,
        )),
        None => None,
    };
    let workspace = git_workspace::prepare(
        &ctx.workspace_base,
        nc.spec.git_repo.clone(),
        nc.spec.git_ref.clone(),
        git_cred,
    )
    .await?;
    let workdir = git_workspace::resolve_subdir(
        workspace.path(),
        nc.spec.configuration_subdir.as_deref(),
    );

    let cached_resolved_files = injector::resolve_files(
        &ctx.vault,
        namespace,
        &nc.spec.additional_files,
        &machine_state.facts,
    )
    .await?;
    let preview_records = injector::would_produce(&workdir, &cached_resolved_files).await?;
    let preview_fp = fingerprint::compute(&DesiredState {
        resolved_commit: &workspace.resolved_commit,
        flake: &nc.spec.flake,
        configuration_subdir: nc.spec.configuration_subdir.as_deref(),
        full_install: nc.spec.full_install,
        files: &preview_records,
    });

    // Step 5: idempotence decision. Same configuration already applied to
    // the same owning Machine at the same fingerprint — no SSH session
    // beyond the reachability probe above, and no Machine status mutation,
    // is needed (P3).
    if machine_state.applied_configuration == name
        && machine_state.applied_fingerprint == preview_fp.to_hex()
        && machine_state.applied_commit == workspace.resolved_commit
    {
        patch_nc_status_if_changed(ctx, nc_api, name, |status| {
            status.phase = Phase::Applied;
            status.observed_generation = nc.meta().generation.unwrap_or_default();
            status.applied_commit = workspace.resolved_commit.clone();
            status.applied_fingerprint = preview_fp.to_hex();
            status.last_error = None;
        })
        .await?;
        return Ok((Action::requeue(ctx.scheduler.intervals.configuration), "noop"));
    }

    // Real work is needed: now open the session beyond the probe, re-gather
    // facts (hardwareFacts-sourced files must reflect current state), and
    // inject for real.
    let session = ctx.ssh.open_session(&connect, key_guard.path()).await?;
    let collected_facts = facts::gather(&ctx.ssh, &session, ctx.facts_timeout).await?;
    update_machine_reachable(ctx, machine_api, &machine, &collected_facts).await?;

    let resolved_files = injector::resolve_files(
        &ctx.vault,
        namespace,
        &nc.spec.additional_files,
        &collected_facts,
    )
    .await?;
    let injected = injector::inject(&workdir, &resolved_files).await?;

    // Step 5 (re-evaluated): facts may have changed since the preview, so
    // recompute against what was actually injected.
    let desired = DesiredState {
        resolved_commit: &workspace.resolved_commit,
        flake: &nc.spec.flake,
        configuration_subdir: nc.spec.configuration_subdir.as_deref(),
        full_install: nc.spec.full_install,
        files: &injected,
    };
    let fp = fingerprint::compute(&desired);

    if machine_state.applied_configuration == name
        && machine_state.applied_fingerprint == fp.to_hex()
        && machine_state.applied_commit == workspace.resolved_commit
    {
        patch_nc_status_if_changed(ctx, nc_api, name, |status| {
            status.phase = Phase::Applied;
            status.observed_generation = nc.meta().generation.unwrap_or_default();
            status.applied_commit = workspace.resolved_commit.clone();
            status.applied_fingerprint = fp.to_hex();
            status.last_error = None;
        })
        .await?;
        return Ok((Action::requeue(ctx.scheduler.intervals.configuration), "noop"));
    }

    // Step 6: apply.
    set_nc_phase(ctx, nc_api, name, Phase::Applying).await?;
    ctx.store
        .emit_event(nc, EventType::Normal, "ApplyStarted", "remote apply starting")
        .await;

    let mode = if nc.spec.full_install || !machine_state.has_configuration {
        ApplyMode::Bootstrap
    } else {
        ApplyMode::Switch
    };
    let flake_selector = format!("{}#{}", workdir.display(), nc.spec.flake);
    let apply_result = applier::apply(
        &ctx.ssh,
        &session,
        &ApplyRequest {
            mode,
            flake_selector,
            timeout: ctx.apply_timeout,
            tail_cap_bytes: ctx.apply_tail_cap_bytes,
        },
        &CancellationToken::new(),
    )
    .await;

    ctx.metrics
        .apply_total
        .with_label_values(&[mode_label(mode), if apply_result.is_ok() { "success" } else { "failure" }])
        .inc();

    match apply_result {
        Ok(()) => {
            // Two-step write in this exact order (spec §4.9 step 6):
            // Machine status first, then NixosConfiguration status.
            patch_machine_status(ctx, machine_api, &machine.name_any(), |status| {
                status.applied_configuration = name.to_owned();
                status.applied_commit = workspace.resolved_commit.clone();
                status.applied_fingerprint = fp.to_hex();
                status.has_configuration = true;
                status.last_applied_at = Some(now());
            })
            .await?;
            patch_nc_status(ctx, nc_api, name, |status| {
                status.phase = Phase::Applied;
                status.observed_generation = nc.meta().generation.unwrap_or_default();
                status.applied_commit = workspace.resolved_commit.clone();
                status.applied_fingerprint = fp.to_hex();
                status.last_error = None;
            })
            .await?;
            ctx.store
                .emit_event(nc, EventType::Normal, "ApplySucceeded", "remote apply completed")
                .await;
            Ok((Action::requeue(ctx.scheduler.intervals.configuration), "success"))
        }
        Err(e) => {
            let engine_err = EngineError::from(e);
            record_failure_status(ctx, nc_api, name, &engine_err).await?;
            ctx.store
                .emit_event(
                    nc,
                    EventType::Warning,
                    "ApplyFailed",
                    &format!("remote apply failed: {engine_err}"),
                )
                .await;
            Err(engine_err)
        }
    }
}

fn mode_label(mode: ApplyMode) -> &'static str {
    match mode {
        ApplyMode::Bootstrap => "bootstrap",
        ApplyMode::Switch => "switch",
    }
}

/// Deletion branch (spec §4.9 "Deleting branch"): optional tear-down apply,
/// then release ownership, then remove the finalizer.
async fn handle_deletion(
    nc: &NixosConfiguration,
    ctx: &EngineContext,
    nc_api: &Api<NixosConfiguration>,
    machine_api: &Api<Machine>,
) -> Result<Action, EngineError> {
    let namespace = nc.namespace().unwrap_or_else(|| "default".to_owned());
    let name = nc.name_any();
    if !nc.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(Action::await_change());
    }

    set_nc_phase(ctx, nc_api, &name, Phase::Deleting).await?;

    let machine = ctx.store.get(machine_api, &nc.spec.machine_ref).await.ok();
    let owns = machine
        .as_ref()
        .map(|m| machine_status(m).applied_configuration == name)
        .unwrap_or(false);

    if let (Some(teardown_flake), Some(machine)) = (&nc.spec.on_remove_flake, &machine) {
        if owns {
            let connect = ConnectSpec {
                host: machine.spec.hostname.clone(),
                port: machine.spec.ssh_port,
                user: machine.spec.ssh_user.clone(),
            };
            let ssh_cred = ctx
                .vault
                .ssh_key(&namespace, &machine.spec.ssh_key_secret_ref)
                .await?;
            let key_guard = ctx
                .vault
                .materialize_key_file(&ssh_cred, &ctx.workspace_base)
                .await?;
            match ctx.ssh.open_session(&connect, key_guard.path()).await {
                Ok(session) => {
                    let result = applier::apply(
                        &ctx.ssh,
                        &session,
                        &ApplyRequest {
                            mode: ApplyMode::Switch,
                            flake_selector: teardown_flake.clone(),
                            timeout: ctx.apply_timeout,
                            tail_cap_bytes: ctx.apply_tail_cap_bytes,
                        },
                        &CancellationToken::new(),
                    )
                    .await;
                    if let Err(e) = result {
                        let engine_err = EngineError::from(e);
                        if engine_err.disposition() == Disposition::RetryShort {
                            record_failure_status(ctx, nc_api, &name, &engine_err).await?;
                            return Err(engine_err);
                        }
                        warn!(error = %engine_err, "tear-down apply failed terminally, proceeding with finalize");
                    }
                }
                Err(e) if nc.spec.skip_on_unreachable => {
                    info!(error = %e, "machine unreachable during tear-down, skipping per skipOnUnreachable");
                }
                Err(e) => return Err(EngineError::from(e)),
            }
        }
    }

    if owns {
        patch_machine_status(ctx, machine_api, &nc.spec.machine_ref, |status| {
            status.applied_configuration.clear();
            status.applied_commit.clear();
            status.applied_fingerprint.clear();
            status.has_configuration = false;
        })
        .await?;
    }

    ctx.store.remove_finalizer(nc_api, &name, FINALIZER).await?;
    Ok(Action::await_change())
}

async fn record_failure_status(
    ctx: &EngineContext,
    nc_api: &Api<NixosConfiguration>,
    name: &str,
    err: &EngineError,
) -> Result<(), EngineError> {
    patch_nc_status(ctx, nc_api, name, |status| {
        status.phase = Phase::Failed;
        status.last_error = Some(err.to_string());
        upsert_condition(
            &mut status.conditions,
            Condition {
                type_: "Ready".into(),
                status: "False".into(),
                reason: Some(err.condition_reason().to_owned()),
                message: Some(err.to_string()),
                last_transition_time: None,
            },
        );
    })
    .await
}

async fn mark_unreachable(
    ctx: &EngineContext,
    machine_api: &Api<Machine>,
    machine: &Machine,
) -> Result<(), EngineError> {
    patch_machine_status(ctx, machine_api, &machine.name_any(), |status| {
        status.reachable = false;
        upsert_condition(
            &mut status.conditions,
            Condition {
                type_: "Reachable".into(),
                status: "False".into(),
                reason: Some("Unreachable".into()),
                message: None,
                last_transition_time: None,
            },
        );
    })
    .await
}

async fn update_machine_reachable(
    ctx: &EngineContext,
    machine_api: &Api<Machine>,
    machine: &Machine,
    facts: &std::collections::BTreeMap<String, String>,
) -> Result<(), EngineError> {
    let facts = facts.clone();
    patch_machine_status(ctx, machine_api, &machine.name_any(), move |status| {
        status.reachable = true;
        status.last_reachable_at = Some(now());
        status.facts = facts.clone();
        upsert_condition(
            &mut status.conditions,
            Condition {
                type_: "Reachable".into(),
                status: "True".into(),
                reason: Some("Probed".into()),
                message: None,
                last_transition_time: None,
            },
        );
    })
    .await
}

async fn patch_machine_status(
    ctx: &EngineContext,
    api: &Api<Machine>,
    name: &str,
    mutate: impl FnOnce(&mut MachineStatus),
) -> Result<(), EngineError> {
    let current = ctx.store.get(api, name).await?;
    let mut status = current.status.clone().unwrap_or_default();
    mutate(&mut status);
    ctx.store
        .patch_status(api, name, serde_json::to_value(&status).unwrap())
        .await?;
    Ok(())
}

async fn patch_nc_status(
    ctx: &EngineContext,
    api: &Api<NixosConfiguration>,
    name: &str,
    mutate: impl FnOnce(&mut NixosConfigurationStatus),
) -> Result<(), EngineError> {
    let current = ctx.store.get(api, name).await?;
    let mut status = current.status.clone().unwrap_or_default();
    mutate(&mut status);
    status.last_transition_at = Some(now());
    ctx.store
        .patch_status(api, name, serde_json::to_value(&status).unwrap())
        .await?;
    Ok(())
}

/// Like `patch_nc_status`, but skips the write entirely when `mutate`
/// produces a status identical to the one already stored — used by the
/// idempotence short-circuit so a true no-op reconcile leaves
/// `last_transition_at` and every other field byte-identical (spec §8
/// scenario 3 "status unchanged").
async fn patch_nc_status_if_changed(
    ctx: &EngineContext,
    api: &Api<NixosConfiguration>,
    name: &str,
    mutate: impl FnOnce(&mut NixosConfigurationStatus),
) -> Result<(), EngineError> {
    let current = ctx.store.get(api, name).await?;
    let mut status = current.status.clone().unwrap_or_default();
    let before = status.clone();
    mutate(&mut status);
    if status == before {
        return Ok(());
    }
    status.last_transition_at = Some(now());
    ctx.store
        .patch_status(api, name, serde_json::to_value(&status).unwrap())
        .await?;
    Ok(())
}

async fn set_nc_phase(
    ctx: &EngineContext,
    api: &Api<NixosConfiguration>,
    name: &str,
    phase: Phase,
) -> Result<(), EngineError> {
    patch_nc_status(ctx, api, name, |status| {
        status.phase = phase;
    })
    .await
}

fn classify_ssh_failure(ctx: &EngineContext, err: SshError) -> EngineError {
    let kind = match &err {
        SshError::Unreachable(_) => "unreachable",
        SshError::AuthFailed(_) => "auth_failed",
        SshError::HostKeyMismatch(_, _, _) => "host_key_mismatch",
        SshError::RemoteExecFailed { .. } => "remote_exec_failed",
        SshError::Timeout => "timeout",
        SshError::Io(_) => "io",
    };
    ctx.metrics
        .ssh_failures_total
        .with_label_values(&[kind])
        .inc();
    EngineError::Ssh(err)
}

/// Backoff-aware error policy fed to `Controller::run`'s `error_policy`
/// callback (spec §4.9 step 7).
pub fn error_policy(nc: Arc<NixosConfiguration>, err: &EngineError, ctx: Arc<EngineContext>) -> Action {
    let namespace = nc.namespace().unwrap_or_else(|| "default".to_owned());
    let key = format!("{namespace}/{}", nc.name_any());
    let attempt = {
        let map = ctx.retries.attempts.lock().unwrap();
        *map.get(&key).unwrap_or(&1)
    };
    match err.disposition() {
        Disposition::RetryShort => Action::requeue(ctx.scheduler.short_backoff.delay(attempt)),
        Disposition::RetryLong => Action::requeue(ctx.scheduler.long_backoff.delay(attempt)),
        Disposition::Terminal => {
            Action::requeue(ctx.scheduler.long_backoff.delay(attempt.min(1)))
        }
    }
}
