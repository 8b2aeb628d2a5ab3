//! `cmds/nixops-operator`: wires the Kubernetes watch/reconcile loop
//! (`nixops_engine::reconcile`), leader election, and the health/metrics
//! HTTP surface into one process, the same way `cmds/fleet` wires
//! `FleetOpts` + `tracing_subscriber` + subcommands into one CLI.

mod config;
mod health;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, ResourceExt};
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

use nixops_engine::reconcile::{self, EngineContext, RetryTracker};
use nixops_engine::scheduler::{BackoffCalculator, ConcurrencyLimiter, Scheduler, TickIntervals};
use nixops_engine::errors::EngineError;
use nixops_engine::{KnownHosts, LeaderElector, Metrics, SshTransport, Vault};
use nixops_resource::{Machine, NixosConfiguration, ResourceStore};

use config::OperatorOpts;
use health::HealthState;

/// Wraps the engine context with the shared leadership signal so the
/// `Controller` can be built once, watch caches warm for the process
/// lifetime, and only the reconcile dispatch itself gate on holding the
/// lease (spec §5 "Non-leaders maintain warm caches and take over on lease
/// loss without restart").
struct GatedContext {
    engine: Arc<EngineContext>,
    leader_rx: tokio::sync::watch::Receiver<bool>,
    standby_requeue: Duration,
}

async fn gated_reconcile(
    nc: Arc<NixosConfiguration>,
    ctx: Arc<GatedContext>,
) -> Result<Action, EngineError> {
    if !*ctx.leader_rx.borrow() {
        return Ok(Action::requeue(ctx.standby_requeue));
    }
    reconcile::reconcile(nc, ctx.engine.clone()).await
}

fn gated_error_policy(nc: Arc<NixosConfiguration>, err: &EngineError, ctx: Arc<GatedContext>) -> Action {
    reconcile::error_policy(nc, err, ctx.engine.clone())
}

fn init_tracing(opts: &OperatorOpts) {
    let filter = EnvFilter::try_new(&opts.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry();
    if opts.log_format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_filter(filter))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_filter(filter))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = OperatorOpts::parse();
    init_tracing(&opts);

    let client = Client::try_default()
        .await
        .context("building kube client from in-cluster or kubeconfig context")?;

    let store = ResourceStore::new(client.clone(), "nixops-operator");
    let known_hosts = Arc::new(
        KnownHosts::load(&opts.known_hosts_path)
            .await
            .context("loading known_hosts file")?,
    );
    let ssh = SshTransport::new(known_hosts, opts.ssh_connect_timeout());
    let vault = Vault::new(store.clone());
    tokio::fs::create_dir_all(&opts.workspace_base)
        .await
        .context("creating workspace base directory")?;

    let scheduler = Scheduler {
        concurrency: ConcurrencyLimiter::new(opts.max_parallel_reconciles),
        intervals: TickIntervals {
            configuration: Duration::from_secs(opts.configuration_interval_secs),
            machine: Duration::from_secs(opts.machine_interval_secs),
        },
        short_backoff: BackoffCalculator::new(
            opts.retry_base,
            Duration::from_secs(opts.retry_initial_delay_secs),
            Duration::from_secs(opts.retry_cap_secs),
        ),
        long_backoff: BackoffCalculator::new(
            opts.retry_base,
            Duration::from_secs(opts.retry_initial_delay_secs),
            Duration::from_secs(opts.unreachable_retry_cap_secs),
        ),
    };

    let metrics = Metrics::new().context("registering prometheus metrics")?;

    let ctx = Arc::new(EngineContext {
        store: store.clone(),
        vault,
        ssh,
        scheduler,
        metrics: metrics.clone(),
        retries: RetryTracker::default(),
        workspace_base: opts.workspace_base.clone(),
        apply_timeout: opts.apply_timeout(),
        probe_timeout: opts.probe_timeout(),
        facts_timeout: opts.facts_timeout(),
        apply_tail_cap_bytes: opts.apply_tail_cap_bytes,
    });

    let health_state = HealthState::new();
    let health_addr = SocketAddr::from(([0, 0, 0, 0], opts.health_port));
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], opts.metrics_port));
    tokio::spawn(health::serve_health(health_addr, health_state.clone()));
    tokio::spawn(health::serve_metrics(metrics_addr, Arc::new(metrics)));

    let elector = LeaderElector::new(
        client.clone(),
        &opts.lease_namespace,
        &opts.lease_name,
        opts.resolved_lease_identity(),
        opts.lease_duration(),
    );
    let (leader_tx, leader_rx) = tokio::sync::watch::channel(false);
    let tick_every = opts.lease_duration() / 3;
    tokio::spawn(async move {
        loop {
            match elector.tick().await {
                Ok(is_leader) => {
                    let _ = leader_tx.send_if_modified(|cur| {
                        if *cur != is_leader {
                            *cur = is_leader;
                            true
                        } else {
                            false
                        }
                    });
                }
                Err(e) => warn!(error = %e, "leader election tick failed, retrying"),
            }
            tokio::time::sleep(tick_every.max(Duration::from_secs(1))).await;
        }
    });

    tokio::spawn({
        let mut log_rx = leader_rx.clone();
        async move {
            let mut was_leader = false;
            while log_rx.changed().await.is_ok() {
                let is_leader = *log_rx.borrow();
                if is_leader != was_leader {
                    was_leader = is_leader;
                    if is_leader {
                        info!("acquired leadership, reconciling");
                    } else {
                        warn!("lost leadership, watch caches stay warm but reconciling is paused");
                    }
                }
            }
        }
    });

    health_state.mark_ready();
    info!(identity = %opts.resolved_lease_identity(), "nixops-operator starting");

    // Built once and run for the process lifetime: every replica, leader or
    // not, keeps its reflector caches warm so a lease handoff needs no
    // restart. Only `gated_reconcile` consults `leader_rx` to decide whether
    // to do real work on a given tick.
    let nc_api: Api<NixosConfiguration> = Api::all(client.clone());
    let machine_api: Api<Machine> = Api::all(client.clone());
    let gated_ctx = Arc::new(GatedContext {
        engine: ctx,
        leader_rx,
        standby_requeue: tick_every.max(Duration::from_secs(1)),
    });
    let controller = Controller::new(nc_api, WatcherConfig::default());
    // `machineRef` is a plain name reference, not an ownerReference, so a
    // changed Machine is mapped back to its referencing NixosConfigurations
    // by scanning the controller's own reflector store rather than via
    // `.owns()`.
    let nc_store = controller.store();
    let controller_fut = controller
        .watches(machine_api, WatcherConfig::default(), move |machine: Machine| {
            let machine_name = machine.name_any();
            nc_store
                .state()
                .into_iter()
                .filter(move |nc| nc.spec.machine_ref == machine_name)
                .map(|nc| ObjectRef::from_obj(&*nc))
                .collect::<Vec<_>>()
        })
        .run(gated_reconcile, gated_error_policy, gated_ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _action)) => info!(object = %obj.name, "reconciled"),
                Err(e) => error!(error = ?e, "reconcile error"),
            }
        });

    tokio::select! {
        _ = controller_fut => {
            warn!("controller stream ended unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!(grace = ?opts.shutdown_grace(), "shutdown requested, draining");
            tokio::time::sleep(opts.shutdown_grace()).await;
        }
    }
    Ok(())
}
