//! Restraint simulation - drives workflow nodes through the step adapter.
//!
//! Spawns `--nodes` simulated nodes spread over `--engines` coordinators that
//! share one in-memory store, with a running sweeper. Every `--leak-every`th
//! node terminates without releasing; the sweep reclaims its permits. Prints
//! a JSON summary when all nodes are done.

use clap::Parser;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use restraint_core::notify::WakeupBus;
use restraint_core::restraint::{
    AdmissionRequest, ConstraintRegistry, Coordinator, HoldingScope, InMemoryInstanceStore,
    StepAdapter, Sweeper, TerminatedScopes,
};
use restraint_core::types::{ConstraintId, InstanceId, ResourceUnit};
use restraint_core::{Config, Error};

#[derive(Debug, Parser)]
#[command(name = "restraint-sim", about = "Simulate FIFO admission under contention")]
struct Args {
    /// Optional JSON configuration file
    #[arg(long, env = "RESTRAINT_CONFIG")]
    config: Option<PathBuf>,

    /// Capacity of the simulated constraint
    #[arg(long, default_value_t = 3)]
    capacity: u32,

    /// Number of workflow nodes
    #[arg(long, default_value_t = 20)]
    nodes: usize,

    /// Coordinators (engine processes) sharing the store
    #[arg(long, default_value_t = 2)]
    engines: usize,

    /// Permits per node cycle through 1..=max_permits
    #[arg(long, default_value_t = 2)]
    max_permits: u32,

    /// Every Nth node leaks its permits (0 disables)
    #[arg(long, default_value_t = 7)]
    leak_every: usize,

    /// How long a granted node holds its permits
    #[arg(long, default_value_t = 20)]
    hold_ms: u64,

    /// Sweep interval
    #[arg(long, default_value_t = 100)]
    sweep_interval_ms: u64,

    /// Give up if nodes have not finished by then
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    nodes: usize,
    capacity: u32,
    granted: usize,
    rejected: usize,
    leaked: usize,
    failed: usize,
    peak_usage: u32,
    invariant_held: bool,
    records_left: usize,
}

#[derive(Debug, Default)]
struct Counters {
    granted: AtomicUsize,
    rejected: AtomicUsize,
    leaked: AtomicUsize,
    failed: AtomicUsize,
    peak_usage: AtomicU32,
}

/// Routes wake-ups from the bus to waiting nodes.
#[derive(Debug, Default)]
struct Wakeups {
    granted: Mutex<HashSet<InstanceId>>,
    notify: Notify,
}

impl Wakeups {
    async fn deliver(&self, id: InstanceId) {
        self.granted.lock().await.insert(id);
        self.notify.notify_waiters();
    }

    async fn wait_for(&self, id: &InstanceId) {
        loop {
            let notified = self.notify.notified();
            if self.granted.lock().await.contains(id) {
                return;
            }
            notified.await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides()?;
            config
        }
    };
    config.sweeper.interval = Duration::from_millis(args.sweep_interval_ms);
    config.validate()?;

    restraint_core::observability::init_tracing(&config.observability);

    let constraint_id = ConstraintId::try_from("sim")?;
    let unit = ResourceUnit::try_from("unit-0")?;

    let registry = Arc::new(ConstraintRegistry::from_definitions(&config.constraints).await?);
    registry
        .register(constraint_id.clone(), "Simulated resource", args.capacity)
        .await?;

    let store = Arc::new(InMemoryInstanceStore::new());
    let bus = Arc::new(WakeupBus::new());
    let liveness = Arc::new(TerminatedScopes::new());

    let adapters: Vec<StepAdapter> = (0..args.engines.max(1))
        .map(|_| {
            StepAdapter::new(Arc::new(Coordinator::new(
                registry.clone(),
                store.clone(),
                bus.clone(),
                &config,
            )))
        })
        .collect();

    let sweeper = Sweeper::new(adapters[0].coordinator().clone(), liveness.clone(), &config);
    let sweep_handle = sweeper.start();

    let wakeups = Arc::new(Wakeups::default());
    let (_subscription, mut rx) = bus.subscribe("restraint-sim").await;
    let router = {
        let wakeups = wakeups.clone();
        tokio::spawn(async move {
            while let Some(wakeup) = rx.recv().await {
                wakeups.deliver(wakeup.instance_id).await;
            }
        })
    };

    let counters = Arc::new(Counters::default());
    let cancel = CancellationToken::new();
    let sampler = {
        let coordinator = adapters[0].coordinator().clone();
        let counters = counters.clone();
        let cancel = cancel.clone();
        let constraint_id = constraint_id.clone();
        let unit = unit.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(2));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Ok(usage) = coordinator.current_usage(&constraint_id, &unit).await {
                            counters.peak_usage.fetch_max(usage, Ordering::SeqCst);
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    };

    let mut nodes = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let adapter = adapters[i % adapters.len()].clone();
        let wakeups = wakeups.clone();
        let liveness = liveness.clone();
        let counters = counters.clone();
        let request = AdmissionRequest {
            constraint_id: constraint_id.clone(),
            resource_unit: unit.clone(),
            permits: 1 + (i as u32 % args.max_permits.max(1)),
            holding_scope: HoldingScope::PipelineStage(format!("stage-{i}")),
        };
        let leaks = args.leak_every > 0 && (i + 1) % args.leak_every == 0;
        let hold = Duration::from_millis(args.hold_ms);

        nodes.push(tokio::spawn(async move {
            let result =
                run_node(&adapter, &wakeups, &liveness, &counters, request, leaks, hold).await;
            if let Err(e) = result {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::error!("sim_node_failed: node={}, error={}", i, e);
            }
        }));
    }

    let all_done = futures::future::join_all(nodes);
    if tokio::time::timeout(Duration::from_secs(args.timeout_secs), all_done)
        .await
        .is_err()
    {
        tracing::error!("sim_timed_out: timeout_secs={}", args.timeout_secs);
    }

    cancel.cancel();
    sweeper.stop();
    let _ = sampler.await;
    let _ = sweep_handle.await;
    router.abort();

    let peak_usage = counters.peak_usage.load(Ordering::SeqCst);
    let summary = Summary {
        nodes: args.nodes,
        capacity: args.capacity,
        granted: counters.granted.load(Ordering::SeqCst),
        rejected: counters.rejected.load(Ordering::SeqCst),
        leaked: counters.leaked.load(Ordering::SeqCst),
        failed: counters.failed.load(Ordering::SeqCst),
        peak_usage,
        invariant_held: peak_usage <= args.capacity,
        records_left: store.len().await,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_node(
    adapter: &StepAdapter,
    wakeups: &Wakeups,
    liveness: &TerminatedScopes,
    counters: &Counters,
    request: AdmissionRequest,
    leaks: bool,
    hold: Duration,
) -> restraint_core::Result<()> {
    let response = match adapter.begin_async(&request).await {
        Ok(response) => response,
        Err(Error::Validation(reason)) => {
            counters.rejected.fetch_add(1, Ordering::SeqCst);
            tracing::info!("sim_node_rejected: scope={}, reason={}", request.holding_scope, reason);
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let instance_id = response
        .callback_ids
        .first()
        .cloned()
        .ok_or_else(|| Error::internal("async response without callback id"))?;

    wakeups.wait_for(&instance_id).await;
    let result = adapter.on_resume(&instance_id).await?;
    counters.granted.fetch_add(1, Ordering::SeqCst);
    tracing::info!(
        "sim_node_granted: scope={}, permits={}, held_by_others={}",
        request.holding_scope,
        result.granted_permits,
        result.currently_held_permits
    );

    tokio::time::sleep(hold).await;

    if leaks {
        counters.leaked.fetch_add(1, Ordering::SeqCst);
        liveness.mark_terminated(request.holding_scope).await;
        return Ok(());
    }
    adapter
        .coordinator()
        .release_holding_scope(&request.holding_scope)
        .await?;
    Ok(())
}
