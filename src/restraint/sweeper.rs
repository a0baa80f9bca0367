//! Background reconciliation sweep.
//!
//! The sweeper guarantees liveness independently of wake-up delivery. Each
//! pass claims due, non-terminal instances of this process's shard and:
//! - BLOCKED: re-runs the group's unblock (once per group per pass)
//! - ACTIVE: asks the engine whether the holding scope is alive; a dead
//!   holder is force-released (leaked permit). A live holder granted since
//!   the previous look gets its wake-up re-published once
//!
//! A swept instance is due again half an interval later, so the next tick
//! finds it even when ticks run late.
//!
//! It then purges terminal records past retention and records past their TTL.
//! A failure or panic on one instance is logged and skipped.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::coordinator::Coordinator;
use super::liveness::HoldingScopeLiveness;
use super::recovery::with_recovery_async;
use super::types::{GroupKey, Instance, InstanceState};
use crate::types::{Config, Error, Result, RetentionConfig, SweeperConfig};

/// Statistics from a sweep pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepStats {
    /// Instances claimed for this pass
    pub claimed: usize,
    /// Groups whose unblock check ran for a BLOCKED instance
    pub groups_checked: usize,
    /// Instances moved out of BLOCKED by those checks
    pub promoted: usize,
    /// ACTIVE instances with a terminated holder, force-released
    pub leaks_reclaimed: usize,
    /// Wake-ups re-published for live ACTIVE instances
    pub wakeups_republished: usize,
    /// Instances whose handling failed and was skipped
    pub failures: usize,
    /// Records removed by retention/TTL
    pub purged: usize,
    /// Pass hit `max_pass_duration`
    pub timed_out: bool,
    pub duration_ms: u64,
    /// When the pass completed
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepAction {
    Nothing,
    GroupChecked(usize),
    LeakReclaimed,
    WakeupRepublished,
}

/// Periodic reconciliation pass over the instance store.
#[derive(Clone)]
pub struct Sweeper {
    coordinator: Arc<Coordinator>,
    liveness: Arc<dyn HoldingScopeLiveness>,
    config: SweeperConfig,
    retention: RetentionConfig,
    cancel: CancellationToken,
}

impl fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sweeper")
            .field("config", &self.config)
            .field("retention", &self.retention)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Sweeper {
    pub fn new(
        coordinator: Arc<Coordinator>,
        liveness: Arc<dyn HoldingScopeLiveness>,
        config: &Config,
    ) -> Self {
        Self {
            coordinator,
            liveness,
            config: config.sweeper.clone(),
            retention: config.retention.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start the sweep loop in the background.
    /// Returns immediately; passes run in a spawned task.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let sweeper = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(sweeper.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                "sweeper_started: interval_ms={}, shard={}/{}",
                sweeper.config.interval.as_millis(),
                sweeper.config.shard.index,
                sweeper.config.shard.count
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sweeper.run_pass().await {
                            tracing::error!("sweep_pass_failed: {}", e);
                        }
                    }
                    _ = sweeper.cancel.cancelled() => {
                        tracing::info!("sweeper_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the sweep loop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run one bounded pass.
    pub async fn run_pass(&self) -> Result<SweepStats> {
        let started = Instant::now();
        let mut stats = SweepStats::default();

        let outcome = tokio::time::timeout(self.config.max_pass_duration, self.sweep(&mut stats)).await;
        match outcome {
            Ok(result) => result?,
            Err(_) => {
                stats.timed_out = true;
                tracing::warn!(
                    "sweep_pass_timed_out: limit_ms={}, claimed={}",
                    self.config.max_pass_duration.as_millis(),
                    stats.claimed
                );
            }
        }

        stats.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        stats.completed_at = Some(Utc::now());
        tracing::debug!(
            "sweep_pass_completed: claimed={}, groups={}, promoted={}, leaks={}, republished={}, failures={}, purged={}, duration_ms={}",
            stats.claimed,
            stats.groups_checked,
            stats.promoted,
            stats.leaks_reclaimed,
            stats.wakeups_republished,
            stats.failures,
            stats.purged,
            stats.duration_ms,
        );
        Ok(stats)
    }

    async fn sweep(&self, stats: &mut SweepStats) -> Result<()> {
        let store = self.coordinator.store();
        let now = Utc::now();
        let next_iteration = offset(now, self.claim_lead(), true);

        let claimed = store
            .claim_for_sweep(now, next_iteration, self.config.shard, self.config.batch_size)
            .await?;
        stats.claimed = claimed.len();

        let mut checked: HashSet<GroupKey> = HashSet::new();
        for instance in &claimed {
            let action = with_recovery_async(
                || self.sweep_instance(instance, &mut checked),
                "sweep_instance",
            )
            .await;
            match action {
                Ok(SweepAction::Nothing) => {}
                Ok(SweepAction::GroupChecked(promoted)) => {
                    stats.groups_checked += 1;
                    stats.promoted += promoted;
                }
                Ok(SweepAction::LeakReclaimed) => stats.leaks_reclaimed += 1,
                Ok(SweepAction::WakeupRepublished) => stats.wakeups_republished += 1,
                Err(e) => {
                    stats.failures += 1;
                    tracing::error!(
                        "sweep_instance_failed: instance_id={}, group={}, state={}, error={}",
                        instance.id,
                        instance.group_key(),
                        instance.state,
                        e
                    );
                }
            }
        }

        let terminal_cutoff = offset(now, self.retention.terminal_retention, false);
        let report = store.purge_expired(now, terminal_cutoff).await?;
        stats.purged = report.removed;
        for key in report.groups_changed {
            match self.coordinator.unblock(&key).await {
                Ok(promoted) => stats.promoted += promoted.len(),
                Err(e) => {
                    stats.failures += 1;
                    tracing::error!("sweep_unblock_failed: group={}, error={}", key, e);
                }
            }
        }
        Ok(())
    }

    async fn sweep_instance(
        &self,
        instance: &Instance,
        checked: &mut HashSet<GroupKey>,
    ) -> Result<SweepAction> {
        let key = instance.group_key();
        match instance.state {
            InstanceState::Blocked => {
                if !checked.insert(key.clone()) {
                    return Ok(SweepAction::Nothing);
                }
                tracing::debug!("sweep_blocked_group: group={}", key);
                let promoted = self.coordinator.unblock(&key).await?;
                Ok(SweepAction::GroupChecked(promoted.len()))
            }
            InstanceState::Active => {
                if self.scope_is_active(instance).await? {
                    if self.config.republish_active_wakeups
                        && self.granted_since_last_look(instance)
                    {
                        self.coordinator.publish_wakeup(instance).await;
                        return Ok(SweepAction::WakeupRepublished);
                    }
                    return Ok(SweepAction::Nothing);
                }

                tracing::warn!(
                    "leak_detected: instance_id={}, group={}, order={}, permits={}, scope={}",
                    instance.id,
                    key,
                    instance.order,
                    instance.permits,
                    instance.holding_scope
                );
                self.coordinator.release(&instance.id).await?;
                // release already promoted what fits
                checked.insert(key);
                Ok(SweepAction::LeakReclaimed)
            }
            InstanceState::Finished | InstanceState::Rejected => Ok(SweepAction::Nothing),
        }
    }

    fn claim_lead(&self) -> std::time::Duration {
        self.config.interval / 2
    }

    async fn scope_is_active(&self, instance: &Instance) -> Result<bool> {
        let query = self.liveness.is_active(&instance.holding_scope);
        match tokio::time::timeout(self.config.liveness_timeout, query).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "liveness query for {} exceeded {}ms",
                instance.holding_scope,
                self.config.liveness_timeout.as_millis()
            ))),
        }
    }

    /// Claimed records carry the `next_sweep_iteration` set by the previous
    /// claim (or their creation time), which dates the last look.
    fn granted_since_last_look(&self, instance: &Instance) -> bool {
        let last_look = offset(instance.next_sweep_iteration, self.claim_lead(), false);
        instance.acquire_at.is_some_and(|at| at >= last_look)
    }
}

fn offset(now: DateTime<Utc>, by: std::time::Duration, forward: bool) -> DateTime<Utc> {
    let shifted = Duration::from_std(by).ok().and_then(|d| {
        if forward {
            now.checked_add_signed(d)
        } else {
            now.checked_sub_signed(d)
        }
    });
    match shifted {
        Some(t) => t,
        None if forward => DateTime::<Utc>::MAX_UTC,
        None => DateTime::<Utc>::MIN_UTC,
    }
}
