//! Constraint coordinator - acquire, release, and the unblock algorithm.
//!
//! The coordinator keeps no queue of its own. Every decision re-reads the
//! group from the store and commits against the snapshot's revision, so any
//! number of coordinators (one per engine process) can share one store.
//!
//! Grant rule per group, evaluated in ascending `order`:
//! ```text
//! used = Σ permits(ACTIVE)
//! for b in BLOCKED:
//!     if used + b.permits <= capacity: promote b; used += b.permits
//!     else: stop            // strict FIFO, no skip-ahead
//! ```

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use super::registry::ConstraintRegistry;
use super::retry::{retry_on_conflict, Backoff};
use super::store::{GroupSnapshot, GroupWrite, InstanceStore};
use super::types::{
    AcquireOutcome, Constraint, GroupKey, HoldingScope, Instance, InstanceState,
};
use crate::notify::{Wakeup, WakeupPublisher};
use crate::types::{
    Config, ConstraintId, Error, InstanceId, ResourceUnit, Result, RetentionConfig,
};

/// Shared admission-control logic.
#[derive(Debug, Clone)]
pub struct Coordinator {
    registry: Arc<ConstraintRegistry>,
    store: Arc<dyn InstanceStore>,
    notifier: Arc<dyn WakeupPublisher>,
    backoff: Backoff,
    retention: RetentionConfig,
}

impl Coordinator {
    pub fn new(
        registry: Arc<ConstraintRegistry>,
        store: Arc<dyn InstanceStore>,
        notifier: Arc<dyn WakeupPublisher>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            store,
            notifier,
            backoff: Backoff::new(config.coordinator.retry.clone()),
            retention: config.retention.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<ConstraintRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    // =========================================================================
    // Acquire
    // =========================================================================

    /// Request `permits` units of a constraint's resource unit.
    ///
    /// Returns ACTIVE when granted immediately, BLOCKED when queued behind
    /// earlier requests or lacking capacity, REJECTED when the request can
    /// never fit. Every outcome is persisted.
    pub async fn acquire(
        &self,
        constraint_id: &ConstraintId,
        resource_unit: &ResourceUnit,
        permits: u32,
        holding_scope: HoldingScope,
    ) -> Result<AcquireOutcome> {
        if permits == 0 {
            return Err(Error::validation("permits must be at least 1"));
        }

        let key = GroupKey::new(constraint_id.clone(), resource_unit.clone());
        let instance_id = InstanceId::new();
        let (state, order) = retry_on_conflict(&self.backoff, "acquire", || {
            self.try_acquire(&key, &instance_id, permits, &holding_scope)
        })
        .await?;

        match state {
            InstanceState::Rejected => tracing::warn!(
                "instance_rejected: instance_id={}, group={}, permits={}, scope={}",
                instance_id,
                key,
                permits,
                holding_scope
            ),
            _ => tracing::info!(
                "instance_acquired: instance_id={}, group={}, state={}, order={}, permits={}, scope={}",
                instance_id,
                key,
                state,
                order,
                permits,
                holding_scope
            ),
        }

        Ok(AcquireOutcome { state, instance_id })
    }

    async fn try_acquire(
        &self,
        key: &GroupKey,
        instance_id: &InstanceId,
        permits: u32,
        holding_scope: &HoldingScope,
    ) -> Result<(InstanceState, u64)> {
        let constraint = self.registry.require(&key.constraint_id).await?;
        let snapshot = self.store.load_group(key).await?;
        let now = Utc::now();

        let state = if permits > constraint.capacity {
            InstanceState::Rejected
        } else if !snapshot.has_blocked()
            && snapshot.active_permits().saturating_add(permits) <= constraint.capacity
        {
            InstanceState::Active
        } else {
            InstanceState::Blocked
        };

        let instance = Instance {
            id: instance_id.clone(),
            constraint_id: key.constraint_id.clone(),
            resource_unit: key.resource_unit.clone(),
            order: snapshot.next_order,
            permits,
            state,
            holding_scope: holding_scope.clone(),
            acquire_at: (state == InstanceState::Active).then_some(now),
            created_at: now,
            last_updated_at: now,
            version: 0,
            next_sweep_iteration: now,
            valid_until: self.valid_until(now),
        };

        self.store
            .commit_group(key, snapshot.revision, GroupWrite::insert(instance))
            .await?;
        Ok((state, snapshot.next_order))
    }

    fn valid_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        Duration::from_std(self.retention.instance_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    // =========================================================================
    // Release / Unblock
    // =========================================================================

    /// Finish an instance and promote whatever now fits. Idempotent.
    ///
    /// Returns true if this call moved the instance to FINISHED. Unknown ids
    /// are a no-op.
    pub async fn release(&self, instance_id: &InstanceId) -> Result<bool> {
        let Some(instance) = self.store.get(instance_id).await? else {
            tracing::debug!("release_unknown_instance: instance_id={}", instance_id);
            return Ok(false);
        };
        let key = instance.group_key();

        let (finished, promoted) = retry_on_conflict(&self.backoff, "release", || {
            self.try_release(&key, instance_id)
        })
        .await?;

        if finished {
            tracing::info!(
                "instance_released: instance_id={}, group={}, order={}, permits={}, scope={}",
                instance.id,
                key,
                instance.order,
                instance.permits,
                instance.holding_scope
            );
        }
        self.notify_promoted(&key, &promoted).await;
        Ok(finished)
    }

    /// Finish (if still live) and promote in one commit.
    async fn try_release(
        &self,
        key: &GroupKey,
        instance_id: &InstanceId,
    ) -> Result<(bool, Vec<Instance>)> {
        let constraint = self.registry.get(&key.constraint_id).await;
        let snapshot = self.store.load_group(key).await?;
        let now = Utc::now();

        let finishing = snapshot.instances.iter().find(|i| &i.id == instance_id);
        let mut write = GroupWrite::default();
        if let Some(current) = finishing {
            write
                .updates
                .push(current.transitioned(InstanceState::Finished, now));
        }
        // A removed constraint still lets holders finish; nothing is granted
        let promoted = match &constraint {
            Some(constraint) => plan_promotions(&snapshot, constraint, Some(instance_id), now),
            None => Vec::new(),
        };
        write.updates.extend(promoted.iter().cloned());

        if !write.is_empty() {
            self.store
                .commit_group(key, snapshot.revision, write)
                .await?;
        }
        Ok((finishing.is_some(), promoted))
    }

    /// Promote queued instances of a group that now fit, in order.
    ///
    /// Returns the ids moved out of BLOCKED (ACTIVE, or REJECTED when a
    /// capacity decrease left them impossible to satisfy).
    pub async fn unblock(&self, key: &GroupKey) -> Result<Vec<InstanceId>> {
        let promoted = retry_on_conflict(&self.backoff, "unblock", || self.try_unblock(key)).await?;
        self.notify_promoted(key, &promoted).await;
        Ok(promoted.into_iter().map(|i| i.id).collect())
    }

    async fn try_unblock(&self, key: &GroupKey) -> Result<Vec<Instance>> {
        let Some(constraint) = self.registry.get(&key.constraint_id).await else {
            tracing::debug!("unblock_constraint_missing: group={}", key);
            return Ok(Vec::new());
        };
        let snapshot = self.store.load_group(key).await?;
        let promoted = plan_promotions(&snapshot, &constraint, None, Utc::now());
        if promoted.is_empty() {
            return Ok(promoted);
        }
        self.store
            .commit_group(
                key,
                snapshot.revision,
                GroupWrite {
                    inserts: Vec::new(),
                    updates: promoted.clone(),
                },
            )
            .await?;
        Ok(promoted)
    }

    async fn notify_promoted(&self, key: &GroupKey, promoted: &[Instance]) {
        for instance in promoted {
            tracing::info!(
                "instance_promoted: instance_id={}, group={}, state={}, order={}, permits={}",
                instance.id,
                key,
                instance.state,
                instance.order,
                instance.permits
            );
            self.publish_wakeup(instance).await;
        }
    }

    /// Publish a wake-up for an instance. Failures are logged; the sweep
    /// re-publishes for ACTIVE instances.
    pub(crate) async fn publish_wakeup(&self, instance: &Instance) {
        let wakeup = Wakeup::new(
            instance.id.clone(),
            instance.constraint_id.clone(),
            instance.resource_unit.clone(),
        );
        if let Err(e) = self.notifier.publish(wakeup).await {
            tracing::warn!(
                "wakeup_publish_failed: instance_id={}, error={}",
                instance.id,
                e
            );
        }
    }

    /// Release every live instance owned by a holding scope.
    pub async fn release_holding_scope(&self, scope: &HoldingScope) -> Result<Vec<InstanceId>> {
        let owned = self.store.find_by_holding_scope(scope).await?;
        let mut released = Vec::new();
        for instance in owned.into_iter().filter(|i| !i.state.is_terminal()) {
            if self.release(&instance.id).await? {
                released.push(instance.id);
            }
        }
        tracing::info!(
            "holding_scope_released: scope={}, released={}",
            scope,
            released.len()
        );
        Ok(released)
    }

    /// Re-run unblock on every group of a constraint after a capacity edit.
    pub async fn capacity_changed(&self, constraint_id: &ConstraintId) -> Result<Vec<InstanceId>> {
        let mut promoted = Vec::new();
        for key in self.store.groups_of_constraint(constraint_id).await? {
            promoted.extend(self.unblock(&key).await?);
        }
        Ok(promoted)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get(&self, instance_id: &InstanceId) -> Result<Option<Instance>> {
        self.store.get(instance_id).await
    }

    /// Sum of ACTIVE permits in a group.
    pub async fn current_usage(
        &self,
        constraint_id: &ConstraintId,
        resource_unit: &ResourceUnit,
    ) -> Result<u32> {
        let key = GroupKey::new(constraint_id.clone(), resource_unit.clone());
        Ok(self.store.load_group(&key).await?.active_permits())
    }

    /// ACTIVE permits a holding scope holds in a resource unit, across
    /// constraints.
    pub async fn scope_held_permits(
        &self,
        scope: &HoldingScope,
        resource_unit: &ResourceUnit,
    ) -> Result<u32> {
        Ok(self
            .store
            .find_by_holding_scope(scope)
            .await?
            .iter()
            .filter(|i| i.is_active() && &i.resource_unit == resource_unit)
            .map(|i| i.permits)
            .sum())
    }

    /// Full group snapshot, for diagnostics.
    pub async fn group(&self, key: &GroupKey) -> Result<GroupSnapshot> {
        self.store.load_group(key).await
    }
}

/// Compute the promotions a snapshot allows, as updated records.
///
/// `finishing` is treated as already released. A BLOCKED head larger than the
/// whole capacity (capacity was lowered after it queued) is rejected rather
/// than left blocking the group forever.
fn plan_promotions(
    snapshot: &GroupSnapshot,
    constraint: &Constraint,
    finishing: Option<&InstanceId>,
    now: DateTime<Utc>,
) -> Vec<Instance> {
    let live = || {
        snapshot
            .instances
            .iter()
            .filter(move |i| Some(&i.id) != finishing)
    };

    let mut used: u32 = live().filter(|i| i.is_active()).map(|i| i.permits).sum();
    let mut changed = Vec::new();
    for blocked in live().filter(|i| i.is_blocked()) {
        if blocked.permits > constraint.capacity {
            changed.push(blocked.transitioned(InstanceState::Rejected, now));
            continue;
        }
        match used.checked_add(blocked.permits) {
            Some(total) if total <= constraint.capacity => {
                used = total;
                changed.push(blocked.transitioned(InstanceState::Active, now));
            }
            _ => break,
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::WakeupBus;
    use crate::restraint::store::InMemoryInstanceStore;

    fn cid(s: &str) -> ConstraintId {
        ConstraintId::try_from(s).unwrap()
    }

    fn unit(s: &str) -> ResourceUnit {
        ResourceUnit::try_from(s).unwrap()
    }

    fn scope(s: &str) -> HoldingScope {
        HoldingScope::PipelineStage(s.to_string())
    }

    async fn setup(capacity: u32) -> (Coordinator, Arc<WakeupBus>) {
        let registry = Arc::new(ConstraintRegistry::new());
        registry.register(cid("env-A"), "Env A", capacity).await.unwrap();
        let bus = Arc::new(WakeupBus::new());
        let coordinator = Coordinator::new(
            registry,
            Arc::new(InMemoryInstanceStore::new()),
            bus.clone(),
            &Config::default(),
        );
        (coordinator, bus)
    }

    async fn acquire(c: &Coordinator, permits: u32, owner: &str) -> AcquireOutcome {
        c.acquire(&cid("env-A"), &unit("envA"), permits, scope(owner))
            .await
            .unwrap()
    }

    async fn state_of(c: &Coordinator, id: &InstanceId) -> InstanceState {
        c.get(id).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn test_fifo_grant_and_promotion() {
        let (c, bus) = setup(2).await;
        let (_sub, mut rx) = bus.subscribe("engine").await;

        let o1 = acquire(&c, 1, "s1").await;
        let o2 = acquire(&c, 1, "s2").await;
        let o3 = acquire(&c, 1, "s3").await;
        assert_eq!(o1.state, InstanceState::Active);
        assert_eq!(o2.state, InstanceState::Active);
        assert_eq!(o3.state, InstanceState::Blocked);

        assert!(c.release(&o1.instance_id).await.unwrap());
        assert_eq!(state_of(&c, &o1.instance_id).await, InstanceState::Finished);
        assert_eq!(state_of(&c, &o3.instance_id).await, InstanceState::Active);

        let wakeup = rx.recv().await.unwrap();
        assert_eq!(wakeup.instance_id, o3.instance_id);
    }

    #[tokio::test]
    async fn test_oversized_request_rejected() {
        let (c, _bus) = setup(2).await;
        let o = acquire(&c, 5, "s1").await;
        assert_eq!(o.state, InstanceState::Rejected);

        let group = c
            .group(&GroupKey::new(cid("env-A"), unit("envA")))
            .await
            .unwrap();
        assert!(group.instances.is_empty());
        assert_eq!(c.current_usage(&cid("env-A"), &unit("envA")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_permits_and_unknown_constraint() {
        let (c, _bus) = setup(2).await;
        let err = c
            .acquire(&cid("env-A"), &unit("envA"), 0, scope("s"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = c
            .acquire(&cid("missing"), &unit("envA"), 1, scope("s"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_head_of_line_blocks_smaller_later_request() {
        let (c, _bus) = setup(3).await;
        let big_holder = acquire(&c, 2, "s1").await;
        let head = acquire(&c, 2, "s2").await; // needs 2, only 1 free
        let small = acquire(&c, 1, "s3").await; // would fit, but queued behind head
        assert_eq!(big_holder.state, InstanceState::Active);
        assert_eq!(head.state, InstanceState::Blocked);
        assert_eq!(small.state, InstanceState::Blocked);

        // Unblock pass must not skip ahead
        assert!(c
            .unblock(&GroupKey::new(cid("env-A"), unit("envA")))
            .await
            .unwrap()
            .is_empty());

        c.release(&big_holder.instance_id).await.unwrap();
        assert_eq!(state_of(&c, &head.instance_id).await, InstanceState::Active);
        assert_eq!(state_of(&c, &small.instance_id).await, InstanceState::Active);
        assert_eq!(c.current_usage(&cid("env-A"), &unit("envA")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (c, _bus) = setup(1).await;
        let o1 = acquire(&c, 1, "s1").await;
        let o2 = acquire(&c, 1, "s2").await;

        assert!(c.release(&o1.instance_id).await.unwrap());
        assert!(!c.release(&o1.instance_id).await.unwrap());
        assert_eq!(state_of(&c, &o2.instance_id).await, InstanceState::Active);
        assert_eq!(c.current_usage(&cid("env-A"), &unit("envA")).await.unwrap(), 1);

        assert!(!c.release(&InstanceId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_of_blocked_waiter() {
        let (c, _bus) = setup(1).await;
        let o1 = acquire(&c, 1, "s1").await;
        let o2 = acquire(&c, 1, "s2").await;
        let o3 = acquire(&c, 1, "s3").await;

        // Waiter aborts; queue behind it is untouched until capacity frees
        assert!(c.release(&o2.instance_id).await.unwrap());
        assert_eq!(state_of(&c, &o2.instance_id).await, InstanceState::Finished);
        assert_eq!(state_of(&c, &o3.instance_id).await, InstanceState::Blocked);

        c.release(&o1.instance_id).await.unwrap();
        assert_eq!(state_of(&c, &o3.instance_id).await, InstanceState::Active);
    }

    #[tokio::test]
    async fn test_resource_units_are_independent() {
        let (c, _bus) = setup(1).await;
        let a = c
            .acquire(&cid("env-A"), &unit("east"), 1, scope("s1"))
            .await
            .unwrap();
        let b = c
            .acquire(&cid("env-A"), &unit("west"), 1, scope("s2"))
            .await
            .unwrap();
        assert_eq!(a.state, InstanceState::Active);
        assert_eq!(b.state, InstanceState::Active);
    }

    #[tokio::test]
    async fn test_capacity_increase_promotes() {
        let (c, _bus) = setup(1).await;
        let _o1 = acquire(&c, 1, "s1").await;
        let o2 = acquire(&c, 1, "s2").await;
        assert_eq!(o2.state, InstanceState::Blocked);

        c.registry().update_capacity(&cid("env-A"), 2).await.unwrap();
        let promoted = c.capacity_changed(&cid("env-A")).await.unwrap();
        assert_eq!(promoted, vec![o2.instance_id.clone()]);
        assert_eq!(state_of(&c, &o2.instance_id).await, InstanceState::Active);
    }

    #[tokio::test]
    async fn test_capacity_decrease_rejects_impossible_waiter() {
        let (c, _bus) = setup(3).await;
        let o1 = acquire(&c, 1, "s1").await;
        let o2 = acquire(&c, 3, "s2").await;
        let o3 = acquire(&c, 1, "s3").await;
        assert_eq!(o2.state, InstanceState::Blocked);

        c.registry().update_capacity(&cid("env-A"), 2).await.unwrap();
        let changed = c.capacity_changed(&cid("env-A")).await.unwrap();
        assert_eq!(changed, vec![o2.instance_id.clone(), o3.instance_id.clone()]);
        assert_eq!(state_of(&c, &o2.instance_id).await, InstanceState::Rejected);
        assert_eq!(state_of(&c, &o3.instance_id).await, InstanceState::Active);
        assert_eq!(state_of(&c, &o1.instance_id).await, InstanceState::Active);
    }

    #[tokio::test]
    async fn test_release_holding_scope() {
        let (c, _bus) = setup(3).await;
        let a = acquire(&c, 1, "stage-1").await;
        let b = acquire(&c, 1, "stage-1").await;
        let other = acquire(&c, 1, "stage-2").await;

        assert_eq!(
            c.scope_held_permits(&scope("stage-1"), &unit("envA"))
                .await
                .unwrap(),
            2
        );

        let released = c.release_holding_scope(&scope("stage-1")).await.unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(state_of(&c, &a.instance_id).await, InstanceState::Finished);
        assert_eq!(state_of(&c, &b.instance_id).await, InstanceState::Finished);
        assert_eq!(state_of(&c, &other.instance_id).await, InstanceState::Active);
    }

    #[tokio::test]
    async fn test_release_after_constraint_removed() {
        let (c, _bus) = setup(1).await;
        let holder = acquire(&c, 1, "s1").await;
        let waiter = acquire(&c, 1, "s2").await;

        c.registry().remove(&cid("env-A")).await.unwrap();

        assert!(c.release(&holder.instance_id).await.unwrap());
        assert_eq!(state_of(&c, &holder.instance_id).await, InstanceState::Finished);
        // Nothing is granted against a constraint that no longer exists
        assert_eq!(state_of(&c, &waiter.instance_id).await, InstanceState::Blocked);
        assert!(c
            .unblock(&GroupKey::new(cid("env-A"), unit("envA")))
            .await
            .unwrap()
            .is_empty());

        assert!(c.release(&waiter.instance_id).await.unwrap());
        assert_eq!(state_of(&c, &waiter.instance_id).await, InstanceState::Finished);
    }

    #[tokio::test]
    async fn test_orders_are_sequential() {
        let (c, _bus) = setup(1).await;
        let mut orders = Vec::new();
        for i in 0..4 {
            let o = acquire(&c, 1, &format!("s{i}")).await;
            orders.push(c.get(&o.instance_id).await.unwrap().unwrap().order);
        }
        assert_eq!(orders, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_plan_promotions_stops_at_first_misfit() {
        let now = Utc::now();
        let constraint = Constraint {
            id: cid("env-A"),
            name: "Env A".into(),
            capacity: 4,
        };
        let mk = |order: u64, permits: u32, state: InstanceState| Instance {
            id: InstanceId::new(),
            constraint_id: cid("env-A"),
            resource_unit: unit("envA"),
            order,
            permits,
            state,
            holding_scope: scope("s"),
            acquire_at: None,
            created_at: now,
            last_updated_at: now,
            version: 1,
            next_sweep_iteration: now,
            valid_until: now,
        };
        let snapshot = GroupSnapshot {
            key: GroupKey::new(cid("env-A"), unit("envA")),
            revision: 1,
            next_order: 5,
            instances: vec![
                mk(1, 1, InstanceState::Active),
                mk(2, 2, InstanceState::Blocked),
                mk(3, 2, InstanceState::Blocked),
                mk(4, 1, InstanceState::Blocked),
            ],
        };
        let promoted = plan_promotions(&snapshot, &constraint, None, now);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].order, 2);
        assert_eq!(promoted[0].state, InstanceState::Active);
        assert!(promoted[0].acquire_at.is_some());

        // Releasing the holder lets both order 2 and 3 in, order 4 waits
        let holder = snapshot.instances[0].id.clone();
        let promoted = plan_promotions(&snapshot, &constraint, Some(&holder), now);
        let orders: Vec<_> = promoted.iter().map(|i| i.order).collect();
        assert_eq!(orders, vec![2, 3]);
    }
}
