//! Admission instance store.
//!
//! The durable, ordered ledger of admission requests. Every group
//! (constraint, resource unit) is an append log indexed by `order`, guarded by
//! a group revision: all writes that change a group go through
//! [`InstanceStore::commit_group`], which applies atomically only when the
//! caller's snapshot revision is still current. Instance writes additionally
//! check the per-record `version`.
//!
//! [`InMemoryInstanceStore`] is a process-local implementation. Engine
//! processes sharing one store share one `Arc<dyn InstanceStore>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::types::{GroupKey, HoldingScope, Instance};
use crate::types::{ConstraintId, Error, InstanceId, Result, ShardConfig};

/// Consistent read of one group.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub key: GroupKey,
    pub revision: u64,
    /// Order the next inserted instance must take.
    pub next_order: u64,
    /// Non-terminal instances, ascending by `order`.
    pub instances: Vec<Instance>,
}

impl GroupSnapshot {
    /// Sum of ACTIVE permits.
    pub fn active_permits(&self) -> u32 {
        self.instances
            .iter()
            .filter(|i| i.is_active())
            .map(|i| i.permits)
            .sum()
    }

    pub fn has_blocked(&self) -> bool {
        self.instances.iter().any(Instance::is_blocked)
    }
}

/// Writes applied atomically by `commit_group`.
#[derive(Debug, Default, Clone)]
pub struct GroupWrite {
    /// New instances; orders must start at the snapshot's `next_order`.
    pub inserts: Vec<Instance>,
    /// Replacements carrying the version they were read at.
    pub updates: Vec<Instance>,
}

impl GroupWrite {
    pub fn insert(instance: Instance) -> Self {
        Self {
            inserts: vec![instance],
            updates: Vec::new(),
        }
    }

    pub fn update(instance: Instance) -> Self {
        Self {
            inserts: Vec::new(),
            updates: vec![instance],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }
}

/// Result of a retention purge.
#[derive(Debug, Clone, Default)]
pub struct PurgeReport {
    pub removed: usize,
    /// Groups that lost a non-terminal instance to TTL expiry.
    pub groups_changed: Vec<GroupKey>,
}

/// Shared durable store of admission instances.
#[async_trait]
pub trait InstanceStore: Send + Sync + fmt::Debug {
    /// Read a group's revision and non-terminal members.
    async fn load_group(&self, key: &GroupKey) -> Result<GroupSnapshot>;

    /// Apply `write` iff the group revision is still `expected_revision`.
    ///
    /// Fails with `Error::Conflict` on a stale revision, a stale instance
    /// version, or an order collision. Nothing is applied on failure.
    /// Returns the new revision.
    async fn commit_group(
        &self,
        key: &GroupKey,
        expected_revision: u64,
        write: GroupWrite,
    ) -> Result<u64>;

    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>>;

    /// All instances (any state) owned by a holding scope.
    async fn find_by_holding_scope(&self, scope: &HoldingScope) -> Result<Vec<Instance>>;

    /// Every group key that has records for a constraint.
    async fn groups_of_constraint(&self, constraint_id: &ConstraintId) -> Result<Vec<GroupKey>>;

    /// Claim up to `limit` non-terminal instances of `shard` whose
    /// `next_sweep_iteration <= now`, pushing it to `next_iteration`.
    ///
    /// Returned records carry their `next_sweep_iteration` from before the
    /// claim, which tells the sweeper when it last looked at them.
    async fn claim_for_sweep(
        &self,
        now: DateTime<Utc>,
        next_iteration: DateTime<Utc>,
        shard: ShardConfig,
        limit: usize,
    ) -> Result<Vec<Instance>>;

    /// Remove records past `valid_until`, and terminal records last updated
    /// before `terminal_cutoff`.
    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        terminal_cutoff: DateTime<Utc>,
    ) -> Result<PurgeReport>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Debug, Default)]
struct GroupHead {
    revision: u64,
    next_order: u64,
    /// Order index: unique per group.
    orders: BTreeMap<u64, InstanceId>,
}

#[derive(Debug, Default)]
struct StoreState {
    instances: HashMap<InstanceId, Instance>,
    groups: HashMap<GroupKey, GroupHead>,
    by_scope: HashMap<HoldingScope, BTreeSet<InstanceId>>,
}

impl StoreState {
    fn snapshot(&self, key: &GroupKey) -> GroupSnapshot {
        match self.groups.get(key) {
            Some(head) => GroupSnapshot {
                key: key.clone(),
                revision: head.revision,
                next_order: head.next_order.max(1),
                instances: head
                    .orders
                    .values()
                    .filter_map(|id| self.instances.get(id))
                    .filter(|i| !i.state.is_terminal())
                    .cloned()
                    .collect(),
            },
            None => GroupSnapshot {
                key: key.clone(),
                revision: 0,
                next_order: 1,
                instances: Vec::new(),
            },
        }
    }

    fn check_write(&self, key: &GroupKey, expected_revision: u64, write: &GroupWrite) -> Result<()> {
        let (revision, mut next_order) = self
            .groups
            .get(key)
            .map(|h| (h.revision, h.next_order.max(1)))
            .unwrap_or((0, 1));
        if revision != expected_revision {
            return Err(Error::conflict(format!(
                "group {key} revision {revision}, expected {expected_revision}"
            )));
        }

        for instance in &write.inserts {
            if instance.group_key() != *key {
                return Err(Error::internal(format!(
                    "instance {} does not belong to group {key}",
                    instance.id
                )));
            }
            if instance.order != next_order || self.instances.contains_key(&instance.id) {
                return Err(Error::conflict(format!(
                    "order {} already taken in group {key}",
                    instance.order
                )));
            }
            next_order += 1;
        }

        for instance in &write.updates {
            let stored = self
                .instances
                .get(&instance.id)
                .ok_or_else(|| Error::not_found(format!("unknown instance: {}", instance.id)))?;
            if stored.group_key() != *key || stored.order != instance.order {
                return Err(Error::internal(format!(
                    "update of {} changes its group position",
                    instance.id
                )));
            }
            if stored.version != instance.version {
                return Err(Error::conflict(format!(
                    "instance {} version {}, expected {}",
                    instance.id, stored.version, instance.version
                )));
            }
            if stored.state != instance.state && !stored.state.can_transition_to(instance.state) {
                return Err(Error::state_transition(format!(
                    "instance {}: {} -> {}",
                    instance.id, stored.state, instance.state
                )));
            }
        }
        Ok(())
    }

    fn remove(&mut self, id: &InstanceId) -> Option<Instance> {
        let instance = self.instances.remove(id)?;
        if let Some(head) = self.groups.get_mut(&instance.group_key()) {
            head.orders.remove(&instance.order);
        }
        if let Some(ids) = self.by_scope.get_mut(&instance.holding_scope) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_scope.remove(&instance.holding_scope);
            }
        }
        Some(instance)
    }
}

/// Process-local [`InstanceStore`].
#[derive(Debug)]
pub struct InMemoryInstanceStore {
    state: RwLock<StoreState>,
    available: AtomicBool,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Fault injection: while unavailable every call fails with
    /// `Error::StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of records held, any state.
    pub async fn len(&self) -> usize {
        self.state.read().await.instances.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::store_unavailable("in-memory store marked unavailable"))
        }
    }

    /// Rewrite a stored record without version checks (test aging).
    #[cfg(test)]
    pub(crate) async fn with_record_mut(&self, id: &InstanceId, f: impl FnOnce(&mut Instance)) {
        if let Some(instance) = self.state.write().await.instances.get_mut(id) {
            f(instance);
        }
    }
}

impl Default for InMemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn load_group(&self, key: &GroupKey) -> Result<GroupSnapshot> {
        self.ensure_available()?;
        Ok(self.state.read().await.snapshot(key))
    }

    async fn commit_group(
        &self,
        key: &GroupKey,
        expected_revision: u64,
        write: GroupWrite,
    ) -> Result<u64> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        state.check_write(key, expected_revision, &write)?;

        for mut instance in write.inserts {
            instance.version = 1;
            let id = instance.id.clone();
            state
                .by_scope
                .entry(instance.holding_scope.clone())
                .or_default()
                .insert(id.clone());
            let head = state.groups.entry(key.clone()).or_default();
            head.orders.insert(instance.order, id.clone());
            head.next_order = instance.order + 1;
            state.instances.insert(id, instance);
        }

        for mut instance in write.updates {
            if let Some(stored) = state.instances.get_mut(&instance.id) {
                instance.version = stored.version + 1;
                // Sweep scheduling is store-owned.
                instance.next_sweep_iteration = stored.next_sweep_iteration;
                *stored = instance;
            }
        }

        let head = state.groups.entry(key.clone()).or_default();
        head.revision += 1;
        Ok(head.revision)
    }

    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>> {
        self.ensure_available()?;
        Ok(self.state.read().await.instances.get(id).cloned())
    }

    async fn find_by_holding_scope(&self, scope: &HoldingScope) -> Result<Vec<Instance>> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let mut found: Vec<Instance> = state
            .by_scope
            .get(scope)
            .into_iter()
            .flatten()
            .filter_map(|id| state.instances.get(id))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.group_key().cmp(&b.group_key()).then(a.order.cmp(&b.order)));
        Ok(found)
    }

    async fn groups_of_constraint(&self, constraint_id: &ConstraintId) -> Result<Vec<GroupKey>> {
        self.ensure_available()?;
        let state = self.state.read().await;
        let mut keys: Vec<GroupKey> = state
            .groups
            .keys()
            .filter(|k| &k.constraint_id == constraint_id)
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn claim_for_sweep(
        &self,
        now: DateTime<Utc>,
        next_iteration: DateTime<Utc>,
        shard: ShardConfig,
        limit: usize,
    ) -> Result<Vec<Instance>> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let mut due: Vec<(DateTime<Utc>, InstanceId)> = state
            .instances
            .values()
            .filter(|i| !i.state.is_terminal() && i.next_sweep_iteration <= now)
            .filter(|i| i.group_key().shard(shard.count) == shard.index)
            .map(|i| (i.next_sweep_iteration, i.id.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(instance) = state.instances.get_mut(&id) {
                claimed.push(instance.clone());
                instance.next_sweep_iteration = next_iteration;
            }
        }
        Ok(claimed)
    }

    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        terminal_cutoff: DateTime<Utc>,
    ) -> Result<PurgeReport> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let expired: Vec<InstanceId> = state
            .instances
            .values()
            .filter(|i| {
                i.valid_until <= now || (i.state.is_terminal() && i.last_updated_at <= terminal_cutoff)
            })
            .map(|i| i.id.clone())
            .collect();

        let mut report = PurgeReport::default();
        let mut changed = BTreeSet::new();
        let mut touched = BTreeSet::new();
        for id in expired {
            if let Some(instance) = state.remove(&id) {
                report.removed += 1;
                touched.insert(instance.group_key());
                if !instance.state.is_terminal() {
                    tracing::warn!(
                        "instance_ttl_expired: instance_id={}, state={}, group={}",
                        instance.id,
                        instance.state,
                        instance.group_key()
                    );
                    changed.insert(instance.group_key());
                }
            }
        }
        for key in &changed {
            if let Some(head) = state.groups.get_mut(key) {
                head.revision += 1;
            }
        }
        // A group with no records left starts over from an empty head
        for key in &touched {
            if state.groups.get(key).is_some_and(|h| h.orders.is_empty()) {
                state.groups.remove(key);
            }
        }
        report.groups_changed = changed.into_iter().collect();
        Ok(report)
    }
}
