//! Restraint types: InstanceState, HoldingScope, Instance, admission results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{ConstraintId, InstanceId, ResourceUnit};

/// Admission instance state.
///
/// State transitions:
/// ```text
/// BLOCKED → ACTIVE → FINISHED
///    ↓
/// FINISHED (waiter aborted)
///
/// REJECTED (created terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Blocked,
    Active,
    Finished,
    Rejected,
}

impl InstanceState {
    /// Check if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Finished | InstanceState::Rejected)
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: InstanceState) -> bool {
        matches!(
            (self, to),
            (InstanceState::Blocked, InstanceState::Active)
                | (InstanceState::Blocked, InstanceState::Finished)
                | (InstanceState::Blocked, InstanceState::Rejected)
                | (InstanceState::Active, InstanceState::Finished)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Blocked => "BLOCKED",
            InstanceState::Active => "ACTIVE",
            InstanceState::Finished => "FINISHED",
            InstanceState::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// Execution context responsible for eventually releasing a permit.
///
/// Persisted as `(holding_scope_type, holding_scope_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "holding_scope_type", content = "holding_scope_id")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldingScope {
    PipelineStage(String),
    Workflow(String),
    Custom(String),
}

impl HoldingScope {
    pub fn scope_type(&self) -> &'static str {
        match self {
            HoldingScope::PipelineStage(_) => "PIPELINE_STAGE",
            HoldingScope::Workflow(_) => "WORKFLOW",
            HoldingScope::Custom(_) => "CUSTOM",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            HoldingScope::PipelineStage(id) | HoldingScope::Workflow(id) | HoldingScope::Custom(id) => id,
        }
    }
}

impl fmt::Display for HoldingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope_type(), self.id())
    }
}

/// A named capacity limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: ConstraintId,
    pub name: String,
    pub capacity: u32,
}

/// One capacity pool: a constraint partitioned by resource unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub constraint_id: ConstraintId,
    pub resource_unit: ResourceUnit,
}

impl GroupKey {
    pub fn new(constraint_id: ConstraintId, resource_unit: ResourceUnit) -> Self {
        Self {
            constraint_id,
            resource_unit,
        }
    }

    /// Stable shard assignment (FNV-1a over the key).
    pub fn shard(&self, count: u32) -> u32 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        let bytes = self
            .constraint_id
            .as_str()
            .bytes()
            .chain(std::iter::once(0u8))
            .chain(self.resource_unit.as_str().bytes());
        for b in bytes {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % u64::from(count.max(1))) as u32
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.constraint_id, self.resource_unit)
    }
}

/// Admission request record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub constraint_id: ConstraintId,
    pub resource_unit: ResourceUnit,
    /// FIFO position within the group, assigned once.
    pub order: u64,
    pub permits: u32,
    pub state: InstanceState,
    #[serde(flatten)]
    pub holding_scope: HoldingScope,
    pub acquire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Optimistic-concurrency token, bumped by the store on every write.
    pub version: u64,
    pub next_sweep_iteration: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl Instance {
    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(self.constraint_id.clone(), self.resource_unit.clone())
    }

    pub fn is_active(&self) -> bool {
        self.state == InstanceState::Active
    }

    pub fn is_blocked(&self) -> bool {
        self.state == InstanceState::Blocked
    }

    /// Copy of this instance moved to `state`, stamped at `now`.
    pub(crate) fn transitioned(&self, state: InstanceState, now: DateTime<Utc>) -> Instance {
        let mut next = self.clone();
        next.state = state;
        next.last_updated_at = now;
        if state == InstanceState::Active {
            next.acquire_at = Some(now);
        }
        next
    }
}

/// Result of `Coordinator::acquire`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquireOutcome {
    pub state: InstanceState,
    pub instance_id: InstanceId,
}

/// Parameters of a restraint step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub constraint_id: ConstraintId,
    pub resource_unit: ResourceUnit,
    pub permits: u32,
    pub holding_scope: HoldingScope,
}

/// Outcome reported back to the hosting engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionResult {
    pub state: InstanceState,
    pub constraint_name: String,
    pub capacity: u32,
    pub resource_unit: ResourceUnit,
    pub granted_permits: u32,
    /// ACTIVE permits in the group held by other instances.
    pub currently_held_permits: u32,
    /// ACTIVE permits in the resource unit held by the same holding scope,
    /// this grant included.
    pub scope_held_permits: u32,
}
