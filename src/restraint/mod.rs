//! Restraint - distributed, capacity-bounded FIFO admission control.
//!
//! A constraint bounds how many permits may be held at once for each of its
//! resource units. Requests queue in arrival order per (constraint, unit)
//! group and are granted strictly first-in, first-out.
//!
//! Components:
//! - `registry`: constraint definitions (name, capacity)
//! - `store`: shared instance records with per-group optimistic concurrency
//! - `coordinator`: acquire, release, and unblock
//! - `step`: sync/async step adapter for the hosting engine
//! - `sweeper`: periodic reconciliation (lost wake-ups, leaked permits, TTL)

pub mod coordinator;
pub mod liveness;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod step;
pub mod store;
pub mod sweeper;
pub mod types;

pub use coordinator::Coordinator;
pub use liveness::{HoldingScopeLiveness, TerminatedScopes};
pub use registry::ConstraintRegistry;
pub use step::{AsyncResponse, StepAdapter, SyncAttempt};
pub use store::{GroupSnapshot, GroupWrite, InMemoryInstanceStore, InstanceStore, PurgeReport};
pub use sweeper::{SweepStats, Sweeper};
pub use types::{
    AcquireOutcome, AdmissionRequest, AdmissionResult, Constraint, GroupKey, HoldingScope,
    Instance, InstanceState,
};
