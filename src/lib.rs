//! # Restraint Core - Distributed FIFO Admission Control
//!
//! Rust implementation of the restraint primitive providing:
//! - Named constraints with a fixed permit capacity per resource unit
//! - Strict FIFO admission per (constraint, resource unit) group
//! - Optimistic-concurrency coordination over a shared instance store
//! - Sync and async step integration for a hosting workflow engine
//! - Background reconciliation of lost wake-ups and leaked permits
//!
//! ## Architecture
//!
//! Every engine process runs its own `Coordinator`; they share one store:
//! ```text
//!   engine node → StepAdapter → Coordinator ─┐
//!                                            ├─→ InstanceStore (revision CAS)
//!   engine node → StepAdapter → Coordinator ─┘        ↑
//!                      ↑         │                    │
//!                      └─ Wakeup ┘            Sweeper (per shard)
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod notify;
pub mod restraint;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
