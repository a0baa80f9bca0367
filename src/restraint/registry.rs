//! Constraint registry.
//!
//! Read-mostly definitions of named constraints and their capacities. Edited
//! by admin action; the coordinator only reads.

use std::collections::HashMap;
use tokio::sync::RwLock;

use super::types::Constraint;
use crate::types::{ConstraintDefinition, ConstraintId, Error, Result};

/// Registry of constraint definitions.
#[derive(Debug, Default)]
pub struct ConstraintRegistry {
    constraints: RwLock<HashMap<ConstraintId, Constraint>>,
}

impl ConstraintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured definitions.
    pub async fn from_definitions(defs: &[ConstraintDefinition]) -> Result<Self> {
        let registry = Self::new();
        for def in defs {
            let id = ConstraintId::from_string(def.id.clone()).map_err(Error::validation)?;
            registry.register(id, def.name.clone(), def.capacity).await?;
        }
        Ok(registry)
    }

    /// Create or replace a constraint.
    pub async fn register(
        &self,
        id: ConstraintId,
        name: impl Into<String>,
        capacity: u32,
    ) -> Result<Constraint> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::validation(format!("constraint {id} needs a name")));
        }
        if capacity == 0 {
            return Err(Error::validation(format!(
                "constraint {id} must have capacity >= 1"
            )));
        }

        let constraint = Constraint {
            id: id.clone(),
            name,
            capacity,
        };
        self.constraints.write().await.insert(id, constraint.clone());
        tracing::info!(
            "constraint_registered: id={}, capacity={}",
            constraint.id,
            constraint.capacity
        );
        Ok(constraint)
    }

    /// Change a constraint's capacity. Returns the previous capacity.
    ///
    /// Callers should follow an increase with `Coordinator::capacity_changed`
    /// so waiters are promoted without waiting for the sweep.
    pub async fn update_capacity(&self, id: &ConstraintId, capacity: u32) -> Result<u32> {
        if capacity == 0 {
            return Err(Error::validation(format!(
                "constraint {id} must have capacity >= 1"
            )));
        }
        let mut constraints = self.constraints.write().await;
        let constraint = constraints
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("unknown constraint: {id}")))?;
        let previous = constraint.capacity;
        constraint.capacity = capacity;
        tracing::info!(
            "constraint_capacity_updated: id={}, from={}, to={}",
            id,
            previous,
            capacity
        );
        Ok(previous)
    }

    pub async fn get(&self, id: &ConstraintId) -> Option<Constraint> {
        self.constraints.read().await.get(id).cloned()
    }

    /// Fetch or fail with `NotFound`.
    pub async fn require(&self, id: &ConstraintId) -> Result<Constraint> {
        self.get(id)
            .await
            .ok_or_else(|| Error::not_found(format!("unknown constraint: {id}")))
    }

    pub async fn list(&self) -> Vec<Constraint> {
        let mut all: Vec<_> = self.constraints.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn remove(&self, id: &ConstraintId) -> Option<Constraint> {
        self.constraints.write().await.remove(id)
    }
}
