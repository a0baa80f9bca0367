//! Step adapter - bridges the coordinator to the hosting engine's step model.
//!
//! The engine drives a restraint step through one of two paths:
//! - **sync**: `try_sync` grants on the spot, or hands back the correlation id
//!   to suspend on.
//! - **async**: `begin_async` always suspends; the wake-up for the instance id
//!   resumes the node, which then calls `on_resume`.
//!
//! `on_abort` is the compensating action for cancelled or failed nodes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::coordinator::Coordinator;
use super::types::{AcquireOutcome, AdmissionRequest, AdmissionResult, Instance, InstanceState};
use crate::types::{Error, InstanceId, Result};

/// What the engine must persist to suspend a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncResponse {
    /// Correlation ids the engine waits on; always exactly the instance id.
    pub callback_ids: Vec<InstanceId>,
}

impl AsyncResponse {
    fn for_instance(instance_id: InstanceId) -> Self {
        Self {
            callback_ids: vec![instance_id],
        }
    }
}

/// Outcome of a synchronous attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAttempt {
    /// Permits granted; the step succeeds immediately.
    Granted(AdmissionResult),
    /// Queued; suspend on the returned correlation id.
    Pending(AsyncResponse),
}

/// Adapter exposed to the hosting engine.
#[derive(Debug, Clone)]
pub struct StepAdapter {
    coordinator: Arc<Coordinator>,
}

impl StepAdapter {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Acquire and return immediately: granted, or suspend.
    pub async fn try_sync(&self, request: &AdmissionRequest) -> Result<SyncAttempt> {
        let outcome = self.acquire(request).await?;
        match outcome.state {
            InstanceState::Active => {
                let instance = self.require_instance(&outcome.instance_id).await?;
                Ok(SyncAttempt::Granted(self.build_result(&instance).await?))
            }
            _ => Ok(SyncAttempt::Pending(AsyncResponse::for_instance(
                outcome.instance_id,
            ))),
        }
    }

    /// Acquire and always suspend.
    ///
    /// An immediate grant publishes its wake-up right away so the engine
    /// resumes it through the same path as a promoted waiter.
    pub async fn begin_async(&self, request: &AdmissionRequest) -> Result<AsyncResponse> {
        let outcome = self.acquire(request).await?;
        if outcome.state == InstanceState::Active {
            let instance = self.require_instance(&outcome.instance_id).await?;
            self.coordinator.publish_wakeup(&instance).await;
        }
        Ok(AsyncResponse::for_instance(outcome.instance_id))
    }

    /// Build the step outcome once the wake-up for `instance_id` arrived.
    pub async fn on_resume(&self, instance_id: &InstanceId) -> Result<AdmissionResult> {
        let instance = self.require_instance(instance_id).await?;
        match instance.state {
            InstanceState::Active => self.build_result(&instance).await,
            InstanceState::Rejected => {
                let constraint = self.coordinator.registry().require(&instance.constraint_id).await?;
                Err(rejection(instance.permits, &constraint.name, constraint.capacity))
            }
            state => Err(Error::state_transition(format!(
                "instance {instance_id} resumed while {state}"
            ))),
        }
    }

    /// Release whatever the node holds or waits for. Safe to repeat.
    pub async fn on_abort(&self, instance_id: &InstanceId) -> Result<()> {
        let finished = self.coordinator.release(instance_id).await?;
        tracing::info!(
            "step_aborted: instance_id={}, released={}",
            instance_id,
            finished
        );
        Ok(())
    }

    async fn acquire(&self, request: &AdmissionRequest) -> Result<AcquireOutcome> {
        let outcome = self
            .coordinator
            .acquire(
                &request.constraint_id,
                &request.resource_unit,
                request.permits,
                request.holding_scope.clone(),
            )
            .await?;
        if outcome.state == InstanceState::Rejected {
            let constraint = self.coordinator.registry().require(&request.constraint_id).await?;
            return Err(rejection(request.permits, &constraint.name, constraint.capacity));
        }
        Ok(outcome)
    }

    async fn require_instance(&self, instance_id: &InstanceId) -> Result<Instance> {
        self.coordinator
            .get(instance_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("unknown instance: {instance_id}")))
    }

    async fn build_result(&self, instance: &Instance) -> Result<AdmissionResult> {
        let constraint = self.coordinator.registry().require(&instance.constraint_id).await?;
        let usage = self
            .coordinator
            .current_usage(&instance.constraint_id, &instance.resource_unit)
            .await?;
        let scope_held_permits = self
            .coordinator
            .scope_held_permits(&instance.holding_scope, &instance.resource_unit)
            .await?;

        Ok(AdmissionResult {
            state: instance.state,
            constraint_name: constraint.name,
            capacity: constraint.capacity,
            resource_unit: instance.resource_unit.clone(),
            granted_permits: instance.permits,
            currently_held_permits: usage.saturating_sub(instance.permits),
            scope_held_permits,
        })
    }
}

fn rejection(permits: u32, name: &str, capacity: u32) -> Error {
    Error::validation(format!(
        "requested {permits} permits but constraint '{name}' has capacity {capacity}"
    ))
}
