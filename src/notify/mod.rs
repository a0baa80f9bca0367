//! Wake-up notification bus.
//!
//! The coordinator publishes the id of every instance it promotes to ACTIVE;
//! the hosting engine subscribes and resumes the node whose persisted
//! continuation is keyed by that id. Delivery is best effort: a wake-up lost
//! here is recovered by the reconciliation sweep.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::types::{ConstraintId, InstanceId, ResourceUnit, Result};

// =============================================================================
// Message Types
// =============================================================================

/// Notification that an instance has been granted its permits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wakeup {
    pub instance_id: InstanceId,
    pub constraint_id: ConstraintId,
    pub resource_unit: ResourceUnit,
    pub timestamp_ms: i64,
}

impl Wakeup {
    pub fn new(
        instance_id: InstanceId,
        constraint_id: ConstraintId,
        resource_unit: ResourceUnit,
    ) -> Self {
        Self {
            instance_id,
            constraint_id,
            resource_unit,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Outbound side of the notification channel, as seen by the coordinator.
#[async_trait]
pub trait WakeupPublisher: Send + Sync + std::fmt::Debug {
    /// Deliver a wake-up; returns how many subscribers received it.
    async fn publish(&self, wakeup: Wakeup) -> Result<usize>;
}

// =============================================================================
// Subscriber Management
// =============================================================================

/// Subscription receipt for managing subscriptions.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub wakeups_published: u64,
    pub wakeups_undelivered: u64,
    pub active_subscribers: usize,
}

// =============================================================================
// WakeupBus - In-Memory Fan-out
// =============================================================================

/// In-memory fan-out of wake-ups to every subscriber.
#[derive(Debug, Default)]
pub struct WakeupBus {
    subscribers: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Wakeup>>>>,
    stats: Arc<RwLock<BusStats>>,
}

impl WakeupBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to wake-ups.
    ///
    /// Returns (subscription handle, receiver channel). Re-subscribing with
    /// the same id replaces the previous channel.
    pub async fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
    ) -> (Subscription, mpsc::UnboundedReceiver<Wakeup>) {
        let subscriber_id = subscriber_id.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(subscriber_id.clone(), tx);

        let mut stats = self.stats.write().await;
        stats.active_subscribers = subscribers.len();

        tracing::debug!("wakeup_subscriber_registered: id={}", subscriber_id);

        (Subscription { id: subscriber_id }, rx)
    }

    /// Unsubscribe from wake-ups.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.remove(&subscription.id);

        let mut stats = self.stats.write().await;
        stats.active_subscribers = subscribers.len();

        tracing::debug!("wakeup_subscriber_removed: id={}", subscription.id);
    }

    pub async fn get_stats(&self) -> BusStats {
        self.stats.read().await.clone()
    }
}

#[async_trait]
impl WakeupPublisher for WakeupBus {
    async fn publish(&self, wakeup: Wakeup) -> Result<usize> {
        let mut subscribers = self.subscribers.write().await;

        let mut delivered = 0;
        // Drop subscribers whose receiver is gone
        subscribers.retain(|_, tx| {
            if tx.send(wakeup.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                false
            }
        });

        let mut stats = self.stats.write().await;
        stats.wakeups_published += 1;
        if delivered == 0 {
            stats.wakeups_undelivered += 1;
        }
        stats.active_subscribers = subscribers.len();

        tracing::debug!(
            "wakeup_published: instance_id={}, delivered={}",
            wakeup.instance_id,
            delivered
        );

        Ok(delivered)
    }
}
