//! Holding-scope liveness - the engine's answer to "is scope X still running".
//!
//! Only the sweeper asks. A scope reported terminated while its instance is
//! still ACTIVE is a leaked permit.

use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::RwLock;

use super::types::HoldingScope;
use crate::types::Result;

/// Liveness lookup provided by the hosting engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HoldingScopeLiveness: Send + Sync {
    async fn is_active(&self, scope: &HoldingScope) -> Result<bool>;
}

/// Liveness table fed by engine lifecycle events.
///
/// Scopes are live until marked terminated.
#[derive(Debug, Default)]
pub struct TerminatedScopes {
    terminated: RwLock<HashSet<HoldingScope>>,
}

impl TerminatedScopes {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mark_terminated(&self, scope: HoldingScope) {
        tracing::debug!("holding_scope_terminated: scope={}", scope);
        self.terminated.write().await.insert(scope);
    }

    pub async fn forget(&self, scope: &HoldingScope) {
        self.terminated.write().await.remove(scope);
    }
}

#[async_trait]
impl HoldingScopeLiveness for TerminatedScopes {
    async fn is_active(&self, scope: &HoldingScope) -> Result<bool> {
        Ok(!self.terminated.read().await.contains(scope))
    }
}
