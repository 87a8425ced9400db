//! Registry of things that already exist, scoped per parent
//!
//! The discovery engine only reads from the registry through
//! [`KnownDeviceIndex`]. Things enter it when an inbox result is approved.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::thing::{DiscoveryResult, ScopeId};

/// Read-only view of the things registered under each parent
#[async_trait]
pub trait KnownDeviceIndex: Send + Sync {
    /// Whether a thing with this vendor-native id exists under `parent`
    async fn contains_raw(&self, parent: &ScopeId, raw_id: &str) -> bool;

    /// Whether `thing_id` is already taken under `parent`
    async fn contains(&self, parent: &ScopeId, thing_id: &str) -> bool;
}

#[derive(Debug, Default)]
struct ScopeThings {
    things: HashMap<String, DiscoveryResult>,
    raw_ids: HashSet<String>,
}

/// In-memory thing registry
#[derive(Debug, Default)]
pub struct ThingRegistry {
    scopes: RwLock<HashMap<ScopeId, ScopeThings>>,
}

impl ThingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thing, returns false if the thing id was already present
    ///
    /// Registration is idempotent on thing id so racing approvals of the
    /// same result are harmless.
    pub async fn register(&self, result: DiscoveryResult) -> bool {
        let mut scopes = self.scopes.write().await;
        let scope = scopes.entry(result.parent_id.clone()).or_default();
        if scope.things.contains_key(&result.thing_id) {
            debug!(parent = %result.parent_id, thing = %result.thing_id, "Thing already registered");
            return false;
        }
        if let Some(raw_id) = result.raw_id() {
            scope.raw_ids.insert(raw_id);
        }
        info!(parent = %result.parent_id, thing = %result.thing_id, "Thing registered");
        scope.things.insert(result.thing_id.clone(), result);
        true
    }

    /// Remove a thing, freeing both its thing id and raw id
    pub async fn remove(&self, parent: &ScopeId, thing_id: &str) -> Option<DiscoveryResult> {
        let mut scopes = self.scopes.write().await;
        let scope = scopes.get_mut(parent)?;
        let removed = scope.things.remove(thing_id)?;
        if let Some(raw_id) = removed.raw_id() {
            scope.raw_ids.remove(&raw_id);
        }
        info!(parent = %parent, thing = %thing_id, "Thing removed from registry");
        Some(removed)
    }

    /// Things registered under a parent, sorted by thing id
    pub async fn things(&self, parent: &ScopeId) -> Vec<DiscoveryResult> {
        let scopes = self.scopes.read().await;
        let mut things: Vec<_> = scopes
            .get(parent)
            .map(|s| s.things.values().cloned().collect())
            .unwrap_or_default();
        things.sort_by(|a, b| a.thing_id.cmp(&b.thing_id));
        things
    }

    pub async fn len(&self) -> usize {
        self.scopes.read().await.values().map(|s| s.things.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KnownDeviceIndex for ThingRegistry {
    async fn contains_raw(&self, parent: &ScopeId, raw_id: &str) -> bool {
        self.scopes
            .read()
            .await
            .get(parent)
            .is_some_and(|s| s.raw_ids.contains(raw_id))
    }

    async fn contains(&self, parent: &ScopeId, thing_id: &str) -> bool {
        self.scopes
            .read()
            .await
            .get(parent)
            .is_some_and(|s| s.things.contains_key(thing_id))
    }
}
