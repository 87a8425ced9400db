//! Inbox of discovery results awaiting user confirmation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::registry::ThingRegistry;
use crate::thing::{DiscoveryResult, ScopeId};

#[derive(Error, Debug)]
pub enum InboxError {
    #[error("no inbox entry {thing_id} under {parent}")]
    UnknownEntry { parent: ScopeId, thing_id: String },
}

/// Receiver of published discovery results
#[async_trait]
pub trait DiscoverySink: Send + Sync {
    /// Announce one result; republishing the same thing id refreshes it
    async fn publish(&self, result: DiscoveryResult);

    /// Withdraw results under `parent` published before `before`
    ///
    /// Returns the thing ids that were withdrawn.
    async fn remove_older_results(&self, parent: &ScopeId, before: DateTime<Utc>) -> Vec<String> {
        let _ = (parent, before);
        Vec::new()
    }

    /// Raw id of the device holding `thing_id` in a not yet approved result
    ///
    /// The reconciler treats a thing id held by a different device as taken.
    async fn pending_raw_id(&self, parent: &ScopeId, thing_id: &str) -> Option<String> {
        let _ = (parent, thing_id);
        None
    }
}

/// State of an inbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboxFlag {
    /// Waiting for the user
    New,
    /// Hidden by the user, kept so the device stays suppressed
    Ignored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    pub result: DiscoveryResult,
    pub flag: InboxFlag,
}

type EntryKey = (ScopeId, String);

/// In-memory inbox backed by a [`ThingRegistry`]
pub struct Inbox {
    entries: RwLock<HashMap<EntryKey, InboxEntry>>,
    registry: Arc<ThingRegistry>,
    auto_approve: bool,
}

impl Inbox {
    pub fn new(registry: Arc<ThingRegistry>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            registry,
            auto_approve: false,
        }
    }

    /// Approve every result as soon as it is published
    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    /// Move an entry into the registry
    pub async fn approve(&self, parent: &ScopeId, thing_id: &str) -> Result<DiscoveryResult, InboxError> {
        let entry = self
            .entries
            .write()
            .await
            .remove(&(parent.clone(), thing_id.to_string()))
            .ok_or_else(|| InboxError::UnknownEntry {
                parent: parent.clone(),
                thing_id: thing_id.to_string(),
            })?;
        self.registry.register(entry.result.clone()).await;
        Ok(entry.result)
    }

    /// Mark an entry as ignored
    pub async fn ignore(&self, parent: &ScopeId, thing_id: &str) -> Result<(), InboxError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&(parent.clone(), thing_id.to_string()))
            .ok_or_else(|| InboxError::UnknownEntry {
                parent: parent.clone(),
                thing_id: thing_id.to_string(),
            })?;
        entry.flag = InboxFlag::Ignored;
        Ok(())
    }

    /// Entries sorted by parent then thing id
    pub async fn entries(&self) -> Vec<InboxEntry> {
        let mut entries: Vec<_> = self.entries.read().await.values().cloned().collect();
        entries.sort_by(|a, b| {
            (&a.result.parent_id, &a.result.thing_id).cmp(&(&b.result.parent_id, &b.result.thing_id))
        });
        entries
    }

    pub async fn get(&self, parent: &ScopeId, thing_id: &str) -> Option<InboxEntry> {
        self.entries
            .read()
            .await
            .get(&(parent.clone(), thing_id.to_string()))
            .cloned()
    }

    pub fn registry(&self) -> &Arc<ThingRegistry> {
        &self.registry
    }
}

#[async_trait]
impl DiscoverySink for Inbox {
    async fn publish(&self, result: DiscoveryResult) {
        if self.auto_approve {
            debug!(parent = %result.parent_id, thing = %result.thing_id, "Auto-approving result");
            self.registry.register(result).await;
            return;
        }

        let mut entries = self.entries.write().await;
        let key = (result.parent_id.clone(), result.thing_id.clone());
        match entries.get_mut(&key) {
            Some(existing) if existing.result.raw_id() != result.raw_id() => {
                warn!(
                    parent = %result.parent_id,
                    thing = %result.thing_id,
                    held_by = ?existing.result.raw_id(),
                    raw_id = ?result.raw_id(),
                    "Thing id held by another device, keeping existing inbox entry"
                );
            }
            Some(existing) => {
                debug!(parent = %result.parent_id, thing = %result.thing_id, "Refreshing inbox entry");
                existing.result = result;
            }
            None => {
                info!(parent = %result.parent_id, thing = %result.thing_id, label = %result.label, "New inbox entry");
                entries.insert(
                    key,
                    InboxEntry {
                        result,
                        flag: InboxFlag::New,
                    },
                );
            }
        }
    }

    async fn pending_raw_id(&self, parent: &ScopeId, thing_id: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .get(&(parent.clone(), thing_id.to_string()))
            .and_then(|entry| entry.result.raw_id())
    }

    async fn remove_older_results(&self, parent: &ScopeId, before: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.entries.write().await;
        let stale: Vec<EntryKey> = entries
            .iter()
            .filter(|(key, entry)| &key.0 == parent && entry.result.timestamp < before)
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for key in stale {
            entries.remove(&key);
            info!(parent = %parent, thing = %key.1, "Withdrew stale inbox entry");
            removed.push(key.1);
        }
        removed.sort();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::KnownDeviceIndex;
    use crate::thing::{PropertyValue, RAW_ID_PROPERTY};
    use chrono::Duration;

    fn result(thing_id: &str, timestamp: DateTime<Utc>) -> DiscoveryResult {
        result_for(thing_id, thing_id, timestamp)
    }

    fn result_for(thing_id: &str, raw_id: &str, timestamp: DateTime<Utc>) -> DiscoveryResult {
        DiscoveryResult {
            thing_id: thing_id.to_string(),
            parent_id: ScopeId::new("bridge1"),
            type_tag: "sensor".to_string(),
            label: format!("Sensor {}", thing_id),
            properties: HashMap::from([(
                RAW_ID_PROPERTY.to_string(),
                PropertyValue::from(raw_id),
            )]),
            representation_property: RAW_ID_PROPERTY.to_string(),
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_approve_registers_thing() {
        let registry = Arc::new(ThingRegistry::new());
        let inbox = Inbox::new(registry.clone());
        inbox.publish(result("AA:BB", Utc::now())).await;

        let parent = ScopeId::new("bridge1");
        assert_eq!(inbox.entries().await.len(), 1);
        inbox.approve(&parent, "AA:BB").await.unwrap();

        assert!(inbox.entries().await.is_empty());
        assert!(registry.contains_raw(&parent, "AA:BB").await);
    }

    #[tokio::test]
    async fn test_approve_unknown_entry() {
        let inbox = Inbox::new(Arc::new(ThingRegistry::new()));
        let err = inbox.approve(&ScopeId::new("bridge1"), "nope").await.unwrap_err();
        assert!(matches!(err, InboxError::UnknownEntry { .. }));
    }

    #[tokio::test]
    async fn test_republish_keeps_ignored_flag() {
        let inbox = Inbox::new(Arc::new(ThingRegistry::new()));
        let parent = ScopeId::new("bridge1");
        inbox.publish(result("id", Utc::now())).await;
        inbox.ignore(&parent, "id").await.unwrap();
        inbox.publish(result("id", Utc::now())).await;

        let entry = inbox.get(&parent, "id").await.unwrap();
        assert_eq!(entry.flag, InboxFlag::Ignored);
    }

    #[tokio::test]
    async fn test_auto_approve_skips_inbox() {
        let registry = Arc::new(ThingRegistry::new());
        let inbox = Inbox::new(registry.clone()).with_auto_approve(true);
        inbox.publish(result("id", Utc::now())).await;

        assert!(inbox.entries().await.is_empty());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_older_results() {
        let inbox = Inbox::new(Arc::new(ThingRegistry::new()));
        let now = Utc::now();
        inbox.publish(result("old", now - Duration::seconds(120))).await;
        inbox.publish(result("fresh", now)).await;

        let parent = ScopeId::new("bridge1");
        let removed = inbox
            .remove_older_results(&parent, now - Duration::seconds(60))
            .await;
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(inbox.get(&parent, "fresh").await.is_some());

        let other = ScopeId::new("bridge2");
        assert!(inbox.remove_older_results(&other, now + Duration::seconds(1)).await.is_empty());
    }

    #[tokio::test]
    async fn test_other_device_cannot_take_over_entry() {
        let inbox = Inbox::new(Arc::new(ThingRegistry::new()));
        let parent = ScopeId::new("bridge1");
        inbox.publish(result_for("a_b", "a b", Utc::now())).await;
        inbox.ignore(&parent, "a_b").await.unwrap();

        inbox.publish(result_for("a_b", "a_b", Utc::now())).await;

        let entry = inbox.get(&parent, "a_b").await.unwrap();
        assert_eq!(entry.result.raw_id().as_deref(), Some("a b"));
        assert_eq!(entry.flag, InboxFlag::Ignored);
        assert_eq!(inbox.pending_raw_id(&parent, "a_b").await.as_deref(), Some("a b"));
        assert!(inbox.pending_raw_id(&parent, "other").await.is_none());
    }
}
