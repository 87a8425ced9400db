//! Turns probe candidates into deduplicated, collision-free results

use chrono::Utc;
use homescan_core::{
    sanitize_id, CandidateDevice, DiscoveryResult, DiscoverySink, KnownDeviceIndex, PropertyValue,
    RAW_ID_PROPERTY,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::scope::ScanScope;

/// Why a candidate produced no result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// A thing with this raw id is already registered under the scope
    AlreadyKnown,
    /// The raw id has no identifier-safe characters
    EmptyId,
    /// The scope does not accept this type tag
    UnsupportedType(String),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyKnown => write!(f, "already known"),
            Self::EmptyId => write!(f, "empty identifier"),
            Self::UnsupportedType(tag) => write!(f, "unsupported type {}", tag),
        }
    }
}

/// Outcome of reconciling one candidate
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    Published(DiscoveryResult),
    Dropped(DropReason),
}

/// Reconciles the candidates of a single pass
///
/// Thing ids handed out earlier in the same pass count as taken, so
/// candidates that sanitize to the same id get `-1`, `-2`, ... suffixes.
/// A thing id held by another device's pending inbox result is taken too;
/// the same device re-announced keeps its id.
/// Claims are per pass and per scope; other scopes never interact.
pub struct Reconciler {
    scope: ScanScope,
    index: Arc<dyn KnownDeviceIndex>,
    sink: Arc<dyn DiscoverySink>,
    claimed: HashSet<String>,
}

impl Reconciler {
    pub fn new(scope: ScanScope, index: Arc<dyn KnownDeviceIndex>, sink: Arc<dyn DiscoverySink>) -> Self {
        Self {
            scope,
            index,
            sink,
            claimed: HashSet::new(),
        }
    }

    /// Reconcile one candidate and publish the result if it survives
    pub async fn reconcile(&mut self, candidate: CandidateDevice) -> Reconciled {
        let parent = &self.scope.id;

        if !self.scope.supports(&candidate.type_tag) {
            warn!(
                scope = %parent,
                raw_id = %candidate.raw_id,
                type_tag = %candidate.type_tag,
                "Dropping candidate with unsupported type"
            );
            return Reconciled::Dropped(DropReason::UnsupportedType(candidate.type_tag));
        }

        let base = sanitize_id(&candidate.raw_id);
        if base.is_empty() {
            warn!(scope = %parent, raw_id = ?candidate.raw_id, "Dropping candidate with empty identifier");
            return Reconciled::Dropped(DropReason::EmptyId);
        }

        if self.index.contains_raw(parent, &candidate.raw_id).await {
            debug!(scope = %parent, raw_id = %candidate.raw_id, "Candidate already known");
            return Reconciled::Dropped(DropReason::AlreadyKnown);
        }

        let thing_id = self.free_thing_id(&base, &candidate.raw_id).await;
        if thing_id != base {
            debug!(scope = %parent, base = %base, thing = %thing_id, "Resolved identifier collision");
        }
        self.claimed.insert(thing_id.clone());

        let label = if candidate.display_name.trim().is_empty() {
            thing_id.clone()
        } else {
            candidate.display_name
        };
        let mut properties = candidate.properties;
        properties.insert(
            RAW_ID_PROPERTY.to_string(),
            PropertyValue::Text(candidate.raw_id),
        );

        let result = DiscoveryResult {
            thing_id,
            parent_id: parent.clone(),
            type_tag: candidate.type_tag,
            label,
            properties,
            representation_property: RAW_ID_PROPERTY.to_string(),
            timestamp: Utc::now(),
        };
        self.sink.publish(result.clone()).await;
        Reconciled::Published(result)
    }

    async fn free_thing_id(&self, base: &str, raw_id: &str) -> String {
        let mut candidate = base.to_string();
        let mut suffix = 0u32;
        while self.is_taken(&candidate, raw_id).await {
            suffix += 1;
            candidate = format!("{}-{}", base, suffix);
        }
        candidate
    }

    /// Taken by this pass, by a registered thing, or by another device's
    /// pending result
    async fn is_taken(&self, thing_id: &str, raw_id: &str) -> bool {
        if self.claimed.contains(thing_id) || self.index.contains(&self.scope.id, thing_id).await {
            return true;
        }
        self.sink
            .pending_raw_id(&self.scope.id, thing_id)
            .await
            .is_some_and(|pending| pending != raw_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use homescan_core::{Inbox, InboxFlag, ScopeId, ThingRegistry};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<DiscoveryResult>>,
    }

    #[async_trait]
    impl DiscoverySink for RecordingSink {
        async fn publish(&self, result: DiscoveryResult) {
            self.published.lock().await.push(result);
        }
    }

    fn reconciler(scope: &str, registry: Arc<ThingRegistry>, sink: Arc<RecordingSink>) -> Reconciler {
        Reconciler::new(
            ScanScope::new(scope).with_supported_types(["sensor"]),
            registry,
            sink,
        )
    }

    fn thing_id(outcome: &Reconciled) -> &str {
        match outcome {
            Reconciled::Published(result) => &result.thing_id,
            Reconciled::Dropped(reason) => panic!("unexpected drop: {}", reason),
        }
    }

    #[tokio::test]
    async fn test_publishes_new_candidate() {
        let registry = Arc::new(ThingRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let mut rec = reconciler("bridge1", registry, sink.clone());

        let outcome = rec
            .reconcile(CandidateDevice::new("AA:BB", "Kitchen", "sensor").with_property("fw", "1.0"))
            .await;
        assert_eq!(thing_id(&outcome), "AA:BB");

        let published = sink.published.lock().await;
        assert_eq!(published.len(), 1);
        let result = &published[0];
        assert_eq!(result.parent_id, ScopeId::new("bridge1"));
        assert_eq!(result.label, "Kitchen");
        assert_eq!(result.properties["fw"], PropertyValue::from("1.0"));
        assert_eq!(result.raw_id().as_deref(), Some("AA:BB"));
    }

    #[tokio::test]
    async fn test_known_raw_id_is_dropped() {
        let registry = Arc::new(ThingRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let mut first = reconciler("bridge1", registry.clone(), sink.clone());
        if let Reconciled::Published(result) =
            first.reconcile(CandidateDevice::new("AA:BB", "", "sensor")).await
        {
            registry.register(result).await;
        }

        let mut second = reconciler("bridge1", registry, sink.clone());
        let outcome = second.reconcile(CandidateDevice::new("AA:BB", "", "sensor")).await;
        assert_eq!(outcome, Reconciled::Dropped(DropReason::AlreadyKnown));
        assert_eq!(sink.published.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_same_base_id_gets_sequential_suffixes() {
        let registry = Arc::new(ThingRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let mut rec = reconciler("bridge1", registry, sink.clone());

        let mut ids = Vec::new();
        for _ in 0..4 {
            let outcome = rec.reconcile(CandidateDevice::new("foo", "Foo", "sensor")).await;
            ids.push(thing_id(&outcome).to_string());
        }
        assert_eq!(ids, vec!["foo", "foo-1", "foo-2", "foo-3"]);
    }

    #[tokio::test]
    async fn test_collision_with_registered_thing_id() {
        let registry = Arc::new(ThingRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let mut first = reconciler("bridge1", registry.clone(), sink.clone());
        if let Reconciled::Published(result) =
            first.reconcile(CandidateDevice::new("AA BB", "", "sensor")).await
        {
            assert_eq!(result.thing_id, "AA_BB");
            registry.register(result).await;
        }

        // A different raw id that maps onto the same thing id
        let mut second = reconciler("bridge1", registry, sink);
        let outcome = second.reconcile(CandidateDevice::new("AA_BB", "", "sensor")).await;
        assert_eq!(thing_id(&outcome), "AA_BB-1");
    }

    #[tokio::test]
    async fn test_suffixes_are_scoped_per_parent() {
        let registry = Arc::new(ThingRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let mut a = reconciler("bridge1", registry.clone(), sink.clone());
        let mut b = reconciler("bridge2", registry, sink);

        a.reconcile(CandidateDevice::new("id", "", "sensor")).await;
        let a2 = a.reconcile(CandidateDevice::new("id", "", "sensor")).await;
        b.reconcile(CandidateDevice::new("id", "", "sensor")).await;
        let b2 = b.reconcile(CandidateDevice::new("id", "", "sensor")).await;

        assert_eq!(thing_id(&a2), "id-1");
        assert_eq!(thing_id(&b2), "id-1");
    }

    #[tokio::test]
    async fn test_invalid_candidates_are_dropped() {
        let registry = Arc::new(ThingRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let mut rec = reconciler("bridge1", registry, sink.clone());

        let empty = rec.reconcile(CandidateDevice::new(" ?? ", "", "sensor")).await;
        assert_eq!(empty, Reconciled::Dropped(DropReason::EmptyId));

        let unsupported = rec.reconcile(CandidateDevice::new("cam1", "", "camera")).await;
        assert_eq!(
            unsupported,
            Reconciled::Dropped(DropReason::UnsupportedType("camera".to_string()))
        );
        assert!(sink.published.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_display_name_falls_back_to_thing_id() {
        let registry = Arc::new(ThingRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let mut rec = reconciler("bridge1", registry, sink);

        match rec.reconcile(CandidateDevice::new("dev 7", "  ", "sensor")).await {
            Reconciled::Published(result) => assert_eq!(result.label, "dev_7"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pending_entry_of_other_device_is_taken() {
        let registry = Arc::new(ThingRegistry::new());
        let inbox = Arc::new(Inbox::new(registry.clone()));
        let parent = ScopeId::new("bridge1");

        let mut first = Reconciler::new(ScanScope::new("bridge1"), registry.clone(), inbox.clone());
        let outcome = first.reconcile(CandidateDevice::new("a b", "Old", "sensor")).await;
        assert_eq!(thing_id(&outcome), "a_b");
        inbox.ignore(&parent, "a_b").await.unwrap();

        // A different device whose raw id sanitizes to the same thing id
        let mut second = Reconciler::new(ScanScope::new("bridge1"), registry.clone(), inbox.clone());
        let outcome = second.reconcile(CandidateDevice::new("a_b", "New", "sensor")).await;
        assert_eq!(thing_id(&outcome), "a_b-1");

        let old = inbox.get(&parent, "a_b").await.unwrap();
        assert_eq!(old.result.raw_id().as_deref(), Some("a b"));
        assert_eq!(old.result.label, "Old");
        assert_eq!(old.flag, InboxFlag::Ignored);
        let new = inbox.get(&parent, "a_b-1").await.unwrap();
        assert_eq!(new.result.raw_id().as_deref(), Some("a_b"));
        assert_eq!(new.flag, InboxFlag::New);

        // The original device re-announced keeps its entry
        let mut third = Reconciler::new(ScanScope::new("bridge1"), registry, inbox.clone());
        let outcome = third.reconcile(CandidateDevice::new("a b", "Old", "sensor")).await;
        assert_eq!(thing_id(&outcome), "a_b");
        assert_eq!(inbox.entries().await.len(), 2);
    }
}
