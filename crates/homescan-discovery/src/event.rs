//! Discovery events for real-time updates

use homescan_core::{DiscoveryResult, ScopeId};

use crate::reconciler::DropReason;
use crate::session::{ScanOrigin, ScanReport};

/// Event broadcast by the engine while passes run
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A pass started for a scope
    ScanStarted { scope: ScopeId, origin: ScanOrigin },
    /// A candidate survived reconciliation and was handed to the sink
    ResultPublished(DiscoveryResult),
    /// A candidate produced no result
    CandidateDropped {
        scope: ScopeId,
        raw_id: String,
        reason: DropReason,
    },
    /// A pass reached a terminal state
    ScanFinished(ScanReport),
}

impl DiscoveryEvent {
    /// Scope the event belongs to
    pub fn scope(&self) -> &ScopeId {
        match self {
            Self::ScanStarted { scope, .. } => scope,
            Self::ResultPublished(result) => &result.parent_id,
            Self::CandidateDropped { scope, .. } => scope,
            Self::ScanFinished(report) => &report.scope,
        }
    }
}
