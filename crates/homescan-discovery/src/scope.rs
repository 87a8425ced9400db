//! Per-scope discovery settings

use homescan_core::ScopeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Default scan deadline
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// A bridge or controller that discovery runs under
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanScope {
    /// Parent id of every result found in this scope
    pub id: ScopeId,
    /// Type tags accepted from probes; empty accepts every tag
    pub supported_types: BTreeSet<String>,
    /// Per-pass deadline
    pub timeout: Duration,
    /// Withdraw inbox results not re-announced by a completed pass
    pub remove_stale_results: bool,
}

impl ScanScope {
    pub fn new(id: impl Into<ScopeId>) -> Self {
        Self {
            id: id.into(),
            supported_types: BTreeSet::new(),
            timeout: DEFAULT_SCAN_TIMEOUT,
            remove_stale_results: false,
        }
    }

    pub fn with_supported_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_remove_stale_results(mut self, remove: bool) -> Self {
        self.remove_stale_results = remove;
        self
    }

    /// Whether candidates of this type belong to the scope
    pub fn supports(&self, type_tag: &str) -> bool {
        self.supported_types.is_empty() || self.supported_types.contains(type_tag)
    }
}
