//! Scan session state and per-pass reports

use chrono::{DateTime, Utc};
use homescan_core::ScopeId;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Observable state of a scope's scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Idle,
    Running,
    /// Abort requested, the pass is finalizing
    Cancelling,
}

/// What started a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanOrigin {
    Manual,
    Background,
}

/// Terminal state of a pass; every outcome returns the scope to idle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    Completed,
    TimedOut,
    Cancelled,
    /// The probe signalled an error or its task panicked
    Failed(String),
}

impl std::fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// One in-flight discovery pass
#[derive(Debug)]
pub(crate) struct ScanSession {
    pub(crate) id: u64,
    pub(crate) state: ScanState,
    pub(crate) origin: ScanOrigin,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) timeout_at: Instant,
    pub(crate) cancel: CancellationToken,
}

impl ScanSession {
    pub(crate) fn start(id: u64, origin: ScanOrigin, timeout: std::time::Duration) -> Self {
        Self {
            id,
            state: ScanState::Running,
            origin,
            started_at: Utc::now(),
            timeout_at: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Flip to cancelling and signal the pass, false if already cancelling
    pub(crate) fn request_cancel(&mut self) -> bool {
        if self.state == ScanState::Cancelling {
            return false;
        }
        self.state = ScanState::Cancelling;
        self.cancel.cancel();
        true
    }
}

/// Summary of a finished pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub scope: ScopeId,
    pub origin: ScanOrigin,
    pub outcome: ScanOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Candidates received from the probe
    pub candidates: usize,
    pub published: usize,
    pub dropped: usize,
    /// Inbox entries withdrawn after a completed pass
    pub withdrawn: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_request_cancel_once() {
        let mut session = ScanSession::start(1, ScanOrigin::Manual, Duration::from_secs(10));
        assert_eq!(session.state, ScanState::Running);
        assert!(session.request_cancel());
        assert!(session.cancel.is_cancelled());
        assert_eq!(session.state, ScanState::Cancelling);
        assert!(!session.request_cancel());
    }
}
