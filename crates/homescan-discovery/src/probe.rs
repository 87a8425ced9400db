//! Probe contract for vendor-specific device enumeration

use async_trait::async_trait;
use homescan_core::CandidateDevice;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

use crate::scope::ScanScope;

/// Enumeration failure, kept distinct from "no devices found"
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("network error: {0}")]
    Network(String),
    #[error("probe timed out")]
    Timeout,
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("invalid probe scope: {0}")]
    InvalidScope(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Channel end a probe pushes candidates into
///
/// Candidates are reconciled in the order they are sent. Once the pass
/// stops listening (abort, timeout) sends fail and the probe should return.
#[derive(Debug, Clone)]
pub struct CandidateSender {
    tx: mpsc::Sender<CandidateDevice>,
}

impl CandidateSender {
    pub(crate) fn new(tx: mpsc::Sender<CandidateDevice>) -> Self {
        Self { tx }
    }

    /// Hand one candidate to the reconciler, false once the pass has stopped
    pub async fn send(&self, candidate: CandidateDevice) -> bool {
        trace!(raw_id = %candidate.raw_id, "Candidate produced");
        self.tx.send(candidate).await.is_ok()
    }

    /// Send candidates in order until the pass stops, returns how many were accepted
    pub async fn send_all<I>(&self, candidates: I) -> usize
    where
        I: IntoIterator<Item = CandidateDevice>,
    {
        let mut sent = 0;
        for candidate in candidates {
            if !self.send(candidate).await {
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Whether the pass has stopped listening
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Vendor-specific step that enumerates reachable devices for a scope
#[async_trait]
pub trait Probe: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Push every currently reachable device into `candidates`
    ///
    /// Return `Ok(())` when enumeration finished, even with zero candidates,
    /// and an error when it could not be carried out.
    async fn enumerate(&self, scope: &ScanScope, candidates: CandidateSender) -> Result<(), ProbeError>;
}

/// Probe that replays a fixed device list
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    devices: Vec<CandidateDevice>,
}

impl StaticProbe {
    pub fn new(devices: Vec<CandidateDevice>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl Probe for StaticProbe {
    fn name(&self) -> &str {
        "static"
    }

    async fn enumerate(&self, _scope: &ScanScope, candidates: CandidateSender) -> Result<(), ProbeError> {
        candidates.send_all(self.devices.iter().cloned()).await;
        Ok(())
    }
}
