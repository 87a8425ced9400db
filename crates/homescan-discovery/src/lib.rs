//! Homescan Discovery - Scan scheduling, probing and result reconciliation
//!
//! This crate provides the discovery engine shared by every scope:
//! - The probe contract vendors implement, plus static and TCP sweep probes
//! - The reconciler that drops known devices and resolves id collisions
//! - The scan trigger running manual and fixed-delay background passes

pub mod engine;
pub mod event;
pub mod probe;
pub mod reconciler;
pub mod scope;
pub mod session;
pub mod tcp;

pub use engine::{DiscoveryEngine, EngineError, ScanHandle};
pub use event::DiscoveryEvent;
pub use probe::{CandidateSender, Probe, ProbeError, StaticProbe};
pub use reconciler::{DropReason, Reconciled, Reconciler};
pub use scope::{ScanScope, DEFAULT_SCAN_TIMEOUT};
pub use session::{ScanOrigin, ScanOutcome, ScanReport, ScanState};
pub use tcp::{TcpPortProbe, TcpProbeConfig, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_MAX_CONCURRENT};
