//! Homescan Core - Discovery data model, known-device index and inbox
//!
//! This crate provides the foundational types shared by the discovery engine:
//! - Candidate devices produced by probes and the results published from them
//! - Identifier sanitization for thing ids
//! - The registry of already-known things, scoped per bridge
//! - The inbox that receives published results

pub mod inbox;
pub mod registry;
pub mod thing;

pub use inbox::{DiscoverySink, Inbox, InboxEntry, InboxError, InboxFlag};
pub use registry::{KnownDeviceIndex, ThingRegistry};
pub use thing::{
    sanitize_id, CandidateDevice, DiscoveryResult, PropertyValue, ScopeId, RAW_ID_PROPERTY,
};
