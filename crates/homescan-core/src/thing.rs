//! Thing types for tracking discovered devices

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Property key under which every result stores the vendor-native id
pub const RAW_ID_PROPERTY: &str = "rawId";

/// Identifier of a discovery scope (a bridge, gateway or controller)
///
/// Results discovered under a scope use it as their parent id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(pub String);

impl ScopeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ScopeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Scalar value of a discovery property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// A tentative discovery produced by a probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateDevice {
    /// Vendor-native identifier (MAC address, serial, numeric id)
    pub raw_id: String,
    /// Human-readable name reported by the device
    pub display_name: String,
    /// Kind of thing this candidate maps to
    pub type_tag: String,
    /// Vendor properties
    #[serde(default)]
    pub properties: HashMap<String, PropertyValue>,
}

impl CandidateDevice {
    pub fn new(
        raw_id: impl Into<String>,
        display_name: impl Into<String>,
        type_tag: impl Into<String>,
    ) -> Self {
        Self {
            raw_id: raw_id.into(),
            display_name: display_name.into(),
            type_tag: type_tag.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A collision-free device announcement handed to the inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Disambiguated identifier, unique under `parent_id`
    pub thing_id: String,
    /// Scope the thing was discovered under
    pub parent_id: ScopeId,
    /// Kind of thing
    pub type_tag: String,
    pub label: String,
    pub properties: HashMap<String, PropertyValue>,
    /// Property that identifies the physical device across scans
    pub representation_property: String,
    /// When the result was published
    pub timestamp: DateTime<Utc>,
}

impl DiscoveryResult {
    /// Vendor-native id stored under the representation property
    pub fn raw_id(&self) -> Option<String> {
        self.properties
            .get(&self.representation_property)
            .map(|v| v.to_string())
    }
}

/// Map a vendor id onto the identifier-safe character set
///
/// Letters, digits, `_`, `-` and `:` are kept; every other character
/// becomes `_`. Leading and trailing `_` are trimmed, so an id made only
/// of unsafe characters sanitizes to the empty string.
pub fn sanitize_id(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':') {
                c
            } else {
                '_'
            }
        })
        .collect();
    mapped.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_keeps_mac() {
        assert_eq!(sanitize_id("AA:BB"), "AA:BB");
        assert_eq!(sanitize_id("sensor-01_a"), "sensor-01_a");
    }

    #[test]
    fn test_sanitize_replaces_unsafe() {
        assert_eq!(sanitize_id("192.168.1.10"), "192_168_1_10");
        assert_eq!(sanitize_id("  living room  "), "living_room");
    }

    #[test]
    fn test_sanitize_to_empty() {
        assert_eq!(sanitize_id(""), "");
        assert_eq!(sanitize_id("   "), "");
        assert_eq!(sanitize_id("#!?"), "");
    }

    #[test]
    fn test_property_value_untagged() {
        let props: HashMap<String, PropertyValue> =
            serde_json::from_str(r#"{"fw":"1.2","channel":3,"battery":true}"#).unwrap();
        assert_eq!(props["fw"], PropertyValue::Text("1.2".into()));
        assert_eq!(props["channel"], PropertyValue::Integer(3));
        assert_eq!(props["battery"], PropertyValue::Bool(true));
    }

    #[test]
    fn test_result_raw_id() {
        let result = DiscoveryResult {
            thing_id: "AA_BB-1".to_string(),
            parent_id: ScopeId::new("bridge1"),
            type_tag: "sensor".to_string(),
            label: "Sensor".to_string(),
            properties: HashMap::from([(
                RAW_ID_PROPERTY.to_string(),
                PropertyValue::from("AA BB"),
            )]),
            representation_property: RAW_ID_PROPERTY.to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(result.raw_id().as_deref(), Some("AA BB"));
    }
}
