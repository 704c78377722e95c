// Migration Model
//
// Identity, ordering and content hashing for migrations. Descriptors are
// what sits on disk; records are what the ledger keeps once applied.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha3::{Digest, Sha3_256};

/// Kind of Kafka resource a migration targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceType {
    Topic,
    Acl,
    Schema,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Topic => "TOPIC",
            ResourceType::Acl => "ACL",
            ResourceType::Schema => "SCHEMA",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown resource type `{0}`")]
pub struct UnknownResourceType(pub String);

impl FromStr for ResourceType {
    type Err = UnknownResourceType;

    /// Accepts singular and plural spellings in any case (`topic`, `TOPICS`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "topic" | "topics" => Ok(ResourceType::Topic),
            "acl" | "acls" => Ok(ResourceType::Acl),
            "schema" | "schemas" => Ok(ResourceType::Schema),
            _ => Err(UnknownResourceType(s.to_owned())),
        }
    }
}

/// Identifies one resource under migration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub resource_name: String,
}

impl ResourceKey {
    pub fn new(resource_type: ResourceType, resource_name: impl Into<String>) -> Self {
        Self {
            resource_type,
            resource_name: resource_name.into(),
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(ResourceType::Topic, name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.resource_name)
    }
}

/// Position of a migration within its resource's sequence.
///
/// Numeric versions compare numerically, labels lexicographically. A
/// sequence should not mix the two; if it does, every number sorts before
/// every label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Version {
    Number(u64),
    Label(String),
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Version::Number(a), Version::Number(b)) => a.cmp(b),
            (Version::Label(a), Version::Label(b)) => a.cmp(b),
            (Version::Number(_), Version::Label(_)) => Ordering::Less,
            (Version::Label(_), Version::Number(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Version::Number(value)
    }
}

impl From<&str> for Version {
    fn from(value: &str) -> Self {
        match value.parse::<u64>() {
            Ok(n) => Version::Number(n),
            Err(_) => Version::Label(value.to_owned()),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Number(n) => write!(f, "{n}"),
            Version::Label(s) => f.write_str(s),
        }
    }
}

/// Hex SHA3-256 of a migration's operation payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(pub String);

impl Checksum {
    /// Hash the canonical JSON encoding of `operation`.
    ///
    /// Object keys are serialized in sorted order, so formatting and key
    /// order in the source file do not affect the checksum.
    pub fn of(operation: &Value) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(operation.to_string().as_bytes());
        Checksum(format!("{:x}", hasher.finalize()))
    }

    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One migration step as declared on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationDescriptor {
    #[serde(flatten)]
    pub key: ResourceKey,
    pub version: Version,
    pub checksum: Checksum,
    pub operation: Value,
}

impl MigrationDescriptor {
    pub fn new(key: ResourceKey, version: impl Into<Version>, operation: Value) -> Self {
        let checksum = Checksum::of(&operation);
        Self {
            key,
            version: version.into(),
            checksum,
            operation,
        }
    }

    pub fn reference(&self) -> RecordRef {
        RecordRef {
            version: self.version.clone(),
            checksum: self.checksum.clone(),
        }
    }
}

/// Durable proof that a descriptor was applied. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    #[serde(flatten)]
    pub key: ResourceKey,
    pub version: Version,
    pub checksum: Checksum,
    pub applied_at: DateTime<Utc>,
    pub applied_by: String,
}

impl MigrationRecord {
    pub fn from_descriptor(
        descriptor: &MigrationDescriptor,
        applied_by: impl Into<String>,
    ) -> Self {
        Self {
            key: descriptor.key.clone(),
            version: descriptor.version.clone(),
            checksum: descriptor.checksum.clone(),
            applied_at: Utc::now(),
            applied_by: applied_by.into(),
        }
    }

    pub fn reference(&self) -> RecordRef {
        RecordRef {
            version: self.version.clone(),
            checksum: self.checksum.clone(),
        }
    }
}

/// The identity of a record, used for compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub version: Version,
    pub checksum: Checksum,
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{} ({})", self.version, self.checksum.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_versions_order_numerically() {
        let mut versions: Vec<Version> = vec![10.into(), 2.into(), 1.into()];
        versions.sort();
        assert_eq!(versions, vec![1.into(), 2.into(), 10.into()]);
    }

    #[test]
    fn label_versions_order_lexicographically() {
        assert!(Version::from("2024_01_b") > Version::from("2024_01_a"));
        assert!(Version::from("7") < Version::from("v1"));
    }

    #[test]
    fn checksum_ignores_key_order() {
        let a = json!({
            "partitions": 3,
            "config": { "retention.ms": "1000", "cleanup.policy": "delete" }
        });
        let b = json!({
            "config": { "cleanup.policy": "delete", "retention.ms": "1000" },
            "partitions": 3
        });
        assert_eq!(Checksum::of(&a), Checksum::of(&b));
        assert_ne!(Checksum::of(&a), Checksum::of(&json!({"partitions": 4})));
        assert_eq!(Checksum::of(&a).0.len(), 64);
    }

    #[test]
    fn resource_type_parses_domain_names() {
        assert_eq!("topics".parse::<ResourceType>(), Ok(ResourceType::Topic));
        assert_eq!("ACL".parse::<ResourceType>(), Ok(ResourceType::Acl));
        assert!("tables".parse::<ResourceType>().is_err());
    }

    #[test]
    fn descriptor_deserializes_flat_key() {
        let descriptor: MigrationDescriptor = serde_json::from_value(json!({
            "resource_type": "TOPIC",
            "resource_name": "orders",
            "version": 3,
            "checksum": "abc",
            "operation": {"partitions": 6}
        }))
        .unwrap();

        assert_eq!(descriptor.key, ResourceKey::topic("orders"));
        assert_eq!(descriptor.version, Version::Number(3));
    }
}
