// Descriptor Sources
//
// Turns a migrations directory into per-key descriptor groups, each sorted
// by version. Every `*.json` file in the directory holds one descriptor
// object or an array of them:
//
//   {
//     "resource_type": "TOPIC",
//     "resource_name": "orders",
//     "version": 1,
//     "operation": { "action": "create", "partitions": 6 }
//   }
//
// Checksums are always computed from `operation`; files cannot supply them.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::migration::{MigrationDescriptor, ResourceKey, ResourceType, Version};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("cannot read migrations from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid migration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{key} declares version {version} more than once")]
    DuplicateVersion { key: ResourceKey, version: Version },
}

/// All descriptors of one resource key, ascending by version.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorGroup {
    pub key: ResourceKey,
    pub descriptors: Vec<MigrationDescriptor>,
}

impl DescriptorGroup {
    pub fn new(key: ResourceKey, descriptors: Vec<MigrationDescriptor>) -> Self {
        Self { key, descriptors }
    }
}

pub trait DescriptorSource {
    /// Descriptor groups for resources of `domain`, ordered by key.
    fn load(&self, domain: ResourceType) -> Result<Vec<DescriptorGroup>, SourceError>;
}

#[derive(Debug, Deserialize)]
struct DescriptorFile {
    resource_type: ResourceType,
    resource_name: String,
    version: Version,
    operation: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FileContents {
    Many(Vec<DescriptorFile>),
    One(DescriptorFile),
}

#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn json_files(&self) -> Result<Vec<PathBuf>, SourceError> {
        let io = |source| SourceError::Io {
            path: self.dir.clone(),
            source,
        };

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io)? {
            let path = entry.map_err(io)?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn parse_file(path: &Path) -> Result<Vec<DescriptorFile>, SourceError> {
    let bytes = fs::read(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let contents = serde_json::from_slice(&bytes).map_err(|source| SourceError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(match contents {
        FileContents::Many(files) => files,
        FileContents::One(file) => vec![file],
    })
}

/// Group descriptors by key and sort each group by version.
pub fn group_descriptors(
    descriptors: impl IntoIterator<Item = MigrationDescriptor>,
) -> Result<Vec<DescriptorGroup>, SourceError> {
    let mut groups: BTreeMap<ResourceKey, Vec<MigrationDescriptor>> = BTreeMap::new();
    for descriptor in descriptors {
        groups.entry(descriptor.key.clone()).or_default().push(descriptor);
    }

    groups
        .into_iter()
        .map(|(key, mut descriptors)| {
            descriptors.sort_by(|a, b| a.version.cmp(&b.version));
            if let Some(pair) = descriptors.windows(2).find(|p| p[0].version == p[1].version) {
                return Err(SourceError::DuplicateVersion {
                    key,
                    version: pair[0].version.clone(),
                });
            }
            Ok(DescriptorGroup::new(key, descriptors))
        })
        .collect()
}

impl DescriptorSource for DirectorySource {
    fn load(&self, domain: ResourceType) -> Result<Vec<DescriptorGroup>, SourceError> {
        let mut descriptors = Vec::new();

        for path in self.json_files()? {
            for file in parse_file(&path)? {
                if file.resource_type != domain {
                    continue;
                }
                descriptors.push(MigrationDescriptor::new(
                    ResourceKey::new(file.resource_type, file.resource_name),
                    file.version,
                    file.operation,
                ));
            }
        }

        let groups = group_descriptors(descriptors)?;
        debug!(dir = %self.dir.display(), %domain, keys = groups.len(), "descriptors loaded");
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declared(kind: &str, name: &str, version: u64, operation: Value) -> Value {
        json!({
            "resource_type": kind,
            "resource_name": name,
            "version": version,
            "operation": operation,
        })
    }

    fn write(dir: &Path, name: &str, value: Value) {
        fs::write(dir.join(name), serde_json::to_vec_pretty(&value).unwrap()).unwrap();
    }

    #[test]
    fn loads_and_groups_by_key() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "002_orders.json",
            declared("TOPIC", "orders", 2, json!({ "partitions": 12 })),
        );
        write(
            dir.path(),
            "001_init.json",
            json!([
                declared("TOPIC", "orders", 1, json!({ "partitions": 6 })),
                declared("TOPIC", "audit", 1, json!({ "partitions": 1 })),
                declared("ACL", "orders-reader", 1, json!({})),
            ]),
        );
        fs::write(dir.path().join("README.md"), "not a migration").unwrap();

        let groups = DirectorySource::new(dir.path()).load(ResourceType::Topic).unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key, ResourceKey::topic("audit"));
        assert_eq!(groups[1].key, ResourceKey::topic("orders"));
        let versions: Vec<&Version> = groups[1].descriptors.iter().map(|d| &d.version).collect();
        assert_eq!(versions, vec![&Version::Number(1), &Version::Number(2)]);
    }

    #[test]
    fn duplicate_versions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let one = declared("TOPIC", "orders", 1, json!({}));
        write(dir.path(), "a.json", one.clone());
        write(dir.path(), "b.json", one);

        let err = DirectorySource::new(dir.path()).load(ResourceType::Topic).unwrap_err();
        assert!(matches!(err, SourceError::DuplicateVersion { .. }));
    }

    #[test]
    fn malformed_file_names_its_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();

        let err = DirectorySource::new(dir.path()).load(ResourceType::Topic).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
