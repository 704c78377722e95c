// Divergence Detection
//
// Compares the descriptors on disk with the ledger's history for a key and
// reports every way they disagree. Any finding makes the key unsafe to
// migrate; nothing here is auto-resolved.

use serde::Serialize;

use crate::migration::{Checksum, MigrationDescriptor, ResourceKey, Version};
use crate::replay::KeyHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    /// An applied descriptor's content changed after it was applied.
    ChecksumMismatch,

    /// The ledger records a version that no descriptor declares any more.
    MissingDescriptor,

    /// A descriptor sorts below the latest applied version but was never
    /// applied.
    OutOfOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DivergenceFinding {
    pub kind: DivergenceKind,
    pub version: Version,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DivergenceReport {
    pub key: ResourceKey,
    pub findings: Vec<DivergenceFinding>,
}

impl DivergenceReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Lowest diverging version.
    pub fn first_version(&self) -> Option<&Version> {
        self.findings.iter().map(|f| &f.version).min()
    }
}

impl std::fmt::Display for DivergenceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages: Vec<&str> = self.findings.iter().map(|f| f.message.as_str()).collect();
        write!(f, "{} diverged from its ledger: {}", self.key, messages.join("; "))
    }
}

/// Check `descriptors` (ascending) against the recorded history.
pub fn detect_divergence(
    key: &ResourceKey,
    descriptors: &[MigrationDescriptor],
    history: &KeyHistory,
) -> DivergenceReport {
    let mut findings = Vec::new();
    let find = |version: &Version| descriptors.iter().find(|d| &d.version == version);

    // Rule 1: every recorded version is still declared, unchanged.
    for record in &history.records {
        match find(&record.version) {
            None => findings.push(DivergenceFinding {
                kind: DivergenceKind::MissingDescriptor,
                version: record.version.clone(),
                message: format!("applied version {} has no descriptor", record.version),
            }),
            Some(descriptor) if descriptor.checksum != record.checksum => {
                findings.push(mismatch(&record.version, &record.checksum, &descriptor.checksum))
            }
            Some(_) => {}
        }
    }

    // Rule 2: nothing unapplied hides below the latest version. Below a
    // truncated history there is nothing to compare against.
    if let (Some(first), Some(latest)) = (history.records.first(), history.latest()) {
        let floor = if history.truncated {
            Some(&first.version)
        } else {
            None
        };

        for descriptor in descriptors {
            let below_latest = descriptor.version < latest.version;
            let above_floor = floor.map_or(true, |floor| descriptor.version > *floor);
            let recorded = history
                .records
                .iter()
                .any(|r| r.version == descriptor.version);

            if below_latest && above_floor && !recorded {
                findings.push(DivergenceFinding {
                    kind: DivergenceKind::OutOfOrder,
                    version: descriptor.version.clone(),
                    message: format!(
                        "version {} was never applied but sorts below applied version {}",
                        descriptor.version, latest.version
                    ),
                });
            }
        }
    }

    DivergenceReport {
        key: key.clone(),
        findings,
    }
}

fn mismatch(version: &Version, recorded: &Checksum, current: &Checksum) -> DivergenceFinding {
    DivergenceFinding {
        kind: DivergenceKind::ChecksumMismatch,
        version: version.clone(),
        message: format!(
            "version {version} changed after being applied (recorded {}, now {})",
            recorded.short(),
            current.short()
        ),
    }
}
