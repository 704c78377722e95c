// Migration Planner
//
// Decides which descriptors of a key are still pending, given what the
// ledger says was applied. Pure: no I/O, no reordering.

use serde::Serialize;

use crate::migration::{MigrationDescriptor, MigrationRecord, ResourceKey, Version};
use crate::replay::KeyHistory;

pub mod divergence;

pub use divergence::{detect_divergence, DivergenceFinding, DivergenceKind, DivergenceReport};

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("{0}")]
    Divergence(DivergenceReport),

    #[error("descriptors for {key} are out of order: {previous} is followed by {next}")]
    Unordered {
        key: ResourceKey,
        previous: Version,
        next: Version,
    },

    #[error("descriptor version {version} targets {found}, not {key}")]
    ForeignDescriptor {
        key: ResourceKey,
        found: ResourceKey,
        version: Version,
    },
}

impl PlanError {
    /// Version the failure is attributed to.
    pub fn version(&self) -> Option<&Version> {
        match self {
            PlanError::Divergence(report) => report.first_version(),
            PlanError::Unordered { next, .. } => Some(next),
            PlanError::ForeignDescriptor { version, .. } => Some(version),
        }
    }
}

/// Pending work for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub key: ResourceKey,
    pub latest: Option<MigrationRecord>,
    pub pending: Vec<MigrationDescriptor>,
}

impl Plan {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_versions(&self) -> Vec<Version> {
        self.pending.iter().map(|d| d.version.clone()).collect()
    }
}

/// Summary of a plan, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub key: ResourceKey,
    pub latest: Option<Version>,
    pub pending: Vec<Version>,
}

impl From<&Plan> for PlanSummary {
    fn from(plan: &Plan) -> Self {
        Self {
            key: plan.key.clone(),
            latest: plan.latest.as_ref().map(|r| r.version.clone()),
            pending: plan.pending_versions(),
        }
    }
}

/// Compute the pending descriptors of `key`.
///
/// `descriptors` must be in strictly ascending version order. The result
/// holds every descriptor above the latest recorded version, in that same
/// order. An empty result means the key is up to date.
pub fn plan(
    key: &ResourceKey,
    descriptors: &[MigrationDescriptor],
    history: &KeyHistory,
) -> Result<Plan, PlanError> {
    for descriptor in descriptors {
        if &descriptor.key != key {
            return Err(PlanError::ForeignDescriptor {
                key: key.clone(),
                found: descriptor.key.clone(),
                version: descriptor.version.clone(),
            });
        }
    }

    for pair in descriptors.windows(2) {
        if pair[0].version >= pair[1].version {
            return Err(PlanError::Unordered {
                key: key.clone(),
                previous: pair[0].version.clone(),
                next: pair[1].version.clone(),
            });
        }
    }

    let report = detect_divergence(key, descriptors, history);
    if !report.is_clean() {
        return Err(PlanError::Divergence(report));
    }

    let latest = history.latest().cloned();
    let pending = descriptors
        .iter()
        .filter(|d| latest.as_ref().map_or(true, |l| d.version > l.version))
        .cloned()
        .collect();

    Ok(Plan {
        key: key.clone(),
        latest,
        pending,
    })
}
