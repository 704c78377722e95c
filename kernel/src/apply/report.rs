// Run Report
//
// Per-key outcome of an orchestrator run. Serialized as the CLI's output.

use serde::Serialize;
use uuid::Uuid;

use crate::migration::{ResourceKey, Version};
use crate::plan::{DivergenceReport, PlanSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Divergence,
    /// Descriptors out of order or declared under the wrong key.
    InvalidDescriptors,
    Driver,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    Done {
        applied: Vec<Version>,
    },
    Failed {
        /// Version that could not be applied, when there is one.
        version: Option<Version>,
        kind: FailureKind,
        /// Latest version recorded for the key; the next run resumes after it.
        checkpoint: Option<Version>,
        /// Versions applied and committed during this run before failing.
        applied: Vec<Version>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyOutcome {
    pub key: ResourceKey,
    #[serde(flatten)]
    pub status: KeyStatus,
    pub conflicts: u32,
}

impl KeyOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self.status, KeyStatus::Done { .. })
    }

    pub fn applied(&self) -> &[Version] {
        match &self.status {
            KeyStatus::Done { applied } | KeyStatus::Failed { applied, .. } => applied,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.status {
            KeyStatus::Done { .. } => None,
            KeyStatus::Failed { kind, .. } => Some(*kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub applied_by: String,
    pub outcomes: Vec<KeyOutcome>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(KeyOutcome::is_done)
    }

    pub fn failed(&self) -> impl Iterator<Item = &KeyOutcome> {
        self.outcomes.iter().filter(|o| !o.is_done())
    }

    pub fn outcome(&self, key: &ResourceKey) -> Option<&KeyOutcome> {
        self.outcomes.iter().find(|o| &o.key == key)
    }
}

/// Result of planning one key without applying anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanPreview {
    Pending(PlanSummary),
    Diverged(DivergenceReport),
    Invalid { key: ResourceKey, message: String },
}
