// Migration Ledger
//
// A ledger maps each resource key to the records of the migrations applied
// to it and accepts new records through a compare-and-swap commit. Callers
// depend on `LedgerBackend` only; `FileLedger` and `LogLedger` are the
// two storage strategies behind it.

use std::time::Duration;

use async_trait::async_trait;

use crate::log::LogError;
use crate::migration::{MigrationRecord, RecordRef, ResourceKey};
use crate::replay::KeyHistory;

mod file;
mod log_ledger;

pub use file::FileLedger;
pub use log_ledger::LogLedger;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The key's latest record changed since the caller read it.
    #[error(
        "commit conflict on {key}: expected {}, found {}",
        describe(.expected),
        describe(.actual)
    )]
    Conflict {
        key: ResourceKey,
        expected: Option<RecordRef>,
        actual: Option<RecordRef>,
    },

    #[error("invalid commit for {key}: {reason}")]
    InvalidCommit { key: ResourceKey, reason: String },

    #[error("ledger i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("migration log error: {0}")]
    Log(#[from] LogError),

    #[error("ledger operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("ledger task failed: {0}")]
    Task(String),
}

impl LedgerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. })
    }

    /// Anything but a conflict means the ledger cannot be trusted for the
    /// rest of the run.
    pub fn is_unavailable(&self) -> bool {
        !self.is_conflict()
    }

    /// Latest record the ledger held when a commit conflicted.
    pub fn found(&self) -> Option<&RecordRef> {
        match self {
            LedgerError::Conflict { actual, .. } => actual.as_ref(),
            _ => None,
        }
    }
}

fn describe(record: &Option<RecordRef>) -> String {
    match record {
        Some(record) => record.to_string(),
        None => "no record".to_owned(),
    }
}

/// Durable store of applied migrations.
///
/// Implementations must guarantee:
/// - `commit` writes nothing unless the key's latest record still equals
///   `expected_previous`
/// - a successful `commit` is durable before it returns
/// - a commit interrupted by cancellation is either fully visible or not
///   visible at all
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Every accepted record for `key`, oldest first.
    async fn history(&self, key: &ResourceKey) -> Result<KeyHistory, LedgerError>;

    /// The highest-version record for `key`.
    async fn latest(&self, key: &ResourceKey) -> Result<Option<MigrationRecord>, LedgerError> {
        Ok(self.history(key).await?.records.pop())
    }

    /// Append `candidate` as the key's new latest record if the current
    /// latest is still `expected_previous`.
    async fn commit(
        &self,
        candidate: MigrationRecord,
        expected_previous: Option<&MigrationRecord>,
    ) -> Result<MigrationRecord, LedgerError>;
}

/// Reject commits that could never be valid, whatever the stored state.
pub(crate) fn validate_candidate(
    candidate: &MigrationRecord,
    expected_previous: Option<&MigrationRecord>,
) -> Result<(), LedgerError> {
    let Some(previous) = expected_previous else {
        return Ok(());
    };

    if previous.key != candidate.key {
        return Err(LedgerError::InvalidCommit {
            key: candidate.key.clone(),
            reason: format!("expected previous record belongs to {}", previous.key),
        });
    }

    if candidate.version <= previous.version {
        return Err(LedgerError::InvalidCommit {
            key: candidate.key.clone(),
            reason: format!(
                "version {} does not follow {}",
                candidate.version, previous.version
            ),
        });
    }

    Ok(())
}

/// Compare the stored latest record with what the caller expected.
pub(crate) fn check_expected(
    key: &ResourceKey,
    actual: Option<&MigrationRecord>,
    expected_previous: Option<&MigrationRecord>,
) -> Result<(), LedgerError> {
    let actual = actual.map(MigrationRecord::reference);
    let expected = expected_previous.map(MigrationRecord::reference);

    if actual == expected {
        Ok(())
    } else {
        Err(LedgerError::Conflict {
            key: key.clone(),
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationDescriptor;
    use serde_json::json;

    fn record(name: &str, version: u64) -> MigrationRecord {
        let descriptor =
            MigrationDescriptor::new(ResourceKey::topic(name), version, json!({ "v": version }));
        MigrationRecord::from_descriptor(&descriptor, "test")
    }

    #[test]
    fn candidate_must_follow_previous() {
        let err = validate_candidate(&record("orders", 1), Some(&record("orders", 2))).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidCommit { .. }));

        let err =
            validate_candidate(&record("orders", 3), Some(&record("payments", 2))).unwrap_err();
        assert!(err.to_string().contains("belongs to TOPIC/payments"));

        assert!(validate_candidate(&record("orders", 3), Some(&record("orders", 2))).is_ok());
    }

    #[test]
    fn conflict_message_names_both_sides() {
        let key = ResourceKey::topic("orders");
        let err = check_expected(&key, Some(&record("orders", 2)), None).unwrap_err();

        assert!(err.is_conflict());
        let message = err.to_string();
        assert!(message.contains("expected no record"), "{message}");
        assert!(message.contains("found v2"), "{message}");
        assert!(!err.is_unavailable());
        assert_eq!(err.found().map(|r| r.version.to_string()), Some("2".to_owned()));

        let timeout = LedgerError::Timeout(Duration::from_secs(1));
        assert!(timeout.is_unavailable());
        assert!(timeout.found().is_none());
    }
}
