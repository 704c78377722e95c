// Migration Log
//
// The append-only, totally ordered log that backs the distributed ledger.
// Entries are never interpreted here; the replay fold decides which of
// them take effect.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::migration::{MigrationRecord, RecordRef, ResourceKey};
use crate::replay::LedgerState;

pub mod file;
pub mod store;

pub use file::FileLog;
pub use store::MigrationLog;

/// Position of an entry in the log, assigned by the log on append.
pub type LogOffset = u64;

/// What the writer believed the key's latest record was when it appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Precondition {
    /// The key had no record.
    Absent,
    /// The key's latest record was this one.
    Latest(RecordRef),
    /// Written by compaction; stands in for all earlier entries of the key.
    Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub record: MigrationRecord,
    pub precondition: Precondition,
}

impl LogEntry {
    /// Build the entry for a compare-and-swap commit of `record`.
    pub fn commit(record: MigrationRecord, expected_previous: Option<&MigrationRecord>) -> Self {
        let precondition = match expected_previous {
            Some(previous) => Precondition::Latest(previous.reference()),
            None => Precondition::Absent,
        };

        Self {
            id: Uuid::new_v4(),
            record,
            precondition,
        }
    }

    /// Compaction key.
    pub fn key(&self) -> &ResourceKey {
        &self.record.key
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt log entry at offset {offset}: {reason}")]
    Corrupt { offset: LogOffset, reason: String },

    #[error("appended entry {0} was not found when re-reading the log")]
    Unacknowledged(Uuid),

    #[error("log task failed: {0}")]
    Task(String),
}

#[derive(Debug, Default)]
struct MemoryLogInner {
    entries: VecDeque<(LogOffset, LogEntry)>,
    next_offset: LogOffset,
}

/// In-process log. Clones share the same entries, so several ledgers can
/// contend on one log the way separate processes contend on a topic.
#[derive(Debug, Clone)]
pub struct MemoryLog {
    name: String,
    inner: Arc<RwLock<MemoryLogInner>>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(crate::config::MIGRATION_LOG_NAME)
    }
}

impl MemoryLog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(RwLock::new(MemoryLogInner::default())),
        }
    }

    /// Number of entries physically retained.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every retained entry, in offset order.
    pub fn entries(&self) -> Vec<(LogOffset, LogEntry)> {
        self.inner.read().entries.iter().cloned().collect()
    }

    /// Key-based compaction.
    ///
    /// Keeps only the accepted latest entry of each key, at its original
    /// offset, rewritten as a checkpoint. Rejected entries are dropped, so a
    /// writer that lost a race can never survive compaction as the key's
    /// last word. Returns the number of entries removed.
    pub fn compact(&self) -> usize {
        let mut inner = self.inner.write();
        let mut state = LedgerState::default();
        let mut keep: HashMap<ResourceKey, (LogOffset, LogEntry)> = HashMap::new();

        for (offset, entry) in inner.entries.iter() {
            if state.apply(*offset, entry).is_accepted() {
                keep.insert(entry.key().clone(), (*offset, entry.clone()));
            }
        }

        let mut retained: Vec<(LogOffset, LogEntry)> = keep
            .into_values()
            .map(|(offset, mut entry)| {
                entry.precondition = Precondition::Checkpoint;
                (offset, entry)
            })
            .collect();
        retained.sort_by_key(|(offset, _)| *offset);

        let removed = inner.entries.len() - retained.len();
        inner.entries = retained.into();
        removed
    }
}

#[async_trait]
impl MigrationLog for MemoryLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, entry: &LogEntry) -> Result<LogOffset, LogError> {
        let mut inner = self.inner.write();
        let offset = inner.next_offset;
        inner.entries.push_back((offset, entry.clone()));
        inner.next_offset += 1;
        Ok(offset)
    }

    async fn read_from(
        &self,
        offset: LogOffset,
        max: usize,
    ) -> Result<Vec<(LogOffset, LogEntry)>, LogError> {
        let inner = self.inner.read();
        let start = inner.entries.partition_point(|(o, _)| *o < offset);
        Ok(inner.entries.iter().skip(start).take(max).cloned().collect())
    }

    async fn end_offset(&self) -> Result<LogOffset, LogError> {
        Ok(self.inner.read().next_offset)
    }
}
