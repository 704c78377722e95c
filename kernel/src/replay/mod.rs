// Deterministic Ledger Fold
//
// Folds migration log entries into the current ledger state. The fold is a
// pure function of the log prefix: every reader that has seen the same
// entries derives the same state and agrees on which commits won.

use std::collections::HashMap;

use serde::Serialize;

use crate::log::{LogEntry, LogOffset, Precondition};
use crate::migration::{MigrationRecord, RecordRef, ResourceKey};

/// Accepted records of one key, in ascending version order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyHistory {
    pub records: Vec<MigrationRecord>,
    /// Set when compaction dropped records older than the first one here.
    pub truncated: bool,
}

impl KeyHistory {
    pub fn latest(&self) -> Option<&MigrationRecord> {
        self.records.last()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Result of folding a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldOutcome {
    /// The entry became the key's latest record.
    Accepted,
    /// The entry's precondition no longer held; it is a no-op.
    Rejected { current: Option<RecordRef> },
    /// The entry sits below the already-folded prefix and was ignored.
    Stale,
}

impl FoldOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FoldOutcome::Accepted)
    }
}

/// Ledger state derived from a log prefix.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    next_offset: LogOffset,
    keys: HashMap<ResourceKey, KeyHistory>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// First offset not yet folded.
    pub fn next_offset(&self) -> LogOffset {
        self.next_offset
    }

    /// Skip over offsets that compaction removed.
    pub fn advance_to(&mut self, offset: LogOffset) {
        self.next_offset = self.next_offset.max(offset);
    }

    pub fn latest(&self, key: &ResourceKey) -> Option<&MigrationRecord> {
        self.keys.get(key).and_then(KeyHistory::latest)
    }

    pub fn history(&self, key: &ResourceKey) -> KeyHistory {
        self.keys.get(key).cloned().unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.keys.keys()
    }

    /// Fold one entry.
    ///
    /// A commit entry is accepted only when its precondition matches the
    /// key's latest record at this point of the log and its version is
    /// strictly greater. A checkpoint is accepted when it moves the key
    /// forward.
    pub fn apply(&mut self, offset: LogOffset, entry: &LogEntry) -> FoldOutcome {
        if offset < self.next_offset {
            return FoldOutcome::Stale;
        }
        self.next_offset = offset + 1;

        let history = self.keys.entry(entry.key().clone()).or_default();
        let current = history.latest().map(MigrationRecord::reference);
        let advances = current
            .as_ref()
            .map_or(true, |latest| entry.record.version > latest.version);

        let accepted = match &entry.precondition {
            Precondition::Absent => current.is_none(),
            Precondition::Latest(expected) => current.as_ref() == Some(expected) && advances,
            Precondition::Checkpoint => {
                if advances {
                    history.truncated = true;
                }
                advances
            }
        };

        if accepted {
            history.records.push(entry.record.clone());
            FoldOutcome::Accepted
        } else {
            if history.is_empty() && !history.truncated {
                self.keys.remove(entry.key());
            }
            FoldOutcome::Rejected { current }
        }
    }
}

/// Replay a log prefix from scratch.
pub fn replay<'a, I>(entries: I) -> LedgerState
where
    I: IntoIterator<Item = (LogOffset, &'a LogEntry)>,
{
    let mut state = LedgerState::new();
    for (offset, entry) in entries {
        state.apply(offset, entry);
    }
    state
}
