// Distributed ledger over a single-partition migration log.
//
// State is the replay fold of the log, cached with the offset it covers and
// caught up by tailing. Commits are compare-and-swap built from the log's
// total order: check against the caught-up state, append, then read back up
// to the appended entry and let the fold decide who won.

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{check_expected, validate_candidate, LedgerBackend, LedgerError};
use crate::log::{LogEntry, MigrationLog};
use crate::migration::{MigrationRecord, ResourceKey};
use crate::replay::{FoldOutcome, KeyHistory, LedgerState};

pub const DEFAULT_READ_BATCH: usize = 500;

pub struct LogLedger<L> {
    log: L,
    state: Mutex<LedgerState>,
    batch_size: usize,
}

impl<L: MigrationLog> LogLedger<L> {
    pub fn new(log: L) -> Self {
        Self::with_batch_size(log, DEFAULT_READ_BATCH)
    }

    pub fn with_batch_size(log: L, batch_size: usize) -> Self {
        Self {
            log,
            state: Mutex::new(LedgerState::new()),
            batch_size: batch_size.max(1),
        }
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Fold every entry up to the log's current end into `state`.
    ///
    /// Returns the fold outcome of the entry with id `watch` if it was read
    /// during this catch-up.
    async fn catch_up(
        &self,
        state: &mut LedgerState,
        watch: Option<Uuid>,
    ) -> Result<Option<FoldOutcome>, LedgerError> {
        let end = self.log.end_offset().await?;
        let mut watched = None;

        while state.next_offset() < end {
            let batch = self.log.read_from(state.next_offset(), self.batch_size).await?;
            if batch.is_empty() {
                break;
            }

            for (offset, entry) in &batch {
                let outcome = state.apply(*offset, entry);
                if Some(entry.id) == watch {
                    watched = Some(outcome);
                }
            }
        }
        state.advance_to(end);

        debug!(log = self.log.name(), offset = state.next_offset(), "ledger caught up");
        Ok(watched)
    }
}

#[async_trait]
impl<L: MigrationLog> LedgerBackend for LogLedger<L> {
    fn describe(&self) -> String {
        format!("log ledger on `{}`", self.log.name())
    }

    async fn history(&self, key: &ResourceKey) -> Result<KeyHistory, LedgerError> {
        let mut state = self.state.lock().await;
        self.catch_up(&mut state, None).await?;
        Ok(state.history(key))
    }

    async fn latest(&self, key: &ResourceKey) -> Result<Option<MigrationRecord>, LedgerError> {
        let mut state = self.state.lock().await;
        self.catch_up(&mut state, None).await?;
        Ok(state.latest(key).cloned())
    }

    async fn commit(
        &self,
        candidate: MigrationRecord,
        expected_previous: Option<&MigrationRecord>,
    ) -> Result<MigrationRecord, LedgerError> {
        validate_candidate(&candidate, expected_previous)?;
        let key = candidate.key.clone();

        let mut state = self.state.lock().await;
        self.catch_up(&mut state, None).await?;
        check_expected(&key, state.latest(&key), expected_previous)?;

        let entry = LogEntry::commit(candidate, expected_previous);
        let offset = self.log.append(&entry).await?;

        // The fold over everything up to our entry decides the race.
        match self.catch_up(&mut state, Some(entry.id)).await? {
            Some(FoldOutcome::Accepted) => {
                debug!(
                    resource = %key,
                    version = %entry.record.version,
                    offset,
                    "record committed"
                );
                Ok(entry.record)
            }
            outcome => {
                let actual = state.latest(&key).map(MigrationRecord::reference);
                warn!(
                    resource = %key,
                    version = %entry.record.version,
                    offset,
                    ?outcome,
                    "lost commit race; appended entry is a no-op"
                );
                Err(LedgerError::Conflict {
                    key,
                    expected: expected_previous.map(MigrationRecord::reference),
                    actual,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{FileLog, MemoryLog};
    use crate::migration::{MigrationDescriptor, Version};
    use serde_json::json;

    fn record(version: u64) -> MigrationRecord {
        let key = ResourceKey::topic("orders");
        let descriptor = MigrationDescriptor::new(key, version, json!({ "v": version }));
        MigrationRecord::from_descriptor(&descriptor, "test")
    }

    #[tokio::test]
    async fn commit_is_visible_to_other_ledgers_on_the_same_log() {
        let log = MemoryLog::default();
        let writer = LogLedger::new(log.clone());
        let reader = LogLedger::new(log.clone());
        let key = ResourceKey::topic("orders");

        let r1 = writer.commit(record(1), None).await.unwrap();
        assert_eq!(reader.latest(&key).await.unwrap(), Some(r1.clone()));

        let r2 = reader.commit(record(2), Some(&r1)).await.unwrap();
        assert_eq!(writer.latest(&key).await.unwrap(), Some(r2));
    }

    #[tokio::test]
    async fn stale_cache_conflicts_before_appending() {
        let log = MemoryLog::default();
        let a = LogLedger::new(log.clone());
        let b = LogLedger::new(log.clone());

        let r1 = a.commit(record(1), None).await.unwrap();
        b.commit(record(2), Some(&r1)).await.unwrap();
        let before = log.len();

        let err = a.commit(record(2), Some(&r1)).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(log.len(), before);
    }

    /// A log whose appends land behind a rival's entry, as when another
    /// process appends between our check and our write.
    struct RacingLog {
        inner: MemoryLog,
        rival: parking_lot::Mutex<Option<LogEntry>>,
    }

    #[async_trait]
    impl MigrationLog for RacingLog {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn append(&self, entry: &LogEntry) -> Result<u64, crate::log::LogError> {
            let rival = self.rival.lock().take();
            if let Some(rival) = rival {
                self.inner.append(&rival).await?;
            }
            self.inner.append(entry).await
        }

        async fn read_from(
            &self,
            offset: u64,
            max: usize,
        ) -> Result<Vec<(u64, LogEntry)>, crate::log::LogError> {
            self.inner.read_from(offset, max).await
        }

        async fn end_offset(&self) -> Result<u64, crate::log::LogError> {
            self.inner.end_offset().await
        }
    }

    #[tokio::test]
    async fn losing_append_is_reported_as_conflict() {
        let inner = MemoryLog::default();
        let rival_record = record(2);
        let log = RacingLog {
            inner: inner.clone(),
            rival: parking_lot::Mutex::new(Some(LogEntry::commit(rival_record.clone(), None))),
        };
        let ledger = LogLedger::new(log);
        let key = ResourceKey::topic("orders");

        let err = ledger.commit(record(1), None).await.unwrap_err();
        match err {
            LedgerError::Conflict { actual, .. } => {
                assert_eq!(actual.map(|r| r.version), Some(Version::Number(2)))
            }
            other => panic!("unexpected error: {other}"),
        }

        // Both entries are in the log, but only the rival counts.
        assert_eq!(inner.len(), 2);
        assert_eq!(ledger.latest(&key).await.unwrap(), Some(rival_record));
    }

    #[tokio::test]
    async fn replay_after_compaction_matches_live_state() {
        let log = MemoryLog::default();
        let ledger = LogLedger::with_batch_size(log.clone(), 1);
        let key = ResourceKey::topic("orders");

        let mut previous = None;
        for version in 1..=5 {
            previous = Some(ledger.commit(record(version), previous.as_ref()).await.unwrap());
        }
        log.compact();
        assert_eq!(log.len(), 1);

        let fresh = LogLedger::new(log.clone());
        let history = fresh.history(&key).await.unwrap();
        assert!(history.truncated);
        assert_eq!(history.latest(), previous.as_ref());

        let r6 = fresh.commit(record(6), previous.as_ref()).await.unwrap();
        assert_eq!(ledger.latest(&key).await.unwrap(), Some(r6));
    }

    #[tokio::test]
    async fn works_over_a_file_log() {
        let dir = tempfile::tempdir().unwrap();
        let first = LogLedger::new(FileLog::open(dir.path(), "_topic_migrations").unwrap());
        let r1 = first.commit(record(1), None).await.unwrap();

        let second = LogLedger::new(FileLog::open(dir.path(), "_topic_migrations").unwrap());
        let err = second.commit(record(1), None).await.unwrap_err();
        assert!(err.is_conflict());

        second.commit(record(2), Some(&r1)).await.unwrap();
        let key = ResourceKey::topic("orders");
        assert_eq!(first.history(&key).await.unwrap().records.len(), 2);
    }

    #[tokio::test]
    async fn commits_resume_after_an_interrupted_append() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let key = ResourceKey::topic("orders");
        let ledger = LogLedger::new(FileLog::open(dir.path(), "_topic_migrations").unwrap());
        let r1 = ledger.commit(record(1), None).await.unwrap();

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(ledger.log().path())
            .unwrap();
        file.write_all(br#"{"id":"#).unwrap();
        drop(file);

        let reopened = LogLedger::new(FileLog::open(dir.path(), "_topic_migrations").unwrap());
        assert_eq!(reopened.latest(&key).await.unwrap(), Some(r1.clone()));

        let r2 = reopened.commit(record(2), Some(&r1)).await.unwrap();

        let fresh = LogLedger::new(FileLog::open(dir.path(), "_topic_migrations").unwrap());
        let history = fresh.history(&key).await.unwrap();
        assert_eq!(history.records, vec![r1, r2]);
    }
}
