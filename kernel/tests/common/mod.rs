#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use kmigrate_kernel::driver::{DriverError, ResourceDriver};
use kmigrate_kernel::ledger::{LedgerBackend, LedgerError};
use kmigrate_kernel::log::{LogEntry, LogError, LogOffset, MemoryLog, MigrationLog};
use kmigrate_kernel::migration::{MigrationDescriptor, MigrationRecord, ResourceKey};
use kmigrate_kernel::replay::KeyHistory;
use kmigrate_kernel::source::DescriptorGroup;

/// Descriptors for `key` whose operations are `{"step": v}`.
pub fn group(key: &ResourceKey, versions: &[u64]) -> DescriptorGroup {
    DescriptorGroup::new(
        key.clone(),
        versions
            .iter()
            .map(|v| MigrationDescriptor::new(key.clone(), *v, json!({ "step": v })))
            .collect(),
    )
}

/// Driver that records every call and rejects chosen steps.
#[derive(Default)]
pub struct RecordingDriver {
    calls: Mutex<Vec<(ResourceKey, Value)>>,
    failing_steps: Vec<u64>,
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_at(steps: &[u64]) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::default(),
            failing_steps: steps.to_vec(),
        })
    }

    pub fn calls(&self) -> Vec<(ResourceKey, Value)> {
        self.calls.lock().clone()
    }

    pub fn steps_for(&self, key: &ResourceKey) -> Vec<u64> {
        self.calls
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .filter_map(|(_, op)| op["step"].as_u64())
            .collect()
    }
}

#[async_trait]
impl ResourceDriver for RecordingDriver {
    async fn apply(&self, key: &ResourceKey, operation: &Value) -> Result<(), DriverError> {
        self.calls.lock().push((key.clone(), operation.clone()));
        // Let other keys and other orchestrators interleave.
        tokio::task::yield_now().await;

        match operation["step"].as_u64() {
            Some(step) if self.failing_steps.contains(&step) => {
                Err(DriverError::Rejected(format!("step {step} refused")))
            }
            _ => Ok(()),
        }
    }
}

/// Ledger wrapper that counts commits and can fake lost races.
pub struct FlakyLedger {
    inner: Arc<dyn LedgerBackend>,
    forced_conflicts: AtomicU32,
    commits: AtomicUsize,
}

impl FlakyLedger {
    pub fn new(inner: Arc<dyn LedgerBackend>) -> Arc<Self> {
        Self::conflicting(inner, 0)
    }

    /// The first `conflicts` commits fail with a conflict without writing.
    pub fn conflicting(inner: Arc<dyn LedgerBackend>, conflicts: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            forced_conflicts: AtomicU32::new(conflicts),
            commits: AtomicUsize::new(0),
        })
    }

    /// Commit attempts that reached this ledger, conflicting or not.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerBackend for FlakyLedger {
    fn describe(&self) -> String {
        format!("flaky {}", self.inner.describe())
    }

    async fn history(&self, key: &ResourceKey) -> Result<KeyHistory, LedgerError> {
        self.inner.history(key).await
    }

    async fn commit(
        &self,
        candidate: MigrationRecord,
        expected_previous: Option<&MigrationRecord>,
    ) -> Result<MigrationRecord, LedgerError> {
        self.commits.fetch_add(1, Ordering::SeqCst);

        let forced = self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            let current = expected_previous.map(MigrationRecord::reference);
            return Err(LedgerError::Conflict {
                key: candidate.key.clone(),
                expected: current.clone(),
                actual: current,
            });
        }

        self.inner.commit(candidate, expected_previous).await
    }
}

/// Ledger whose storage is gone.
pub struct DownLedger;

#[async_trait]
impl LedgerBackend for DownLedger {
    fn describe(&self) -> String {
        "down".into()
    }

    async fn history(&self, _key: &ResourceKey) -> Result<KeyHistory, LedgerError> {
        Err(LedgerError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "broker unreachable",
        )))
    }

    async fn commit(
        &self,
        _candidate: MigrationRecord,
        _expected_previous: Option<&MigrationRecord>,
    ) -> Result<MigrationRecord, LedgerError> {
        Err(LedgerError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "broker unreachable",
        )))
    }
}

/// Log whose appends land but never acknowledge, as when the connection to
/// the broker drops right after the write.
pub struct StallingLog {
    pub inner: MemoryLog,
}

#[async_trait]
impl MigrationLog for StallingLog {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn append(&self, entry: &LogEntry) -> Result<LogOffset, LogError> {
        self.inner.append(entry).await?;
        std::future::pending().await
    }

    async fn read_from(
        &self,
        offset: LogOffset,
        max: usize,
    ) -> Result<Vec<(LogOffset, LogEntry)>, LogError> {
        self.inner.read_from(offset, max).await
    }

    async fn end_offset(&self) -> Result<LogOffset, LogError> {
        self.inner.end_offset().await
    }
}
