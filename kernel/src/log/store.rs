// Migration Log Storage Abstraction
//
// Defines the contract the distributed ledger needs from its log.
// A Kafka topic, a local segment file or an in-memory list can all
// satisfy it.

use async_trait::async_trait;

use super::{LogEntry, LogError, LogOffset};

/// Append-only storage for migration log entries.
///
/// Properties required from implementations:
/// - Single total order (one partition)
/// - Offsets strictly increase in append order
/// - Durable before `append` returns
///
/// Implementations MAY:
/// - Compact by key, dropping superseded entries but never renumbering
///   the ones they keep
///
/// Implementations MUST NOT:
/// - Reorder entries
/// - Mutate entries they keep
#[async_trait]
pub trait MigrationLog: Send + Sync {
    /// Well-known name of the log, shared by all cooperating processes.
    fn name(&self) -> &str;

    /// Append an entry and return the offset the log assigned to it.
    async fn append(&self, entry: &LogEntry) -> Result<LogOffset, LogError>;

    /// Read at most `max` retained entries at or after `offset`.
    async fn read_from(
        &self,
        offset: LogOffset,
        max: usize,
    ) -> Result<Vec<(LogOffset, LogEntry)>, LogError>;

    /// The offset the next append will receive.
    async fn end_offset(&self) -> Result<LogOffset, LogError>;
}
