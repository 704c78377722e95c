// Kmigrate Kernel
//
// Migration ledger and apply engine for Kafka resources: topics, ACLs and
// schemas move forward one versioned descriptor at a time, and every step
// is recorded exactly once.

pub mod apply;
pub mod config;
pub mod driver;
pub mod ledger;
pub mod log;
pub mod migration;
pub mod plan;
pub mod replay;
pub mod source;
pub mod state;
