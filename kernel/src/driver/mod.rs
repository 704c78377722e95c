// Resource Drivers
//
// A driver performs the actual create/alter against the cluster. The
// orchestrator hands it an opaque operation payload and only looks at
// whether it succeeded.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::migration::ResourceKey;

mod command;

pub use command::CommandDriver;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver rejected the operation: {0}")]
    Rejected(String),

    #[error("driver timed out after {0:?}")]
    Timeout(Duration),

    #[error("driver i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ResourceDriver: Send + Sync {
    async fn apply(&self, key: &ResourceKey, operation: &Value) -> Result<(), DriverError>;
}
