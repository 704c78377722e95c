// Local file ledger.
//
// One JSON file per resource key under a root directory. Commits re-read
// the file, compare, and replace it with write-temp-then-rename. Correct for
// a single process only; separate processes sharing the directory can race.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{check_expected, validate_candidate, LedgerBackend, LedgerError};
use crate::migration::{MigrationRecord, ResourceKey};
use crate::replay::KeyHistory;

#[derive(Debug, Clone)]
pub struct FileLedger {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileLedger {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<type>/<escaped name>.json`
    pub fn path_for(&self, key: &ResourceKey) -> PathBuf {
        self.root
            .join(key.resource_type.as_str().to_ascii_lowercase())
            .join(format!("{}.json", escape_name(&key.resource_name)))
    }
}

/// Keep topic-safe characters, percent-encode the rest. A leading dot is
/// encoded too so names like `..` stay inside the root.
fn escape_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let safe = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_')
            || (byte == b'.' && i > 0);
        if safe {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{byte:02X}"));
        }
    }
    escaped
}

fn read_records(path: &Path) -> Result<Vec<MigrationRecord>, LedgerError> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

fn write_records(path: &Path, records: &[MigrationRecord]) -> Result<(), LedgerError> {
    let dir = path
        .parent()
        .ok_or_else(|| LedgerError::Task(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, records)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| LedgerError::Io(err.error))?;
    Ok(())
}

impl FileLedger {
    async fn blocking<T, F>(&self, task: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    {
        tokio::task::spawn_blocking(task)
            .await
            .map_err(|err| LedgerError::Task(err.to_string()))?
    }
}

#[async_trait]
impl LedgerBackend for FileLedger {
    fn describe(&self) -> String {
        format!("file ledger at {}", self.root.display())
    }

    async fn history(&self, key: &ResourceKey) -> Result<KeyHistory, LedgerError> {
        let path = self.path_for(key);
        let records = self.blocking(move || read_records(&path)).await?;

        Ok(KeyHistory {
            records,
            truncated: false,
        })
    }

    async fn commit(
        &self,
        candidate: MigrationRecord,
        expected_previous: Option<&MigrationRecord>,
    ) -> Result<MigrationRecord, LedgerError> {
        validate_candidate(&candidate, expected_previous)?;

        let path = self.path_for(&candidate.key);
        let lock = Arc::clone(&self.write_lock);
        let expected = expected_previous.cloned();

        self.blocking(move || {
            let _guard = lock.lock();

            let mut records = read_records(&path)?;
            check_expected(&candidate.key, records.last(), expected.as_ref())?;

            records.push(candidate.clone());
            write_records(&path, &records)?;
            debug!(
                resource = %candidate.key,
                version = %candidate.version,
                path = %path.display(),
                "record committed"
            );

            Ok(candidate)
        })
        .await
    }
}
