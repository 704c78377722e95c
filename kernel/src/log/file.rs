// File-backed migration log.
//
// One newline-delimited JSON segment per log. Appends are single
// `O_APPEND` writes followed by `sync_data`, so writers on the same host
// interleave whole entries. The offset of an entry is its line number.
// A trailing line without a newline is what a crash mid-append leaves
// behind: readers skip it and the next append cuts it off.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use super::{LogEntry, LogError, LogOffset, MigrationLog};

/// Byte position of each complete line seen so far.
#[derive(Debug, Default)]
struct LineIndex {
    starts: Vec<u64>,
    scanned: u64,
}

impl LineIndex {
    /// Index lines appended since the last scan. A trailing line without a
    /// newline is an append still in flight (or torn by a crash) and is left
    /// for the next scan.
    fn refresh(&mut self, path: &Path) -> Result<(), LogError> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(self.scanned))?;

        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            self.starts.push(self.scanned);
            self.scanned += read as u64;
        }

        Ok(())
    }

    /// Cut off a partial trailing line so the next append starts on a line
    /// boundary. Call after `refresh`.
    fn truncate_torn_tail(&self, path: &Path) -> Result<(), LogError> {
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let len = file.metadata()?.len();
        if len > self.scanned {
            warn!(
                path = %path.display(),
                torn_bytes = len - self.scanned,
                "dropping partial entry left by an interrupted append"
            );
            file.set_len(self.scanned)?;
            file.sync_data()?;
        }

        Ok(())
    }

    fn read(
        &self,
        path: &Path,
        offset: LogOffset,
        max: usize,
    ) -> Result<Vec<(LogOffset, LogEntry)>, LogError> {
        let Some(&start) = usize::try_from(offset).ok().and_then(|i| self.starts.get(i)) else {
            return Ok(Vec::new());
        };

        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start))?;
        let reader = BufReader::new(file);

        let available = self.starts.len() - offset as usize;
        let mut entries = Vec::with_capacity(max.min(available));
        for (i, line) in reader.lines().take(max.min(available)).enumerate() {
            let current = offset + i as u64;
            let line = line?;
            let entry = serde_json::from_str(&line).map_err(|err| LogError::Corrupt {
                offset: current,
                reason: err.to_string(),
            })?;
            entries.push((current, entry));
        }

        Ok(entries)
    }
}

/// Migration log stored in `<dir>/<name>.log`.
///
/// Suitable for a single host. Compaction is not supported, so replay cost
/// grows with total history.
#[derive(Debug, Clone)]
pub struct FileLog {
    name: String,
    path: PathBuf,
    index: Arc<Mutex<LineIndex>>,
}

impl FileLog {
    pub fn open(dir: impl AsRef<Path>, name: impl Into<String>) -> Result<Self, LogError> {
        let name = name.into();
        fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(format!("{name}.log"));

        Ok(Self {
            name,
            path,
            index: Arc::new(Mutex::new(LineIndex::default())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, task: F) -> Result<T, LogError>
    where
        T: Send + 'static,
        F: FnOnce(&Path, &mut LineIndex) -> Result<T, LogError> + Send + 'static,
    {
        let path = self.path.clone();
        let index = Arc::clone(&self.index);

        tokio::task::spawn_blocking(move || {
            let mut index = index.lock();
            task(&path, &mut index)
        })
        .await
        .map_err(|err| LogError::Task(err.to_string()))?
    }
}

#[async_trait]
impl MigrationLog for FileLog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, entry: &LogEntry) -> Result<LogOffset, LogError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let id = entry.id;

        self.blocking(move |path, index| {
            index.refresh(path)?;
            index.truncate_torn_tail(path)?;
            let before = index.starts.len() as LogOffset;

            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(&line)?;
            file.sync_data()?;

            // Other writers may have landed between our refresh and our
            // write; find where ours ended up.
            index.refresh(path)?;
            let mut offset = before;
            loop {
                let batch = index.read(path, offset, 256)?;
                if batch.is_empty() {
                    return Err(LogError::Unacknowledged(id));
                }
                if let Some((found, _)) = batch.iter().find(|(_, e)| e.id == id) {
                    return Ok(*found);
                }
                offset += batch.len() as LogOffset;
            }
        })
        .await
    }

    async fn read_from(
        &self,
        offset: LogOffset,
        max: usize,
    ) -> Result<Vec<(LogOffset, LogEntry)>, LogError> {
        self.blocking(move |path, index| {
            index.refresh(path)?;
            index.read(path, offset, max)
        })
        .await
    }

    async fn end_offset(&self) -> Result<LogOffset, LogError> {
        self.blocking(|path, index| {
            index.refresh(path)?;
            Ok(index.starts.len() as LogOffset)
        })
        .await
    }
}
