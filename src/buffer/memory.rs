//! In-memory buffer store with an optional directory tier

use super::BufferStore;
use crate::checksum::Checksum;
use crate::error::{CommuneError, CommuneResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tracing::debug;

#[derive(Default)]
struct Entry {
    buffer: Option<Vec<u8>>,
    owners: HashMap<String, usize>,
    persistent: bool,
}

impl Entry {
    fn refcount(&self) -> usize {
        self.owners.values().sum()
    }
}

/// Buffer store keeping buffers in memory while referenced
///
/// With a directory configured, every stored buffer is also written to
/// `<dir>/<hex>` and read back from there when it is not in memory.
pub struct MemoryBufferStore {
    entries: Mutex<HashMap<Checksum, Entry>>,
    dir: Option<PathBuf>,
}

impl MemoryBufferStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dir: None,
        }
    }

    pub fn with_dir(dir: PathBuf) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dir: Some(dir),
        }
    }

    fn file_path(dir: &Path, checksum: &Checksum) -> PathBuf {
        dir.join(checksum.to_hex())
    }

    fn memory_get(&self, checksum: &Checksum) -> Option<Vec<u8>> {
        let entries = self.entries.lock().ok()?;
        entries.get(checksum).and_then(|e| e.buffer.clone())
    }

    /// Number of references currently held on a checksum
    pub fn refcount(&self, checksum: &Checksum) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.get(checksum).map(Entry::refcount).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl Default for MemoryBufferStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BufferStore for MemoryBufferStore {
    async fn get(&self, checksum: &Checksum) -> CommuneResult<Option<Vec<u8>>> {
        if let Some(buffer) = self.memory_get(checksum) {
            return Ok(Some(buffer));
        }

        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let path = Self::file_path(dir, checksum);
        match fs::read(&path).await {
            Ok(buffer) => {
                debug!("Loaded buffer {} from {}", checksum.short(), path.display());
                Ok(Some(buffer))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CommuneError::io(format!("reading {}", path.display()), e)),
        }
    }

    async fn put(&self, checksum: Checksum, buffer: Vec<u8>) -> CommuneResult<()> {
        if let Some(dir) = &self.dir {
            let path = Self::file_path(dir, &checksum);
            if !path.exists() {
                fs::create_dir_all(dir)
                    .await
                    .map_err(|e| CommuneError::io(format!("creating {}", dir.display()), e))?;
                fs::write(&path, &buffer)
                    .await
                    .map_err(|e| CommuneError::io(format!("writing {}", path.display()), e))?;
            }
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CommuneError::Internal("buffer store lock poisoned".to_string()))?;
        entries.entry(checksum).or_default().buffer = Some(buffer);
        Ok(())
    }

    async fn contains(&self, checksum: &Checksum) -> bool {
        if self.memory_get(checksum).is_some() {
            return true;
        }
        match &self.dir {
            Some(dir) => fs::metadata(Self::file_path(dir, checksum)).await.is_ok(),
            None => false,
        }
    }

    async fn length(&self, checksum: &Checksum) -> Option<usize> {
        if let Some(buffer) = self.memory_get(checksum) {
            return Some(buffer.len());
        }
        let dir = self.dir.as_ref()?;
        let meta = fs::metadata(Self::file_path(dir, checksum)).await.ok()?;
        usize::try_from(meta.len()).ok()
    }

    fn incref(&self, checksum: Checksum, owner: &str, persistent: bool) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let entry = entries.entry(checksum).or_default();
        *entry.owners.entry(owner.to_string()).or_insert(0) += 1;
        entry.persistent |= persistent;
    }

    fn decref(&self, checksum: &Checksum, owner: &str) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let Some(entry) = entries.get_mut(checksum) else {
            return;
        };
        if let Some(count) = entry.owners.get_mut(owner) {
            *count -= 1;
            if *count == 0 {
                entry.owners.remove(owner);
            }
        }
        if entry.owners.is_empty() && !entry.persistent {
            debug!("Evicting buffer {}", checksum.short());
            entries.remove(checksum);
        }
    }
}
