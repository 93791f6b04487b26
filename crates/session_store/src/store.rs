use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::fs;

use relay_core::session::{SessionEntry, SessionKey};

use crate::error::{Result, StoreError};

/// Session entries with JSON-file persistence. The in-memory map is guarded
/// by one mutex; writes additionally take a per-key async lock so
/// concurrent upserts for the same key serialize while different keys
/// proceed in parallel.
pub struct SessionStore {
    entries_dir: PathBuf,
    transcripts_dir: PathBuf,
    entries: Mutex<HashMap<SessionKey, SessionEntry>>,
    write_locks: DashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        let base = base_path.as_ref().to_path_buf();
        Self {
            entries_dir: base.join("sessions"),
            transcripts_dir: base.join("transcripts"),
            entries: Mutex::new(HashMap::new()),
            write_locks: DashMap::new(),
        }
    }

    /// Create directories and load any persisted entries into the snapshot
    /// map. Unreadable files are skipped with a warning.
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.entries_dir).await?;
        fs::create_dir_all(&self.transcripts_dir).await?;

        let mut dir = fs::read_dir(&self.entries_dir).await?;
        let mut loaded = 0usize;
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(error) => {
                    log::warn!("skipping unreadable session file {:?}: {error}", path);
                    continue;
                }
            };
            match serde_json::from_str::<PersistedEntry>(&content) {
                Ok(record) => {
                    self.entries
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(record.key, record.entry);
                    loaded += 1;
                }
                Err(error) => {
                    log::warn!("skipping malformed session file {:?}: {error}", path);
                }
            }
        }
        if loaded > 0 {
            log::info!("loaded {loaded} session entries from {:?}", self.entries_dir);
        }
        Ok(())
    }

    /// Snapshot read; never observes a half-applied upsert.
    pub fn get(&self, key: &SessionKey) -> Option<SessionEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Read-modify-write under the per-key write lock. The mutator receives
    /// the current entry (if any) and returns the new value, which is
    /// persisted before the lock releases.
    pub async fn upsert<F>(&self, key: &SessionKey, mutate: F) -> Result<SessionEntry>
    where
        F: FnOnce(Option<SessionEntry>) -> SessionEntry,
    {
        let lock = self.write_lock(key);
        let _guard = lock.lock().await;

        let current = self.get(key);
        let next = mutate(current);

        self.persist(key, &next).await?;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), next.clone());
        Ok(next)
    }

    pub async fn delete(&self, key: &SessionKey) -> Result<bool> {
        let lock = self.write_lock(key);
        let _guard = lock.lock().await;

        let removed = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);

        match fs::remove_file(self.entry_path(key)).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(StoreError::Io(error)),
        }
        Ok(removed.is_some())
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn transcripts_dir(&self) -> &Path {
        &self.transcripts_dir
    }

    /// Best-effort transcript removal used by session reset: a missing file
    /// is fine, any other failure is logged and swallowed (I3 requires the
    /// delete attempt, not its success).
    pub async fn remove_transcript(&self, path: &Path) -> bool {
        match fs::remove_file(path).await {
            Ok(()) => true,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => false,
            Err(error) => {
                log::warn!("failed to delete transcript {:?}: {error}", path);
                false
            }
        }
    }

    fn write_lock(&self, key: &SessionKey) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn persist(&self, key: &SessionKey, entry: &SessionEntry) -> Result<()> {
        fs::create_dir_all(&self.entries_dir).await?;
        let record = PersistedEntry {
            key: key.clone(),
            entry: entry.clone(),
        };
        let content = serde_json::to_string_pretty(&record)?;
        fs::write(self.entry_path(key), content).await?;
        Ok(())
    }

    fn entry_path(&self, key: &SessionKey) -> PathBuf {
        let safe: String = key
            .as_str()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.entries_dir.join(format!("{safe}.json"))
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedEntry {
    key: SessionKey,
    entry: SessionEntry,
}
