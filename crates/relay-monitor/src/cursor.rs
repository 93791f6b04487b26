use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

/// Persisted sync progress: the adapter cursor plus the dedup snapshot,
/// written together in one file so they can never disagree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub seen: Vec<String>,
}

pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(data_dir: &Path, channel_id: &str) -> Self {
        Self {
            path: data_dir.join(format!("sync-{channel_id}.json")),
        }
    }

    pub async fn load(&self) -> SyncState {
        match fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                log::warn!("malformed sync state {:?}: {error}", self.path);
                SyncState::default()
            }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => SyncState::default(),
            Err(error) => {
                log::warn!("failed to read sync state {:?}: {error}", self.path);
                SyncState::default()
            }
        }
    }

    pub async fn save(&self, state: &SyncState) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string(state)?;
        fs::write(&self.path, content).await
    }
}
