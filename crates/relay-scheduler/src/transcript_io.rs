use std::path::Path;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use relay_core::message::Message;

/// Load a transcript from its JSONL file. Missing files mean an empty
/// transcript; malformed lines are skipped.
pub async fn read_transcript(path: &Path) -> Vec<Message> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(error) => {
            log::warn!("failed to read transcript {:?}: {error}", path);
            return Vec::new();
        }
    };

    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

pub async fn write_transcript(path: &Path, messages: &[Message]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::File::create(path).await?;
    for message in messages {
        let line = serde_json::to_string(message)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    file.flush().await
}
