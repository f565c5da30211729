//! Uuid-inclusive truncation of a session file.

use std::path::Path;

use serde_json::Value;
use tracing::info;

use crate::error::GatewayErr;
use crate::error::Result;

/// Rewrite `path` so the line whose record carries `message_uuid` and all
/// later lines are gone. Returns the number of remaining lines.
///
/// The new content lands in a temp file in the same directory first and is
/// moved over the original with `rename`, so a crash mid-write never leaves
/// a half-truncated file. No backup is retained.
pub(crate) async fn truncate_file(path: &Path, message_uuid: &str) -> Result<usize> {
    let content = tokio::fs::read_to_string(path).await?;
    let lines: Vec<&str> = content.lines().collect();

    let cut = lines
        .iter()
        .position(|line| {
            serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|value| {
                    value
                        .get("uuid")
                        .and_then(Value::as_str)
                        .map(|uuid| uuid == message_uuid)
                })
                .unwrap_or(false)
        })
        .ok_or_else(|| GatewayErr::HistoryUuidNotFound(message_uuid.to_string()))?;

    let mut truncated = lines[..cut].join("\n");
    if !truncated.is_empty() {
        truncated.push('\n');
    }

    let tmp = path.with_extension("jsonl.tmp");
    tokio::fs::write(&tmp, truncated.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await?;

    info!(
        file = %path.display(),
        removed = lines.len() - cut,
        remaining = cut,
        "truncated session history"
    );
    Ok(cut)
}
