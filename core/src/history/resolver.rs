//! Locates and reads the CLI's newline-delimited session files.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use gateway_protocol::rpc::HistoryMetadataResponse;
use gateway_protocol::rpc::HistorySessionSummary;
use gateway_protocol::rpc::HistorySessionsResponse;
use gateway_protocol::rpc::LoadHistoryParams;
use gateway_protocol::rpc::LoadHistoryResponse;
use gateway_protocol::rpc::TruncateHistoryResponse;

use super::path::project_history_dir;
use super::path::session_file;
use super::truncate::truncate_file;
use crate::error::GatewayErr;
use crate::error::Result;

/// First-user-message preview length, in characters.
const FIRST_MESSAGE_PREVIEW_CHARS: usize = 200;

struct CacheEntry {
    last_size: u64,
    last_mtime: SystemTime,
    lines: Vec<String>,
}

/// Reads session files with a small per-file cache. A shrinking file is a
/// compaction: the cached tail is discarded and the caller is told.
pub struct HistoryResolver {
    claude_home: PathBuf,
    cache: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl HistoryResolver {
    pub fn new(claude_home: PathBuf) -> Self {
        Self {
            claude_home,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn claude_home(&self) -> &Path {
        &self.claude_home
    }

    /// Discover sessions for a project, newest first.
    pub async fn list_sessions(
        &self,
        project_path: &Path,
        max_results: usize,
        offset: usize,
    ) -> Result<HistorySessionsResponse> {
        let dir = project_history_dir(&self.claude_home, project_path);
        let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
        match tokio::fs::read_dir(&dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                        continue;
                    }
                    let mtime = entry
                        .metadata()
                        .await?
                        .modified()
                        .unwrap_or(UNIX_EPOCH);
                    found.push((mtime, path));
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HistorySessionsResponse {
                    sessions: Vec::new(),
                    total: 0,
                });
            }
            Err(err) => return Err(err.into()),
        }

        found.sort_by(|a, b| b.0.cmp(&a.0));
        let total = found.len();

        let mut sessions = Vec::new();
        for (mtime, path) in found.into_iter().skip(offset).take(max_results) {
            let session_id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let (lines, _) = self.read_lines(&path).await?;
            sessions.push(HistorySessionSummary {
                session_id,
                project_path: project_path.to_path_buf(),
                first_user_message: first_user_message(&lines),
                message_count: lines.len(),
                timestamp_ms: system_time_ms(mtime),
                custom_title: custom_title(&lines),
            });
        }

        Ok(HistorySessionsResponse { sessions, total })
    }

    /// Read a window of records, following leaf-uuid links across files.
    pub async fn load(&self, params: &LoadHistoryParams) -> Result<LoadHistoryResponse> {
        let primary = self
            .resolve_file(params.session_id.as_deref(), params.project_path.as_deref())
            .await?;
        let (lines, compacted) = self.read_lines(&primary).await?;

        let mut records = parse_records(&lines);
        let mut pending_leaves: HashSet<String> = collect_leaf_uuids(&records);
        // Links resolving inside the primary file need no expansion.
        for record in &records {
            if let Some(uuid) = record.value.get("uuid").and_then(Value::as_str) {
                pending_leaves.remove(uuid);
            }
        }

        // Follow links into sibling files, breadth-first, each file at most
        // once. A cycle of leaf uuids terminates on the visited set.
        let mut visited: HashSet<PathBuf> = HashSet::from([primary.clone()]);
        let siblings = self.sibling_files(&primary).await?;
        let mut queue: VecDeque<PathBuf> = siblings.into_iter().collect();
        let mut unmatched: Vec<PathBuf> = Vec::new();

        while !pending_leaves.is_empty() {
            let Some(candidate) = queue.pop_front() else {
                break;
            };
            if !visited.insert(candidate.clone()) {
                continue;
            }
            let (candidate_lines, _) = self.read_lines(&candidate).await?;
            let candidate_records = parse_records(&candidate_lines);
            let has_link = candidate_records.iter().any(|record| {
                record
                    .value
                    .get("uuid")
                    .and_then(Value::as_str)
                    .is_some_and(|uuid| pending_leaves.contains(uuid))
            });
            if has_link {
                debug!(file = %candidate.display(), "following leaf-uuid link");
                pending_leaves.extend(collect_leaf_uuids(&candidate_records));
                for record in &candidate_records {
                    if let Some(uuid) = record.value.get("uuid").and_then(Value::as_str) {
                        pending_leaves.remove(uuid);
                    }
                }
                records.extend(candidate_records);
                // Unmatched siblings get another look: the new leaves may
                // resolve into them.
                queue.extend(unmatched.drain(..));
                for path in queue.iter() {
                    visited.remove(path);
                }
            } else {
                unmatched.push(candidate);
            }
        }

        // Merge into emission order: stable sort on record timestamps, so
        // same-stamp records keep their file order.
        records.sort_by_key(|record| record.sort_key);

        let available_count = records.len();
        let messages: Vec<Value> = records
            .into_iter()
            .skip(params.offset)
            .take(params.limit)
            .map(|record| record.value)
            .collect();

        Ok(LoadHistoryResponse {
            count: messages.len(),
            messages,
            available_count,
            compacted,
        })
    }

    pub async fn metadata(
        &self,
        session_id: &str,
        project_path: &Path,
    ) -> Result<HistoryMetadataResponse> {
        let path = session_file(&self.claude_home, project_path, session_id);
        if !tokio::fs::try_exists(&path).await? {
            return Err(GatewayErr::HistoryFileNotFound(session_id.to_string()));
        }
        let (lines, _) = self.read_lines(&path).await?;
        Ok(HistoryMetadataResponse {
            total_lines: lines.len(),
            session_id: session_id.to_string(),
            project_path: project_path.to_path_buf(),
            custom_title: custom_title(&lines),
        })
    }

    /// Remove the record carrying `message_uuid` and every later line.
    /// Atomic via write-to-temp + rename; no backup is kept.
    pub async fn truncate(
        &self,
        session_id: &str,
        project_path: &Path,
        message_uuid: &str,
    ) -> Result<TruncateHistoryResponse> {
        let path = session_file(&self.claude_home, project_path, session_id);
        if !tokio::fs::try_exists(&path).await? {
            return Err(GatewayErr::HistoryFileNotFound(session_id.to_string()));
        }
        let remaining_lines = truncate_file(&path, message_uuid).await?;
        self.invalidate(&path);
        Ok(TruncateHistoryResponse {
            success: true,
            remaining_lines,
        })
    }

    async fn resolve_file(
        &self,
        session_id: Option<&str>,
        project_path: Option<&Path>,
    ) -> Result<PathBuf> {
        match (session_id, project_path) {
            (Some(id), Some(project)) => {
                let path = session_file(&self.claude_home, project, id);
                if tokio::fs::try_exists(&path).await? {
                    Ok(path)
                } else {
                    Err(GatewayErr::HistoryFileNotFound(id.to_string()))
                }
            }
            (Some(id), None) => self.find_session_anywhere(id).await,
            (None, Some(project)) => self.newest_session_in(project).await,
            (None, None) => Err(GatewayErr::BadOptions(
                "loadHistory needs a sessionId or a projectPath".to_string(),
            )),
        }
    }

    async fn find_session_anywhere(&self, session_id: &str) -> Result<PathBuf> {
        let projects = self.claude_home.join(super::path::PROJECTS_SUBDIR);
        let wanted = format!("{session_id}.jsonl");
        let mut dirs = match tokio::fs::read_dir(&projects).await {
            Ok(dirs) => dirs,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(GatewayErr::HistoryFileNotFound(session_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = dirs.next_entry().await? {
            let candidate = entry.path().join(&wanted);
            if tokio::fs::try_exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(GatewayErr::HistoryFileNotFound(session_id.to_string()))
    }

    async fn newest_session_in(&self, project_path: &Path) -> Result<PathBuf> {
        let dir = project_history_dir(&self.claude_home, project_path);
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(GatewayErr::HistoryFileNotFound(
                    project_path.display().to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let mtime = entry.metadata().await?.modified().unwrap_or(UNIX_EPOCH);
            if newest.as_ref().is_none_or(|(best, _)| mtime > *best) {
                newest = Some((mtime, path));
            }
        }
        newest.map(|(_, path)| path).ok_or_else(|| {
            GatewayErr::HistoryFileNotFound(project_path.display().to_string())
        })
    }

    async fn sibling_files(&self, primary: &Path) -> Result<Vec<PathBuf>> {
        let Some(dir) = primary.parent() else {
            return Ok(Vec::new());
        };
        let mut siblings = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path != primary && path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                siblings.push(path);
            }
        }
        Ok(siblings)
    }

    /// Read a file through the cache. Returns the lines plus whether a
    /// compaction was detected since the previous read of this file.
    async fn read_lines(&self, path: &Path) -> Result<(Vec<String>, bool)> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| GatewayErr::HistoryFileNotFound(path.display().to_string()))?;
        let size = metadata.len();
        let mtime = metadata.modified().unwrap_or(UNIX_EPOCH);

        let mut compacted = false;
        {
            let cache = self.cache.lock().map_err(poisoned)?;
            if let Some(entry) = cache.get(path) {
                if size < entry.last_size {
                    compacted = true;
                } else if entry.last_size == size && entry.last_mtime == mtime {
                    return Ok((entry.lines.clone(), false));
                }
            }
        }

        let content = tokio::fs::read_to_string(path).await?;
        let lines: Vec<String> = content.lines().map(str::to_string).collect();

        let mut cache = self.cache.lock().map_err(poisoned)?;
        cache.insert(
            path.to_path_buf(),
            CacheEntry {
                last_size: size,
                last_mtime: mtime,
                lines: lines.clone(),
            },
        );
        Ok((lines, compacted))
    }

    fn invalidate(&self, path: &Path) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(path);
        }
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> GatewayErr {
    GatewayErr::Internal("history cache lock poisoned".to_string())
}

struct HistoryRecord {
    value: Value,
    sort_key: i64,
}

/// Parse lines into records, dropping noise. The sort key is the record's
/// ISO-8601 timestamp in milliseconds; records without one inherit the
/// previous record's stamp so a stable sort preserves file order.
fn parse_records(lines: &[String]) -> Vec<HistoryRecord> {
    let mut records = Vec::with_capacity(lines.len());
    let mut last_stamp = 0i64;
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        if let Some(stamp) = value
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_rfc3339_ms)
        {
            last_stamp = stamp;
        }
        records.push(HistoryRecord {
            value,
            sort_key: last_stamp,
        });
    }
    records
}

fn parse_rfc3339_ms(raw: &str) -> Option<i64> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .ok()
        .map(|ts| (ts.unix_timestamp_nanos() / 1_000_000) as i64)
}

fn collect_leaf_uuids(records: &[HistoryRecord]) -> HashSet<String> {
    records
        .iter()
        .filter_map(|record| {
            record
                .value
                .get("leafUuid")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

fn first_user_message(lines: &[String]) -> Option<String> {
    for line in lines {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value.get("type").and_then(Value::as_str) != Some("user") {
            continue;
        }
        let text = match value.get("message").and_then(|m| m.get("content")) {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" "),
            _ => continue,
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        return Some(trimmed.chars().take(FIRST_MESSAGE_PREVIEW_CHARS).collect());
    }
    None
}

fn custom_title(lines: &[String]) -> Option<String> {
    lines.iter().find_map(|line| {
        let value = serde_json::from_str::<Value>(line).ok()?;
        if value.get("type").and_then(Value::as_str) == Some("summary") {
            value
                .get("summary")
                .and_then(Value::as_str)
                .map(str::to_string)
        } else {
            None
        }
    })
}

fn system_time_ms(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
