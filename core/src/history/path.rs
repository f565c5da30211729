//! Canonical on-disk names for project history directories.
//!
//! The agent CLI stores one directory per project under
//! `<home>/.claude/projects/`, named by a lossy encoding of the absolute
//! project path. The encoding is one-way: the gateway only ever produces
//! directory names from paths, never paths from directory names.

use std::path::Path;
use std::path::PathBuf;

/// Subdirectory of the CLI home holding per-project history directories.
pub const PROJECTS_SUBDIR: &str = "projects";

/// Encode an absolute project path into its history directory name.
///
/// Rules, in order:
/// 1. A Windows drive-letter colon is dropped: `C:` becomes `C-`.
/// 2. Every `/`, `\`, `.` and `_` becomes `-`.
/// 3. A trailing `-` is trimmed.
///
/// The encoding is idempotent: the output contains none of the replaced
/// characters and cannot re-trigger the drive-letter rule.
pub fn encode_project_path(path: &str) -> String {
    let mut encoded = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();

    if let Some(&first) = chars.peek() {
        if first.is_ascii_alphabetic() {
            let mut lookahead = chars.clone();
            lookahead.next();
            if lookahead.peek() == Some(&':') {
                encoded.push(first);
                encoded.push('-');
                chars.next();
                chars.next();
            }
        }
    }

    for ch in chars {
        match ch {
            '/' | '\\' | '.' | '_' => encoded.push('-'),
            other => encoded.push(other),
        }
    }

    while encoded.ends_with('-') && encoded.len() > 1 {
        encoded.pop();
    }
    encoded
}

/// Directory holding a project's session files.
pub fn project_history_dir(claude_home: &Path, project_path: &Path) -> PathBuf {
    claude_home
        .join(PROJECTS_SUBDIR)
        .join(encode_project_path(&project_path.to_string_lossy()))
}

/// Path of one session's history file.
pub fn session_file(claude_home: &Path, project_path: &Path, session_id: &str) -> PathBuf {
    project_history_dir(claude_home, project_path).join(format!("{session_id}.jsonl"))
}
