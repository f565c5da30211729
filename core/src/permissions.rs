//! Persists permission rules granted through `RequestPermission` replies.
//!
//! File-backed scopes map onto the CLI's own settings layout so rules take
//! effect on the next spawned child:
//! * `userSettings`    → `<claude-home>/settings.json`
//! * `projectSettings` → `<project>/.claude/settings.json`
//! * `localSettings`   → `<project>/.claude/settings.local.json`
//!
//! The `session` scope stays in memory on the session config and dies with
//! the session. Writes are merge-append: existing rules survive, duplicates
//! are dropped, and the file is replaced atomically.

use std::path::Path;
use std::path::PathBuf;

use serde_json::Value;
use serde_json::json;
use tracing::info;

use gateway_protocol::rpc::PermissionScope;
use gateway_protocol::rpc::PermissionUpdate;

use crate::error::GatewayErr;
use crate::error::Result;

pub fn settings_path(
    scope: PermissionScope,
    claude_home: &Path,
    project_path: &Path,
) -> Option<PathBuf> {
    match scope {
        PermissionScope::UserSettings => Some(claude_home.join("settings.json")),
        PermissionScope::ProjectSettings => {
            Some(project_path.join(".claude").join("settings.json"))
        }
        PermissionScope::LocalSettings => {
            Some(project_path.join(".claude").join("settings.local.json"))
        }
        PermissionScope::Session => None,
    }
}

/// Apply one file-backed update. `Session`-scoped updates are the caller's
/// responsibility and are rejected here.
pub async fn persist_update(
    update: &PermissionUpdate,
    claude_home: &Path,
    project_path: &Path,
) -> Result<()> {
    let Some(path) = settings_path(update.scope, claude_home, project_path) else {
        return Err(GatewayErr::BadOptions(
            "session-scoped updates are not persisted to disk".to_string(),
        ));
    };

    let mut settings = match tokio::fs::read_to_string(&path).await {
        Ok(content) => serde_json::from_str::<Value>(&content)
            .map_err(|err| GatewayErr::BadOptions(format!("settings file is not JSON: {err}")))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => json!({}),
        Err(err) => return Err(err.into()),
    };

    merge_rules(&mut settings, "allow", &update.allow);
    merge_rules(&mut settings, "deny", &update.deny);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    let rendered = serde_json::to_string_pretty(&settings)?;
    tokio::fs::write(&tmp, rendered.as_bytes()).await?;
    tokio::fs::rename(&tmp, &path).await?;

    info!(
        scope = %update.scope,
        file = %path.display(),
        allow = update.allow.len(),
        deny = update.deny.len(),
        "persisted permission rules"
    );
    Ok(())
}

fn merge_rules(settings: &mut Value, list: &str, rules: &[String]) {
    if rules.is_empty() {
        return;
    }
    let permissions = settings
        .as_object_mut()
        .map(|root| root.entry("permissions").or_insert_with(|| json!({})));
    let Some(Value::Object(permissions)) = permissions else {
        return;
    };
    let entries = permissions
        .entry(list)
        .or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(entries) = entries else {
        return;
    };
    for rule in rules {
        if !entries.iter().any(|existing| existing == rule) {
            entries.push(Value::String(rule.clone()));
        }
    }
}
