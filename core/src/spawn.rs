//! Builds and launches one agent CLI child per turn.
//!
//! The CLI only starts producing output once it sees a non-interactive
//! stdin reach EOF, so the child's stdin pipe is dropped immediately after
//! spawn. That invariant lives here and nowhere else.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Child;
use tokio::process::Command;

use gateway_protocol::rpc::PermissionMode;

use crate::error::GatewayErr;
use crate::error::Result;

/// Marker passed to the CLI so its telemetry can distinguish gateway
/// sessions from interactive ones.
pub const CLI_ENTRYPOINT: &str = "sdk-agent-gateway";

/// Everything needed to launch one turn.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub cwd: PathBuf,
    pub message: String,
    pub model: String,
    pub permission_mode: PermissionMode,
    pub skip_permissions: bool,
    pub max_thinking_tokens: Option<u64>,
    pub system_prompt: Option<String>,
    pub include_partial_messages: bool,
    /// CLI session to resume; set once the session id is bound.
    pub resume_session_id: Option<String>,
    pub extra_env: HashMap<String, String>,
}

/// Argv after the program name. Split out for testability: the exact flag
/// set is part of the child-process contract.
pub fn build_turn_args(spec: &SpawnSpec) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--model".to_string(),
        spec.model.clone(),
        "--permission-mode".to_string(),
        spec.permission_mode.to_string(),
    ];
    if spec.skip_permissions {
        args.push("--dangerously-skip-permissions".to_string());
    }
    if spec.include_partial_messages {
        args.push("--include-partial-messages".to_string());
    }
    if let Some(tokens) = spec.max_thinking_tokens {
        if tokens > 0 {
            args.push("--max-thinking-tokens".to_string());
            args.push(tokens.to_string());
        }
    }
    if let Some(prompt) = &spec.system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.clone());
    }
    if let Some(session_id) = &spec.resume_session_id {
        args.push("--resume".to_string());
        args.push(session_id.clone());
    }
    args.push(spec.message.clone());
    args
}

/// Spawn the child with all three stdio streams piped, then close stdin.
///
/// The child is detached from the controlling terminal (its own process
/// group on unix), started in the project directory, and sees a locked-down
/// terminal environment: `TERM=dumb`, color disabled, UTF-8 locale. PATH is
/// inherited from the gateway process.
pub async fn spawn_agent_child(spec: &SpawnSpec) -> Result<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(build_turn_args(spec))
        .current_dir(&spec.cwd)
        .env("TERM", "dumb")
        .env("FORCE_COLOR", "0")
        .env("NO_COLOR", "1")
        .env("LANG", "en_US.UTF-8")
        .env("LC_ALL", "en_US.UTF-8")
        .env("CLAUDE_CODE_ENTRYPOINT", CLI_ENTRYPOINT)
        .envs(&spec.extra_env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            // New session: no controlling terminal, and the whole child tree
            // shares one process group for termination.
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|err| spawn_error(&spec.program, err))?;

    // The CLI blocks until stdin reaches EOF; drop the pipe right away.
    drop(child.stdin.take());

    Ok(child)
}

fn spawn_error(program: &Path, err: io::Error) -> GatewayErr {
    match err.kind() {
        io::ErrorKind::NotFound => GatewayErr::CliNotFound(program.display().to_string()),
        io::ErrorKind::PermissionDenied => {
            GatewayErr::CliSpawnFailed(format!("{}: permission denied", program.display()))
        }
        _ => GatewayErr::CliSpawnFailed(format!("{}: {err}", program.display())),
    }
}
