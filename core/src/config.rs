//! Gateway configuration.
//!
//! The gateway keeps almost no state of its own: configuration comes from
//! CLI flags and environment variables, and the only directories it touches
//! are the agent CLI's history root (`~/.claude`) and its own resource
//! directory (`~/.agent-gateway`, overridable via `AGENT_GATEWAY_HOME`).

use std::path::PathBuf;
use std::time::Duration;

use crate::error::GatewayErr;
use crate::error::Result;

/// Environment variable overriding the gateway's own resource directory.
/// Never affects the CLI's history path.
pub const GATEWAY_HOME_ENV_VAR: &str = "AGENT_GATEWAY_HOME";

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_REVERSE_CALL_TIMEOUT: Duration = Duration::from_secs(35);

/// One entry in the known-model list used to validate `setModel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    /// Short alias accepted interchangeably with the full id.
    pub alias: &'static str,
}

/// Models the served CLI understands. Advisory in the same way the static
/// permission-mode set is: an operator can extend it with `--allow-model`.
pub const KNOWN_MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "claude-opus-4-1",
        alias: "opus",
    },
    ModelInfo {
        id: "claude-sonnet-4-5",
        alias: "sonnet",
    },
    ModelInfo {
        id: "claude-haiku-4-5",
        alias: "haiku",
    },
];

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

#[derive(Debug, Clone)]
pub struct Config {
    /// Agent CLI executable; resolved through PATH when not absolute.
    pub claude_bin: PathBuf,
    /// Wait between polite and forceful child termination.
    pub grace_period: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub reverse_call_timeout: Duration,
    /// Extra model ids accepted by `setModel` beyond [`KNOWN_MODELS`].
    pub extra_models: Vec<String>,
    /// Root of the CLI's on-disk session history (`~/.claude`).
    pub claude_home: PathBuf,
    /// The gateway's own resource directory.
    pub gateway_home: PathBuf,
}

/// Flag-level overrides collected by the binary.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub claude_bin: Option<PathBuf>,
    pub grace_period: Option<Duration>,
    pub claude_home: Option<PathBuf>,
    pub extra_models: Vec<String>,
}

impl Config {
    pub fn load(overrides: ConfigOverrides) -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| GatewayErr::BadOptions("could not resolve home directory".to_string()))?;

        let gateway_home = match std::env::var_os(GATEWAY_HOME_ENV_VAR) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => home.join(".agent-gateway"),
        };

        let claude_home = overrides
            .claude_home
            .unwrap_or_else(|| home.join(".claude"));

        Ok(Self {
            claude_bin: overrides
                .claude_bin
                .unwrap_or_else(|| PathBuf::from("claude")),
            grace_period: overrides.grace_period.unwrap_or(DEFAULT_GRACE_PERIOD),
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            reverse_call_timeout: DEFAULT_REVERSE_CALL_TIMEOUT,
            extra_models: overrides.extra_models,
            claude_home,
            gateway_home,
        })
    }

    /// Resolve a model name (id or alias) against the known list, returning
    /// the canonical id.
    pub fn resolve_model(&self, name: &str) -> Option<String> {
        if let Some(model) = KNOWN_MODELS
            .iter()
            .find(|m| m.id == name || m.alias == name)
        {
            return Some(model.id.to_string());
        }
        self.extra_models
            .iter()
            .find(|m| m.as_str() == name)
            .cloned()
    }
}
