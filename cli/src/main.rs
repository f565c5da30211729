//! `agent-gateway` binary.
//!
//! Exit codes: 0 on clean shutdown, 1 when the listen address cannot be
//! bound, 2 on configuration errors.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use clap::Subcommand;
use tracing::error;
use tracing_subscriber::EnvFilter;

use gateway_core::Config;
use gateway_core::ConfigOverrides;
use gateway_server::ServeError;

/// Environment variable controlling the log filter.
const LOG_ENV_VAR: &str = "AGENT_GATEWAY_LOG";

const EXIT_BIND_FAILURE: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "agent-gateway", about = "Session gateway for agent CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the WebSocket gateway.
    Serve(ServeArgs),
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Address to listen on, e.g. 127.0.0.1:7701.
    #[arg(long)]
    listen: String,

    /// Path to the agent CLI executable (defaults to `claude` on PATH).
    #[arg(long)]
    claude: Option<PathBuf>,

    /// Grace period in milliseconds between polite and forceful child
    /// termination.
    #[arg(long)]
    grace_ms: Option<u64>,

    /// Extra model ids to accept beyond the built-in list. Repeatable.
    #[arg(long = "allow-model")]
    allow_models: Vec<String>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> ExitCode {
    let listen: SocketAddr = match args.listen.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!("invalid --listen address {:?}: {err}", args.listen);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let overrides = ConfigOverrides {
        claude_bin: args.claude,
        grace_period: args.grace_ms.map(Duration::from_millis),
        claude_home: None,
        extra_models: args.allow_models,
    };
    let config = match Config::load(overrides) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match gateway_server::run_main(listen, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ ServeError::Bind { .. }) => {
            error!("{err}");
            ExitCode::from(EXIT_BIND_FAILURE)
        }
        Err(err) => {
            error!("server error: {err}");
            ExitCode::from(EXIT_BIND_FAILURE)
        }
    }
}
