//! WebSocket-facing half of the agent session gateway: transport, frame
//! routing, and the per-connection message processor. All session and
//! child-process logic lives in `gateway-core`; this crate moves frames.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use gateway_core::Config;
use gateway_core::Orchestrator;

pub mod message_processor;
pub mod outgoing_message;
pub mod transport;

pub use transport::WS_PATH;
pub use transport::router;

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Bind and serve until SIGINT. The orchestrator is constructed here and
/// handed to every connection; there is no global state.
pub async fn run_main(listen: SocketAddr, config: Config) -> Result<(), ServeError> {
    let orchestrator = Arc::new(Orchestrator::new(config));
    let app = router(orchestrator);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|source| ServeError::Bind {
            addr: listen,
            source,
        })?;
    info!("listening on ws://{}{}", listener.local_addr()?, WS_PATH);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}
