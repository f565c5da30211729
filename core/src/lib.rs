//! Server-side core of the agent session gateway: child-process
//! supervision, stdout parsing, per-session state and streaming, reverse
//! calls to the client, and on-disk history access.
//!
//! The [`orchestrator::Orchestrator`] is the single entry point; transports
//! construct one, hand it a [`reverse::ClientChannel`] per client, and call
//! its method surface. There are no global singletons.

pub mod config;
pub mod error;
pub mod history;
pub mod orchestrator;
pub mod parser;
pub mod permissions;
pub mod process;
pub mod reverse;
pub mod session;
pub mod spawn;

pub use config::Config;
pub use config::ConfigOverrides;
pub use error::GatewayErr;
pub use error::Result;
pub use orchestrator::Orchestrator;
pub use orchestrator::default_capabilities;
pub use reverse::ClientChannel;
pub use session::SessionState;
pub use session::Subscriber;
