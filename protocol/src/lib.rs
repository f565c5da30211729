//! Wire-level types shared between the gateway and its UI clients.
//!
//! Three layers live here, all free of I/O:
//! * [`event`]: the tagged stream events produced by parsing agent CLI
//!   stdout, delivered to subscribers during a turn.
//! * [`rpc`]: typed params/response pairs for every RPC method, plus the
//!   reverse-call payloads the gateway sends to clients.
//! * [`frame`]: the binary frame codec used on the transport.

pub mod event;
pub mod frame;
pub mod rpc;

pub use event::StreamEvent;
pub use event::StreamEventMsg;
pub use frame::Frame;
pub use frame::FrameError;
pub use rpc::CallId;
pub use rpc::ClientRequest;
pub use rpc::HandlerKind;
pub use rpc::ResponseEnvelope;
pub use rpc::RpcError;
pub use rpc::ServerNotification;
pub use rpc::ServerRequest;
