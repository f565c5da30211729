//! Binary frame codec for the transport.
//!
//! Layout, in order:
//!
//! ```text
//! [0]        route length L (u8, 1..=255)
//! [1..=L]    route, UTF-8
//! [L+1]      flags (bit 0: call id present)
//! [..+8]     call id, u64 big-endian (only when bit 0 set)
//! [rest]     payload bytes
//! ```
//!
//! Whether a route is request/response, request/stream or fire-and-forget is
//! a property of the route, not of the frame; the codec only moves bytes.

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::rpc::CallId;

/// Well-known routes. Client-originated methods use [`routes::agent`] plus
/// the method name; everything else is fixed.
pub mod routes {
    /// Prefix for client → gateway method routes.
    pub const AGENT_PREFIX: &str = "agent.";
    /// Gateway → client completion of a request/response method, or the
    /// fail-fast error of a request/stream method.
    pub const AGENT_RESPONSE: &str = "agent.response";
    /// Gateway → client stream item, correlated by the request's call id.
    pub const AGENT_STREAM: &str = "agent.stream";
    /// Gateway → client reverse call (call id present) or fire-and-forget
    /// notification (call id absent).
    pub const CLIENT_CALL: &str = "client.call";
    /// Client → gateway reverse-call response.
    pub const CLIENT_REPLY: &str = "client.reply";

    /// Split `agent.<method>` into its method suffix.
    pub fn agent_method(route: &str) -> Option<&str> {
        route.strip_prefix(AGENT_PREFIX)
    }
}

const FLAG_CALL_ID: u8 = 0b0000_0001;
const MAX_ROUTE_LEN: usize = 255;

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub route: String,
    pub call_id: Option<CallId>,
    pub payload: Bytes,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FrameError {
    #[error("frame route must not be empty")]
    EmptyRoute,
    #[error("frame route exceeds {MAX_ROUTE_LEN} bytes: {0}")]
    RouteTooLong(usize),
    #[error("frame route is not valid UTF-8")]
    RouteNotUtf8,
    #[error("frame truncated: need {needed} more bytes")]
    Truncated { needed: usize },
    #[error("unknown frame flags: {0:#04x}")]
    UnknownFlags(u8),
}

impl Frame {
    pub fn new(route: impl Into<String>, call_id: Option<CallId>, payload: Bytes) -> Self {
        Self {
            route: route.into(),
            call_id,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let route = self.route.as_bytes();
        if route.is_empty() {
            return Err(FrameError::EmptyRoute);
        }
        if route.len() > MAX_ROUTE_LEN {
            return Err(FrameError::RouteTooLong(route.len()));
        }

        let header_len = 1 + route.len() + 1 + if self.call_id.is_some() { 8 } else { 0 };
        let mut buf = BytesMut::with_capacity(header_len + self.payload.len());
        buf.put_u8(route.len() as u8);
        buf.put_slice(route);
        match self.call_id {
            Some(id) => {
                buf.put_u8(FLAG_CALL_ID);
                buf.put_u64(id);
            }
            None => buf.put_u8(0),
        }
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(input: &[u8]) -> Result<Self, FrameError> {
        let (&route_len, rest) = input
            .split_first()
            .ok_or(FrameError::Truncated { needed: 1 })?;
        if route_len == 0 {
            return Err(FrameError::EmptyRoute);
        }
        let route_len = usize::from(route_len);
        if rest.len() < route_len + 1 {
            return Err(FrameError::Truncated {
                needed: route_len + 1 - rest.len(),
            });
        }
        let (route_bytes, rest) = rest.split_at(route_len);
        let route = std::str::from_utf8(route_bytes)
            .map_err(|_| FrameError::RouteNotUtf8)?
            .to_string();

        let (&flags, rest) = rest
            .split_first()
            .ok_or(FrameError::Truncated { needed: 1 })?;
        if flags & !FLAG_CALL_ID != 0 {
            return Err(FrameError::UnknownFlags(flags));
        }

        let (call_id, payload) = if flags & FLAG_CALL_ID != 0 {
            if rest.len() < 8 {
                return Err(FrameError::Truncated {
                    needed: 8 - rest.len(),
                });
            }
            let (id_bytes, payload) = rest.split_at(8);
            let mut raw = [0u8; 8];
            raw.copy_from_slice(id_bytes);
            (Some(u64::from_be_bytes(raw)), payload)
        } else {
            (None, rest)
        };

        Ok(Self {
            route,
            call_id,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}
