//! # Transport
//!
//! The connection layer between the listener and a node.
//!
//! - [`Transport`] / [`Connection`]: the seam over the physical link. The
//!   production implementation is [`WebSocketTransport`], which speaks STOMP
//!   over a websocket as NIS nodes expect; tests plug in an in-memory node.
//! - [`session`]: the per-connection actor that keeps subscriptions alive
//!   across reconnects and forwards event frames downstream.
//! - [`backoff`]: the reconnection delay policy.

pub mod backoff;
pub mod session;
pub mod stomp;
mod websocket;

use crate::config::Endpoint;
use crate::error::ConnectionError;
use crate::events::{EventFrame, SubscriptionKey};
use async_trait::async_trait;

pub use session::{SessionEvent, SessionHandle, SessionState, TransportSession};
pub use websocket::WebSocketTransport;

/// A request sent to the node. Every request carries an identifier the node
/// echoes back in its acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Subscribe { request_id: u64, key: SubscriptionKey },
    Unsubscribe { request_id: u64, key: SubscriptionKey },
}

impl OutboundFrame {
    pub fn request_id(&self) -> u64 {
        match self {
            OutboundFrame::Subscribe { request_id, .. } => *request_id,
            OutboundFrame::Unsubscribe { request_id, .. } => *request_id,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        match self {
            OutboundFrame::Subscribe { key, .. } => key,
            OutboundFrame::Unsubscribe { key, .. } => key,
        }
    }
}

/// A decoded frame received from the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// The node accepted the request with this identifier.
    Ack { request_id: u64 },
    /// The node refused a request, or reported an error without one.
    Rejected {
        request_id: Option<u64>,
        reason: String,
    },
    /// A transaction notification on an active subscription.
    Event(EventFrame),
}

/// Opens connections to nodes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connects to `endpoint` and completes the protocol handshake.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// One established, handshaken connection.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), ConnectionError>;

    /// The next inbound frame. `None` means the peer closed the connection.
    ///
    /// Must be cancel safe: the session polls it inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<InboundFrame, ConnectionError>>;

    /// Closes the connection gracefully. Errors are not interesting at this point.
    async fn close(&mut self);
}
