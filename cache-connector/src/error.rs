//! Error types for the connector.
//!
//! The listener distinguishes four failure families: connection failures
//! (retried with backoff inside a session), subscription failures (returned to
//! the caller of `subscribe`), observer failures (isolated and reported on the
//! side error channel) and model failures raised by the cast/factory helpers.

use crate::events::{SubscriptionKey, TransactionIdentity};
use crate::model::Address;
use thiserror::Error;

/// A failure to reach a node or to keep a connection to it alive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("no node endpoints are configured")]
    NoEndpoints,

    #[error("endpoint {endpoint} is unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("connection closed by peer")]
    Closed,
}

/// A failure to establish a subscription on the node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("node rejected subscription {key}: {reason}")]
    Rejected { key: SubscriptionKey, reason: String },

    #[error("no acknowledgement for subscription {0} before the timeout")]
    AckTimeout(SubscriptionKey),

    #[error("session was lost before subscription {0} was acknowledged")]
    SessionLost(SubscriptionKey),
}

/// A failure raised by a single observer while handling a notification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObserverError {
    #[error("observer failed: {0}")]
    Failed(String),

    #[error("observer panicked: {0}")]
    Panicked(String),

    #[error("observer receiver was dropped")]
    Disconnected,
}

/// A failure reported on the listener's side error channel. Delivery to
/// other observers is never affected by it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    #[error("observer {observer} for {address} failed on {identity}: {error}")]
    Observer {
        observer: u64,
        address: Address,
        identity: TransactionIdentity,
        error: ObserverError,
    },

    #[error("subscription dropped by the node: {0}")]
    Subscription(SubscriptionError),

    #[error("session lost after {attempts} reconnection attempts: {error}")]
    SessionLost {
        attempts: u32,
        error: ConnectionError,
    },
}

/// Validation failures from the token model layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("invalid hex payload: {0}")]
    InvalidHex(String),

    #[error("message payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' has an unexpected type")]
    InvalidField { field: &'static str },

    #[error("time window deadline exceeds {max_hours} hours")]
    DeadlineTooFar { max_hours: i64 },

    #[error("a transfer needs at least one mosaic")]
    NoMosaics,
}

/// The crate-level error type.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("frame decoding failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("the listener has been shut down")]
    Shutdown,
}

pub type Result<T, E = ConnectorError> = std::result::Result<T, E>;
