//! A Rust library for watching CACHE and XEM transfers on a NEM node in real time.
//!
//! This crate provides the building blocks for backend services that react to
//! confirmed transfers touching a set of watched addresses, plus the token
//! model used to build such transfers.
//!
//! # Key Components
//!
//! *   [`workers::ListenerManager`]: The main entry point for the event system. It runs
//!     the background pipeline that correlates unconfirmed and confirmed transactions
//!     and dispatches them to observers.
//! *   [`listener`]: Channel-backed listeners (`AddressListener`) that stream the
//!     confirmed transfers of one address.
//! *   [`model`]: Addresses, messages, mosaics, time windows and transfer factories.
//! *   [`client`]: The signing and announcement contracts.
pub mod client;
/// Defines configuration structures for the connector.
pub mod config;
/// Pairs unconfirmed and confirmed frames into single notifications.
pub mod correlator;
/// Fan-out of confirmed transfers to registered observers.
pub mod dispatcher;
pub mod error;
/// Event frames received from the node and the notifications built from them.
pub mod events;
/// Channel-backed, per-address listeners.
pub mod listener;
pub mod model;
/// Reference-counted subscriptions and ownership of the node session.
pub mod registry;
/// The connection to the node: STOMP over websocket, reconnects, backoff.
pub mod transport;
/// The background pipeline and its public handle.
pub mod workers;

pub use config::ConnectorConfig;
pub use dispatcher::{ChannelObserver, Observer, ObserverToken};
pub use error::{ConnectorError, ListenerError, ObserverError};
pub use events::{ChannelKind, ConfirmedTransfer, TransactionIdentity};
pub use listener::AddressListener;
pub use model::Address;
pub use workers::{ListenerHandle, ListenerManager};
