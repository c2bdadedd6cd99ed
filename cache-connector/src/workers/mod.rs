//! # Listener Manager & Background Pipeline
//!
//! This module defines the `ListenerManager`, which wires the registry, the
//! correlator and dispatch together and runs the background pipeline.
//!
//! ## Core Components
//!
//! - [`ListenerManager`]: owns the pipeline task. It is consumed when its
//!   `run` method is called.
//! - [`ListenerHandle`]: a clonable, thread-safe handle that provides the
//!   public API (adding observers, creating listeners, cancelling, shutting
//!   down).
//! - **Pipeline**: reads the session event stream, feeds the correlator,
//!   runs the TTL sweep and hands confirmed transfers to dispatch.

mod pipeline;

use crate::{
    config::ConnectorConfig,
    correlator::{CorrelationMetrics, CorrelationStats, Correlator},
    dispatcher::{ChannelObserver, Dispatcher, Observer, ObserverId, ObserverToken},
    error::{ConnectorError, ListenerError},
    events::{ChannelKind, SubscriptionKey},
    listener::AddressListener,
    model::Address,
    registry::{SubscriptionHandle, SubscriptionRegistry},
    transport::{SessionState, Transport, WebSocketTransport},
    workers::pipeline::Pipeline,
};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

struct Shared {
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<CorrelationMetrics>,
    /// Subscription references held on behalf of each registered observer.
    subscriptions: DashMap<ObserverId, Vec<SubscriptionHandle>>,
    shutdown_tx: watch::Sender<bool>,
}

/// A clonable, thread-safe handle for interacting with the `ListenerManager`'s
/// background services.
///
/// This handle is the primary public entry point for applications using the
/// connector. It is obtained when a [`ListenerManager`] is created and can be
/// cloned and passed across threads.
#[derive(Clone)]
pub struct ListenerHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("observers", &self.shared.subscriptions.len())
            .finish()
    }
}

impl ListenerHandle {
    /// Registers `observer` for confirmed transfers touching `address`.
    ///
    /// Subscribes the address on both channels first (sharing any existing
    /// subscription) and fails without registering if either subscription
    /// is refused.
    pub async fn add_observer(
        &self,
        address: Address,
        observer: impl Observer,
    ) -> Result<ObserverToken, ConnectorError> {
        if *self.shared.shutdown_tx.borrow() {
            return Err(ConnectorError::Shutdown);
        }

        let mut handles = Vec::with_capacity(ChannelKind::ALL.len());
        for channel in ChannelKind::ALL {
            match self
                .shared
                .registry
                .subscribe(address.clone(), channel)
                .await
            {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::warn!("Failed to watch {} on {}: {}", address, channel, e);
                    for handle in handles {
                        self.shared.registry.unsubscribe(handle).await;
                    }
                    return Err(e);
                }
            }
        }

        let token = self.shared.dispatcher.register(address, observer);
        self.shared.subscriptions.insert(token.id, handles);
        Ok(token)
    }

    /// Creates a channel-backed listener for `address`.
    pub async fn listen(&self, address: Address) -> Result<AddressListener, ConnectorError> {
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        let token = self
            .add_observer(address, ChannelObserver(transfer_tx))
            .await?;
        Ok(AddressListener::new(transfer_rx, token, self.clone()))
    }

    /// Cancels an observer and releases its subscriptions. Idempotent; once
    /// it returns the observer receives nothing further.
    ///
    /// Waiting out an in-flight delivery happens on the blocking pool, so a
    /// slow observer never stalls a runtime worker here.
    pub async fn cancel(&self, token: &ObserverToken) -> bool {
        let dispatcher = self.shared.dispatcher.clone();
        let owned = token.clone();
        let cancelled = match tokio::task::spawn_blocking(move || dispatcher.cancel(&owned)).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                tracing::error!("Cancelling observer {} failed: {}", token.id, e);
                false
            }
        };
        if let Some((_, handles)) = self.shared.subscriptions.remove(&token.id) {
            for handle in handles {
                self.shared.registry.unsubscribe(handle).await;
            }
        }
        cancelled
    }

    /// Like [`cancel`](Self::cancel), releasing the subscriptions in the background.
    pub fn cancel_detached(&self, token: &ObserverToken) -> bool {
        let cancelled = self.shared.dispatcher.cancel(token);
        self.shared.subscriptions.remove(&token.id);
        cancelled
    }

    /// Observer failures and session loss, as a side channel.
    pub fn errors(&self) -> broadcast::Receiver<ListenerError> {
        self.shared.dispatcher.errors()
    }

    pub fn stats(&self) -> CorrelationStats {
        self.shared.metrics.snapshot()
    }

    pub fn observer_count(&self, address: &Address) -> usize {
        self.shared.dispatcher.observer_count(address)
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionKey> {
        self.shared.registry.active_subscriptions()
    }

    pub async fn session_state(&self) -> Option<SessionState> {
        self.shared.registry.session_state().await
    }

    /// Stops the pipeline and closes the session.
    pub async fn stop(&self) {
        self.shared.shutdown_tx.send_replace(true);
        self.shared.registry.shutdown().await;
    }
}

/// The main background service manager for the connector.
///
/// It is created once, its [`run()`](Self::run) method is spawned as a
/// background task, and it is then consumed, leaving the [`ListenerHandle`]
/// as the only way to interact with the running services.
pub struct ListenerManager {
    pipeline: Pipeline,
}

impl ListenerManager {
    /// Creates a new `ListenerManager` and its associated [`ListenerHandle`].
    ///
    /// No connection is made until the first observer is added.
    pub fn new(config: Arc<ConnectorConfig>, transport: Arc<dyn Transport>) -> (Self, ListenerHandle) {
        let (events_tx, events_rx) = mpsc::channel(config.channels.session_event_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let correlator = Correlator::new(&config.correlation);
        let metrics = correlator.metrics();
        let dispatcher = Arc::new(Dispatcher::new(config.channels.error_buffer));
        let registry = SubscriptionRegistry::new(config.clone(), transport, events_tx);

        let pipeline = Pipeline::new(
            correlator,
            events_rx,
            dispatcher.clone(),
            registry.clone(),
            shutdown_rx,
            config.correlation.sweep_interval(),
        );

        let handle = ListenerHandle {
            shared: Arc::new(Shared {
                registry,
                dispatcher,
                metrics,
                subscriptions: DashMap::new(),
                shutdown_tx,
            }),
        };

        (Self { pipeline }, handle)
    }

    /// Same as [`new`](Self::new) with the websocket transport.
    pub fn with_websocket(config: Arc<ConnectorConfig>) -> (Self, ListenerHandle) {
        Self::new(config, Arc::new(WebSocketTransport::new()))
    }

    /// Runs the pipeline until [`ListenerHandle::stop()`] is called or every
    /// handle is dropped.
    pub async fn run(self) {
        tracing::info!("Connector is running its background pipeline.");
        self.pipeline.run().await;
        tracing::info!("Pipeline has shut down.");
    }
}
