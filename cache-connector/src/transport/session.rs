//! # Transport Session
//!
//! One physical connection to a node, owned by a background actor task.
//!
//! The actor keeps the set of desired subscriptions. Every subscription is
//! re-issued after a reconnect, so the inbound event sequence handed to the
//! pipeline survives connection drops. Reconnects use exponential backoff;
//! once the retry ceiling is exceeded the session is terminally `Closed` and
//! a [`SessionEvent::Lost`] is emitted.

use super::backoff::Backoff;
use super::{Connection, InboundFrame, OutboundFrame, Transport};
use crate::config::{ConnectorConfig, Endpoint};
use crate::error::{ConnectionError, SubscriptionError};
use crate::events::{EventFrame, SubscriptionKey};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
    Closing,
    Closed,
}

/// What a session reports downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A transaction notification on a desired subscription.
    Frame(EventFrame),
    /// The connection was re-established and subscriptions were re-issued.
    Reconnected { endpoint: Endpoint },
    /// The node refused a subscription nobody was waiting on, typically one
    /// re-issued after a reconnect. The key is no longer desired.
    Rejected { key: SubscriptionKey, reason: String },
    /// The retry ceiling was exceeded; the session is terminally closed.
    Lost { attempts: u32, error: ConnectionError },
}

type AckSender = oneshot::Sender<Result<(), SubscriptionError>>;

#[derive(Debug)]
enum SessionCommand {
    Subscribe {
        key: SubscriptionKey,
        ack: Option<AckSender>,
    },
    Unsubscribe {
        key: SubscriptionKey,
    },
    Close,
}

/// A clonable handle to a running session actor.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Subscribes `key` and waits for the node's acknowledgement.
    ///
    /// Idempotent: an already-acknowledged key resolves immediately, and a key
    /// still awaiting its acknowledgement joins the pending waiters.
    pub async fn subscribe(&self, key: SubscriptionKey) -> Result<(), SubscriptionError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Subscribe {
                key: key.clone(),
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| SubscriptionError::SessionLost(key.clone()))?;
        ack_rx
            .await
            .map_err(|_| SubscriptionError::SessionLost(key))?
    }

    /// Adds `key` to the desired set without waiting for an acknowledgement.
    /// Returns `false` if the session is gone.
    pub async fn subscribe_detached(&self, key: SubscriptionKey) -> bool {
        self.command_tx
            .send(SessionCommand::Subscribe { key, ack: None })
            .await
            .is_ok()
    }

    pub async fn unsubscribe(&self, key: SubscriptionKey) {
        if self
            .command_tx
            .send(SessionCommand::Unsubscribe { key })
            .await
            .is_err()
        {
            tracing::debug!("Unsubscribe skipped: session is already closed");
        }
    }

    /// Closes the connection gracefully and stops the actor.
    pub async fn close(&self) {
        if self.command_tx.send(SessionCommand::Close).await.is_err() {
            tracing::debug!("Close skipped: session is already closed");
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// `true` once the session can no longer carry subscriptions.
    pub fn is_terminated(&self) -> bool {
        self.command_tx.is_closed()
            || matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }
}

/// Entry point for opening sessions.
pub struct TransportSession;

impl TransportSession {
    /// Connects to the first reachable endpoint and spawns the session actor.
    ///
    /// Endpoints are tried in order; the error of the last candidate is
    /// returned when none of them accepts the connection.
    pub async fn open(
        config: &ConnectorConfig,
        transport: Arc<dyn Transport>,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> Result<SessionHandle, ConnectionError> {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let endpoints = config.node.endpoints.clone();
        let (connection, endpoint) = connect_any(transport.as_ref(), &endpoints).await?;
        tracing::info!("Session opened on {}", endpoint);
        state_tx.send_replace(SessionState::Open);

        let (command_tx, command_rx) = mpsc::channel(config.channels.session_command_buffer);
        let actor = SessionActor {
            transport,
            endpoints,
            backoff: Backoff::new(&config.reconnect),
            command_rx,
            events_tx,
            state_tx,
            subscriptions: BTreeMap::new(),
            pending: HashMap::new(),
            next_request_id: 1,
        };
        tokio::spawn(actor.run(connection));

        Ok(SessionHandle {
            command_tx,
            state_rx,
        })
    }
}

async fn connect_any(
    transport: &dyn Transport,
    endpoints: &[Endpoint],
) -> Result<(Box<dyn Connection>, Endpoint), ConnectionError> {
    let mut last_error = ConnectionError::NoEndpoints;
    for endpoint in endpoints {
        match transport.connect(endpoint).await {
            Ok(connection) => return Ok((connection, endpoint.clone())),
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {}", endpoint, e);
                last_error = e;
            }
        }
    }
    Err(last_error)
}

#[derive(Debug, Default)]
struct Subscription {
    acknowledged: bool,
    /// Request id of the in-flight SUBSCRIBE, if any.
    request_id: Option<u64>,
    waiters: Vec<AckSender>,
}

impl Subscription {
    fn resolve(&mut self, result: Result<(), SubscriptionError>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Why the serve loop returned.
enum Served {
    Closed,
    Disconnected(ConnectionError),
}

enum Reconnect {
    Connected(Box<dyn Connection>, Endpoint),
    Closed,
    Exhausted { attempts: u32, error: ConnectionError },
}

struct SessionActor {
    transport: Arc<dyn Transport>,
    endpoints: Vec<Endpoint>,
    backoff: Backoff,
    command_rx: mpsc::Receiver<SessionCommand>,
    events_tx: mpsc::Sender<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
    subscriptions: BTreeMap<SubscriptionKey, Subscription>,
    pending: HashMap<u64, SubscriptionKey>,
    next_request_id: u64,
}

impl SessionActor {
    async fn run(mut self, mut connection: Box<dyn Connection>) {
        loop {
            match self.serve(connection.as_mut()).await {
                Served::Closed => {
                    self.state_tx.send_replace(SessionState::Closing);
                    connection.close().await;
                    self.state_tx.send_replace(SessionState::Closed);
                    tracing::info!("Session closed.");
                    return;
                }
                Served::Disconnected(error) => {
                    tracing::warn!("Session disconnected: {}", error);
                }
            }

            connection = match self.reconnect().await {
                Reconnect::Connected(connection, endpoint) => {
                    tracing::info!("Session reconnected to {}", endpoint);
                    let _ = self
                        .events_tx
                        .send(SessionEvent::Reconnected { endpoint })
                        .await;
                    connection
                }
                Reconnect::Closed => {
                    self.state_tx.send_replace(SessionState::Closed);
                    tracing::info!("Session closed while reconnecting.");
                    return;
                }
                Reconnect::Exhausted { attempts, error } => {
                    self.lose(attempts, error).await;
                    return;
                }
            };
        }
    }

    /// Serves commands and inbound frames until the connection drops or the
    /// session is asked to close.
    async fn serve(&mut self, connection: &mut dyn Connection) -> Served {
        self.state_tx.send_replace(SessionState::Open);
        if let Err(e) = self.resubscribe(connection).await {
            return Served::Disconnected(e);
        }

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    None | Some(SessionCommand::Close) => return Served::Closed,
                    Some(command) => {
                        if let Err(e) = self.handle_command(connection, command).await {
                            return Served::Disconnected(e);
                        }
                    }
                },
                inbound = connection.recv() => match inbound {
                    Some(Ok(frame)) => {
                        if !self.handle_inbound(frame).await {
                            return Served::Closed;
                        }
                    }
                    Some(Err(e)) => tracing::warn!("Dropping unreadable frame: {}", e),
                    None => return Served::Disconnected(ConnectionError::Closed),
                },
            }
        }
    }

    /// Issues a SUBSCRIBE for every desired key that has no request in flight.
    async fn resubscribe(&mut self, connection: &mut dyn Connection) -> Result<(), ConnectionError> {
        let keys: Vec<SubscriptionKey> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| !sub.acknowledged && sub.request_id.is_none())
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.send_subscribe(connection, key).await?;
        }
        Ok(())
    }

    async fn send_subscribe(
        &mut self,
        connection: &mut dyn Connection,
        key: SubscriptionKey,
    ) -> Result<(), ConnectionError> {
        let request_id = self.next_request_id();
        if let Some(sub) = self.subscriptions.get_mut(&key) {
            sub.request_id = Some(request_id);
        }
        self.pending.insert(request_id, key.clone());
        tracing::debug!("SUBSCRIBE {} (request {})", key, request_id);
        connection
            .send(OutboundFrame::Subscribe { request_id, key })
            .await
    }

    async fn handle_command(
        &mut self,
        connection: &mut dyn Connection,
        command: SessionCommand,
    ) -> Result<(), ConnectionError> {
        match command {
            SessionCommand::Subscribe { key, ack } => {
                if let Some(sub) = self.subscriptions.get_mut(&key) {
                    if let Some(ack) = ack {
                        if sub.acknowledged {
                            let _ = ack.send(Ok(()));
                        } else {
                            sub.waiters.push(ack);
                        }
                    }
                    return Ok(());
                }
                self.subscriptions.insert(
                    key.clone(),
                    Subscription {
                        waiters: ack.into_iter().collect(),
                        ..Subscription::default()
                    },
                );
                self.send_subscribe(connection, key).await
            }
            SessionCommand::Unsubscribe { key } => {
                let Some(sub) = self.subscriptions.remove(&key) else {
                    return Ok(());
                };
                if let Some(request_id) = sub.request_id {
                    self.pending.remove(&request_id);
                }
                let request_id = self.next_request_id();
                tracing::debug!("UNSUBSCRIBE {} (request {})", key, request_id);
                connection
                    .send(OutboundFrame::Unsubscribe { request_id, key })
                    .await
            }
            SessionCommand::Close => Ok(()),
        }
    }

    /// Returns `false` when nobody consumes session events anymore.
    async fn handle_inbound(&mut self, frame: InboundFrame) -> bool {
        match frame {
            InboundFrame::Ack { request_id } => {
                let Some(key) = self.pending.remove(&request_id) else {
                    tracing::debug!("Ignoring acknowledgement for unknown request {}", request_id);
                    return true;
                };
                if let Some(sub) = self.subscriptions.get_mut(&key) {
                    tracing::debug!("Subscription {} acknowledged", key);
                    sub.acknowledged = true;
                    sub.request_id = None;
                    sub.resolve(Ok(()));
                }
            }
            InboundFrame::Rejected { request_id, reason } => {
                match request_id.and_then(|id| self.pending.remove(&id)) {
                    Some(key) => {
                        tracing::warn!("Node rejected subscription {}: {}", key, reason);
                        let Some(mut sub) = self.subscriptions.remove(&key) else {
                            return true;
                        };
                        if !sub.waiters.is_empty() {
                            sub.resolve(Err(SubscriptionError::Rejected { key, reason }));
                        } else if self
                            .events_tx
                            .send(SessionEvent::Rejected { key, reason })
                            .await
                            .is_err()
                        {
                            tracing::info!("Event receiver closed. Closing session.");
                            return false;
                        }
                    }
                    None => tracing::warn!("Node reported an error: {}", reason),
                }
            }
            InboundFrame::Event(event) => {
                if !self.subscriptions.contains_key(&event.key) {
                    tracing::debug!("Dropping frame for inactive subscription {}", event.key);
                    return true;
                }
                if self.events_tx.send(SessionEvent::Frame(event)).await.is_err() {
                    tracing::info!("Event receiver closed. Closing session.");
                    return false;
                }
            }
        }
        true
    }

    async fn reconnect(&mut self) -> Reconnect {
        for sub in self.subscriptions.values_mut() {
            sub.acknowledged = false;
            sub.request_id = None;
        }
        self.pending.clear();

        let max_retries = self.backoff.max_retries();
        let mut last_error = ConnectionError::Closed;
        for attempt in 1..=max_retries {
            self.state_tx
                .send_replace(SessionState::Reconnecting { attempt });
            let delay = self.backoff.delay(attempt);
            tracing::info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay,
                attempt,
                max_retries
            );
            if !self.wait(delay).await {
                return Reconnect::Closed;
            }
            match connect_any(self.transport.as_ref(), &self.endpoints).await {
                Ok((connection, endpoint)) => return Reconnect::Connected(connection, endpoint),
                Err(e) => last_error = e,
            }
        }
        Reconnect::Exhausted {
            attempts: max_retries,
            error: last_error,
        }
    }

    /// Sleeps for `delay` while still accepting commands. Subscriptions
    /// requested meanwhile join the desired set and are issued on reconnect.
    /// Returns `false` if the session was asked to close.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.command_rx.recv() => match command {
                    None | Some(SessionCommand::Close) => return false,
                    Some(SessionCommand::Subscribe { key, ack }) => {
                        let sub = self.subscriptions.entry(key).or_default();
                        sub.waiters.extend(ack);
                    }
                    Some(SessionCommand::Unsubscribe { key }) => {
                        self.subscriptions.remove(&key);
                    }
                },
            }
        }
    }

    async fn lose(mut self, attempts: u32, error: ConnectionError) {
        tracing::error!(
            "Session lost after {} reconnection attempts: {}",
            attempts,
            error
        );
        self.state_tx.send_replace(SessionState::Closed);
        for (key, sub) in self.subscriptions.iter_mut() {
            sub.resolve(Err(SubscriptionError::SessionLost(key.clone())));
        }
        self.command_rx.close();
        let _ = self
            .events_tx
            .send(SessionEvent::Lost { attempts, error })
            .await;
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }
}
