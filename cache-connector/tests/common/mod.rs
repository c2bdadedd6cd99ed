//! An in-memory node for driving the listener end to end.
#![allow(dead_code)]

use async_trait::async_trait;
use cache_connector::config::{ConnectorConfig, Endpoint, ReconnectConfig};
use cache_connector::error::ConnectionError;
use cache_connector::events::{ChannelKind, EventFrame, SubscriptionKey};
use cache_connector::model::Address;
use cache_connector::transport::{Connection, InboundFrame, OutboundFrame, Transport};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const ALICE: &str = "TDU225EF2XRJTDXJZOWPNPKE3K4NYR277EQPOPZD";
pub const BOB: &str = "TBQ5N3O5J2QGBAFQX5LXQZNRLWBKGZWQ4JHBOZJD";

pub fn address(raw: &str) -> Address {
    Address::new(raw).unwrap()
}

/// A connector config pointing at `domains`, with fast reconnects.
pub fn test_config(domains: &[&str]) -> ConnectorConfig {
    let mut config = ConnectorConfig::default();
    config.node.endpoints = domains.iter().map(|d| Endpoint::new(*d)).collect();
    config.reconnect = ReconnectConfig {
        base_delay_ms: 10,
        max_delay_ms: 80,
        max_retries: 3,
        jitter: 0.0,
    };
    config.subscription.ack_timeout_ms = 1_000;
    config
}

/// A NIS transaction/metadata pair as pushed on `/unconfirmed` and `/transactions`.
pub fn transfer_body(hash: Option<&str>, recipient: &str, amount: u64, height: Option<u64>) -> String {
    let mut meta = serde_json::json!({});
    if let Some(hash) = hash {
        meta["hash"] = serde_json::json!({ "data": hash });
    }
    if let Some(height) = height {
        meta["height"] = serde_json::json!(height);
    }
    serde_json::json!({
        "meta": meta,
        "transaction": {
            "type": 257,
            "signer": "a1b2c3d4",
            "recipient": recipient,
            "amount": amount,
            "fee": 50_000,
            "timeStamp": 98_765,
            "message": { "type": 1, "payload": "68656c6c6f" }
        }
    })
    .to_string()
}

struct ConnectionSlot {
    domain: String,
    inbound_tx: Option<mpsc::UnboundedSender<InboundFrame>>,
    closed_gracefully: bool,
}

#[derive(Default)]
struct NodeState {
    connections: Vec<ConnectionSlot>,
    sent: Vec<(usize, OutboundFrame)>,
    connect_attempts: Vec<String>,
    fail_next_connects: u32,
    connect_delay: Duration,
    unreachable: HashSet<String>,
    reject: HashSet<SubscriptionKey>,
    manual_acks: bool,
    duplicate_acks: bool,
}

impl NodeState {
    fn deliver(&self, connection: usize, frame: InboundFrame) {
        if let Some(tx) = self.connections[connection].inbound_tx.as_ref() {
            let _ = tx.send(frame);
        }
    }

    fn current(&self) -> Option<usize> {
        self.connections
            .iter()
            .rposition(|slot| slot.inbound_tx.is_some())
    }
}

/// Shared control surface of the mock node.
#[derive(Clone, Default)]
pub struct MockNode {
    state: Arc<Mutex<NodeState>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MockTransport {
            state: self.state.clone(),
        })
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().fail_next_connects = count;
    }

    /// Makes every later connect take `delay` before it completes.
    pub fn delay_connects(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    pub fn set_unreachable(&self, domain: &str) {
        self.state.lock().unreachable.insert(domain.to_string());
    }

    pub fn reject(&self, key: SubscriptionKey) {
        self.state.lock().reject.insert(key);
    }

    pub fn allow(&self, key: &SubscriptionKey) {
        self.state.lock().reject.remove(key);
    }

    /// Stops acknowledging subscriptions.
    pub fn withhold_acks(&self) {
        self.state.lock().manual_acks = true;
    }

    pub fn duplicate_acks(&self) {
        self.state.lock().duplicate_acks = true;
    }

    /// Pushes a MESSAGE on the current connection.
    pub fn push(&self, watched: &str, channel: ChannelKind, body: &str) {
        let key = SubscriptionKey::new(address(watched), channel);
        let frame = EventFrame::parse(key, body).unwrap();
        let state = self.state.lock();
        let connection = state.current().expect("no live connection");
        state.deliver(connection, InboundFrame::Event(frame));
    }

    /// Drops the current connection without a close handshake.
    pub fn kill_connection(&self) {
        let mut state = self.state.lock();
        if let Some(connection) = state.current() {
            state.connections[connection].inbound_tx = None;
        }
    }

    pub fn subscribes(&self) -> Vec<SubscriptionKey> {
        self.sent_matching(|frame| matches!(frame, OutboundFrame::Subscribe { .. }))
    }

    pub fn unsubscribes(&self) -> Vec<SubscriptionKey> {
        self.sent_matching(|frame| matches!(frame, OutboundFrame::Unsubscribe { .. }))
    }

    /// SUBSCRIBE frames sent on the connection with index `connection`.
    pub fn subscribes_on(&self, connection: usize) -> Vec<SubscriptionKey> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(id, frame)| *id == connection && matches!(frame, OutboundFrame::Subscribe { .. }))
            .map(|(_, frame)| frame.key().clone())
            .collect()
    }

    fn sent_matching(&self, predicate: impl Fn(&OutboundFrame) -> bool) -> Vec<SubscriptionKey> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(_, frame)| predicate(frame))
            .map(|(_, frame)| frame.key().clone())
            .collect()
    }

    pub fn connect_attempts(&self) -> Vec<String> {
        self.state.lock().connect_attempts.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn graceful_closes(&self) -> usize {
        self.state
            .lock()
            .connections
            .iter()
            .filter(|slot| slot.closed_gracefully)
            .count()
    }

    pub fn domain_of(&self, connection: usize) -> String {
        self.state.lock().connections[connection].domain.clone()
    }
}

struct MockTransport {
    state: Arc<Mutex<NodeState>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, ConnectionError> {
        let delay = self.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        state.connect_attempts.push(endpoint.domain.clone());
        if state.unreachable.contains(&endpoint.domain) || state.fail_next_connects > 0 {
            state.fail_next_connects = state.fail_next_connects.saturating_sub(1);
            return Err(ConnectionError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        state.connections.push(ConnectionSlot {
            domain: endpoint.domain.clone(),
            inbound_tx: Some(inbound_tx),
            closed_gracefully: false,
        });
        Ok(Box::new(MockConnection {
            id: state.connections.len() - 1,
            inbound_rx,
            state: self.state.clone(),
        }))
    }
}

struct MockConnection {
    id: usize,
    inbound_rx: mpsc::UnboundedReceiver<InboundFrame>,
    state: Arc<Mutex<NodeState>>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        if state.connections[self.id].inbound_tx.is_none() {
            return Err(ConnectionError::Closed);
        }
        state.sent.push((self.id, frame.clone()));

        if let OutboundFrame::Subscribe { request_id, key } = frame {
            if state.reject.contains(&key) {
                state.deliver(
                    self.id,
                    InboundFrame::Rejected {
                        request_id: Some(request_id),
                        reason: "destination not allowed".to_string(),
                    },
                );
            } else if !state.manual_acks {
                state.deliver(self.id, InboundFrame::Ack { request_id });
                if state.duplicate_acks {
                    state.deliver(self.id, InboundFrame::Ack { request_id });
                }
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<InboundFrame, ConnectionError>> {
        self.inbound_rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        let mut state = self.state.lock();
        let slot = &mut state.connections[self.id];
        slot.closed_gracefully = true;
        slot.inbound_tx = None;
    }
}

/// Polls `condition` until it holds, advancing (possibly paused) time.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// Lets the pipeline drain whatever is in flight.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
