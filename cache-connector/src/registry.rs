//! # Subscription Registry
//!
//! Reference-counts subscriptions per `(address, channel)` so that any number
//! of observers share a single node-side subscription, and owns the session
//! they travel on.
//!
//! Per-key operations serialize through a per-key async mutex. The session
//! slot has its own lock, always taken after the key lock and never held
//! while a new session connects.

use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, SubscriptionError};
use crate::events::{ChannelKind, SubscriptionKey};
use crate::model::Address;
use crate::transport::{SessionEvent, SessionHandle, SessionState, Transport, TransportSession};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard};

type KeyLock = Arc<Mutex<u32>>;

pub struct SubscriptionRegistry {
    config: Arc<ConnectorConfig>,
    transport: Arc<dyn Transport>,
    events_tx: mpsc::Sender<SessionEvent>,
    /// Reference count per key, guarded by the key's own lock.
    keys: DashMap<SubscriptionKey, KeyLock>,
    /// Keys subscribed on the node, or being claimed. Inserted only under the
    /// session lock.
    active: parking_lot::Mutex<BTreeSet<SubscriptionKey>>,
    session: Mutex<Option<SessionHandle>>,
    closed: AtomicBool,
}

impl SubscriptionRegistry {
    pub fn new(
        config: Arc<ConnectorConfig>,
        transport: Arc<dyn Transport>,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            events_tx,
            keys: DashMap::new(),
            active: parking_lot::Mutex::new(BTreeSet::new()),
            session: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Takes a reference on `(address, channel)`.
    ///
    /// The first reference subscribes on the session, opening one if needed,
    /// and waits for the node's acknowledgement. A dead session is replaced
    /// here, and every subscription still held is re-issued on the new one.
    pub async fn subscribe(
        self: &Arc<Self>,
        address: Address,
        channel: ChannelKind,
    ) -> Result<SubscriptionHandle, ConnectorError> {
        let key = SubscriptionKey::new(address, channel);
        let lock = self.key_lock(&key);
        let mut count = lock.lock().await;

        let (session, claiming) = match self.acquire_session().await {
            Ok((_slot, session)) => {
                // A key the node dropped is claimed again by its next subscriber.
                let claiming = *count == 0 || !self.active.lock().contains(&key);
                if claiming {
                    self.active.lock().insert(key.clone());
                }
                (session, claiming)
            }
            Err(e) => {
                drop(count);
                drop(lock);
                self.collect(&key);
                return Err(e);
            }
        };

        if claiming {
            if let Err(e) = self.claim(&session, &key).await {
                self.rollback(&key).await;
                drop(count);
                drop(lock);
                self.collect(&key);
                return Err(e.into());
            }
            tracing::info!("Subscribed to {}", key);
        }

        *count += 1;
        tracing::debug!("Subscription {} now has {} reference(s)", key, *count);
        Ok(SubscriptionHandle {
            key,
            registry: Some(self.clone()),
        })
    }

    /// Releases a reference. The last reference unsubscribes on the node and,
    /// if nothing else is subscribed, closes the session.
    pub async fn unsubscribe(&self, mut handle: SubscriptionHandle) {
        if handle.registry.take().is_some() {
            self.release(handle.key.clone()).await;
        }
    }

    /// The number of live references on `key`.
    pub async fn ref_count(&self, key: &SubscriptionKey) -> u32 {
        let Some(lock) = self.keys.get(key).map(|entry| entry.value().clone()) else {
            return 0;
        };
        let count = *lock.lock().await;
        count
    }

    /// Keys currently subscribed (or being subscribed) on the node.
    pub fn active_subscriptions(&self) -> Vec<SubscriptionKey> {
        self.active.lock().iter().cloned().collect()
    }

    /// State of the current session, if one is held.
    pub async fn session_state(&self) -> Option<SessionState> {
        self.session.lock().await.as_ref().map(SessionHandle::state)
    }

    /// Forgets a key the node refused after the fact. Its references stay
    /// counted; the next `subscribe` on it claims it again.
    pub fn forget(&self, key: &SubscriptionKey) {
        if self.active.lock().remove(key) {
            tracing::warn!("Subscription {} was dropped by the node", key);
        }
    }

    /// Closes the session regardless of outstanding references.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut slot = self.session.lock().await;
        self.active.lock().clear();
        if let Some(session) = slot.take() {
            session.close().await;
        }
    }

    fn key_lock(&self, key: &SubscriptionKey) -> KeyLock {
        self.keys.entry(key.clone()).or_default().value().clone()
    }

    /// Returns the live session with the slot still locked, opening a new
    /// one if needed. Connecting happens without the slot lock; if another
    /// caller installed a session meanwhile, the fresh one is closed.
    async fn acquire_session(
        &self,
    ) -> Result<(MutexGuard<'_, Option<SessionHandle>>, SessionHandle), ConnectorError> {
        {
            let slot = self.session.lock().await;
            if let Some(session) = slot.as_ref().filter(|session| !session.is_terminated()) {
                let session = session.clone();
                return Ok((slot, session));
            }
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnectorError::Shutdown);
        }

        let fresh = TransportSession::open(
            &self.config,
            self.transport.clone(),
            self.events_tx.clone(),
        )
        .await?;

        let mut slot = self.session.lock().await;
        if self.closed.load(Ordering::Acquire) {
            drop(slot);
            fresh.close().await;
            return Err(ConnectorError::Shutdown);
        }
        if let Some(session) = slot.as_ref().filter(|session| !session.is_terminated()) {
            let session = session.clone();
            fresh.close().await;
            return Ok((slot, session));
        }
        if slot.take().is_some() {
            tracing::info!("Discarding terminated session.");
        }

        let keys: Vec<SubscriptionKey> = self.active.lock().iter().cloned().collect();
        if !keys.is_empty() {
            tracing::info!("Re-issuing {} subscription(s) on the new session", keys.len());
        }
        for key in keys {
            fresh.subscribe_detached(key).await;
        }

        *slot = Some(fresh.clone());
        Ok((slot, fresh))
    }

    async fn claim(
        &self,
        session: &SessionHandle,
        key: &SubscriptionKey,
    ) -> Result<(), SubscriptionError> {
        let ack_timeout = self.config.subscription.ack_timeout();
        match tokio::time::timeout(ack_timeout, session.subscribe(key.clone())).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Subscription {} was not acknowledged within {:?}", key, ack_timeout);
                session.unsubscribe(key.clone()).await;
                Err(SubscriptionError::AckTimeout(key.clone()))
            }
        }
    }

    /// Undoes a failed first claim.
    async fn rollback(&self, key: &SubscriptionKey) {
        let mut slot = self.session.lock().await;
        let idle = {
            let mut active = self.active.lock();
            active.remove(key);
            active.is_empty()
        };
        if idle {
            if let Some(session) = slot.take() {
                session.close().await;
            }
        }
    }

    async fn release(&self, key: SubscriptionKey) {
        let Some(lock) = self.keys.get(&key).map(|entry| entry.value().clone()) else {
            return;
        };
        {
            let mut count = lock.lock().await;
            if *count == 0 {
                return;
            }
            *count -= 1;
            tracing::debug!("Subscription {} now has {} reference(s)", key, *count);

            if *count == 0 {
                let mut slot = self.session.lock().await;
                let idle = {
                    let mut active = self.active.lock();
                    active.remove(&key);
                    active.is_empty()
                };
                if let Some(session) = slot.as_ref() {
                    session.unsubscribe(key.clone()).await;
                    tracing::info!("Unsubscribed from {}", key);
                }
                if idle {
                    if let Some(session) = slot.take() {
                        tracing::info!("No subscriptions left. Closing session.");
                        session.close().await;
                    }
                }
            }
        }
        drop(lock);
        self.collect(&key);
    }

    /// Drops the key's lock once nobody holds or counts on it.
    fn collect(&self, key: &SubscriptionKey) {
        self.keys.remove_if(key, |_, lock| {
            Arc::strong_count(lock) == 1 && lock.try_lock().map(|count| *count == 0).unwrap_or(false)
        });
    }
}

/// A reference on one subscription. Dropping it releases the reference in
/// the background.
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    registry: Option<Arc<SubscriptionRegistry>>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("released", &self.registry.is_none())
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let Some(registry) = self.registry.take() else {
            return;
        };
        let key = self.key.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { registry.release(key).await });
            }
            Err(_) => tracing::warn!("Subscription {} dropped outside a runtime; not released", key),
        }
    }
}
