//! # Confirmation Correlator
//!
//! Pairs the unconfirmed and confirmed stages of a transfer and emits exactly
//! one [`ConfirmedTransfer`] per transaction identity and watched address.
//!
//! Unconfirmed frames park a [`PendingTransaction`] until its TTL runs out.
//! A confirmed frame consumes the matching pending entry (if any), merges the
//! two payloads and records the identity in a short-lived emitted cache that
//! suppresses replays and duplicate deliveries.

use crate::config::CorrelationConfig;
use crate::events::{ChannelKind, ConfirmedTransfer, EventFrame, TransactionIdentity, TransferPayload};
use crate::model::Address;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

type Slot = (Address, TransactionIdentity);

/// An unconfirmed transfer awaiting its confirmation.
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub identity: TransactionIdentity,
    pub hash: Option<String>,
    pub payload: TransferPayload,
    pub received_at: Instant,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct EmittedDerived {
    expires_at: Instant,
    /// Whether the emitted transfer had a hash. Only hashless emissions
    /// suppress frames that carry a hash.
    hashed: bool,
}

/// Live counters of a correlator, shared with whoever reports them.
#[derive(Debug, Default)]
pub struct CorrelationMetrics {
    emitted: AtomicU64,
    duplicates_suppressed: AtomicU64,
    expired: AtomicU64,
    pending: AtomicU64,
}

impl CorrelationMetrics {
    pub fn snapshot(&self) -> CorrelationStats {
        CorrelationStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`CorrelationMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationStats {
    pub emitted: u64,
    pub duplicates_suppressed: u64,
    /// Pending entries dropped because their confirmation never came.
    pub expired: u64,
    pub pending: u64,
}

pub struct Correlator {
    pending_ttl: Duration,
    emitted_ttl: Duration,
    pending: HashMap<Slot, PendingTransaction>,
    /// Derived identity -> primary identity of the pending entry it belongs to.
    aliases: HashMap<Slot, TransactionIdentity>,
    /// Hash identities of emitted transfers.
    emitted: HashMap<Slot, Instant>,
    /// Derived identities of emitted transfers.
    emitted_derived: HashMap<Slot, EmittedDerived>,
    metrics: Arc<CorrelationMetrics>,
}

impl Correlator {
    pub fn new(config: &CorrelationConfig) -> Self {
        Self {
            pending_ttl: config.pending_ttl(),
            emitted_ttl: config.emitted_ttl(),
            pending: HashMap::new(),
            aliases: HashMap::new(),
            emitted: HashMap::new(),
            emitted_derived: HashMap::new(),
            metrics: Arc::new(CorrelationMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<CorrelationMetrics> {
        self.metrics.clone()
    }

    pub fn stats(&self) -> CorrelationStats {
        self.metrics.snapshot()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feeds one frame. Returns the notification to emit, if any.
    pub fn on_frame(&mut self, frame: EventFrame, now: Instant) -> Option<ConfirmedTransfer> {
        let emitted = match frame.channel() {
            ChannelKind::Unconfirmed => {
                self.on_unconfirmed(frame, now);
                None
            }
            ChannelKind::Confirmed => self.on_confirmed(frame, now),
        };
        self.metrics
            .pending
            .store(self.pending.len() as u64, Ordering::Relaxed);
        emitted
    }

    fn on_unconfirmed(&mut self, frame: EventFrame, now: Instant) {
        let address = frame.address().clone();
        let identity = frame.identity();
        let derived = frame.payload.derived_identity();

        if self.was_emitted(&address, frame.hash.as_deref(), &derived, now) {
            tracing::debug!("Ignoring unconfirmed replay of {} for {}", identity, address);
            return;
        }

        if derived != identity {
            self.aliases
                .insert((address.clone(), derived), identity.clone());
        }
        tracing::debug!("Pending {} for {}", identity, address);
        self.pending.insert(
            (address, identity.clone()),
            PendingTransaction {
                identity,
                hash: frame.hash,
                payload: frame.payload,
                received_at: now,
                expires_at: now + self.pending_ttl,
            },
        );
    }

    fn on_confirmed(&mut self, frame: EventFrame, now: Instant) -> Option<ConfirmedTransfer> {
        let address = frame.address().clone();
        let identity = frame.identity();
        let derived = frame.payload.derived_identity();

        if self.was_emitted(&address, frame.hash.as_deref(), &derived, now) {
            self.metrics
                .duplicates_suppressed
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Suppressing duplicate confirmation of {} for {}", identity, address);
            return None;
        }

        let pending = self.take_pending(&address, &identity, &derived);
        let (payload, hash) = match pending {
            Some(pending) => {
                let pending_derived = pending.payload.derived_identity();
                let hash = frame.hash.or(pending.hash);
                self.remember(&address, hash.as_deref(), &pending_derived, now);
                (frame.payload.merge(pending.payload), hash)
            }
            None => (frame.payload, frame.hash),
        };

        self.remember(&address, hash.as_deref(), &derived, now);
        let identity = hash.clone().map(TransactionIdentity::Hash).unwrap_or(identity);
        self.metrics.emitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Confirmed {} for {}", identity, address);

        Some(ConfirmedTransfer {
            address,
            identity,
            hash,
            payload,
        })
    }

    /// Finds the pending entry of a confirmed frame.
    ///
    /// A frame with a hash looks up that hash, then a hashless pending entry
    /// with the same derived identity. A frame without one looks up its
    /// derived identity, then the alias left by an unconfirmed frame that had
    /// a hash.
    fn take_pending(
        &mut self,
        address: &Address,
        identity: &TransactionIdentity,
        derived: &TransactionIdentity,
    ) -> Option<PendingTransaction> {
        let candidates = match identity {
            TransactionIdentity::Hash(_) => [Some(identity.clone()), Some(derived.clone())],
            TransactionIdentity::Derived(_) => [
                Some(derived.clone()),
                self.aliases.get(&(address.clone(), derived.clone())).cloned(),
            ],
        };
        let found = candidates
            .into_iter()
            .flatten()
            .find_map(|candidate| self.pending.remove(&(address.clone(), candidate)))?;
        let alias = (address.clone(), found.payload.derived_identity());
        if self.aliases.get(&alias) == Some(&found.identity) {
            self.aliases.remove(&alias);
        }
        Some(found)
    }

    fn remember(
        &mut self,
        address: &Address,
        hash: Option<&str>,
        derived: &TransactionIdentity,
        now: Instant,
    ) {
        let expires_at = now + self.emitted_ttl;
        if let Some(hash) = hash {
            self.emitted.insert(
                (address.clone(), TransactionIdentity::Hash(hash.to_string())),
                expires_at,
            );
        }
        self.emitted_derived.insert(
            (address.clone(), derived.clone()),
            EmittedDerived {
                expires_at,
                hashed: hash.is_some(),
            },
        );
    }

    /// A frame carrying a hash is a duplicate only if that hash was emitted,
    /// or if a hashless emission had the same derived identity. A frame
    /// without a hash falls back to its derived identity.
    fn was_emitted(
        &self,
        address: &Address,
        hash: Option<&str>,
        derived: &TransactionIdentity,
        now: Instant,
    ) -> bool {
        let derived = self
            .emitted_derived
            .get(&(address.clone(), derived.clone()))
            .filter(|entry| entry.expires_at > now);
        match hash {
            Some(hash) => {
                let slot = (address.clone(), TransactionIdentity::Hash(hash.to_string()));
                self.emitted
                    .get(&slot)
                    .is_some_and(|expires_at| *expires_at > now)
                    || derived.is_some_and(|entry| !entry.hashed)
            }
            None => derived.is_some(),
        }
    }

    /// Drops expired pending entries and stale emitted identities. Returns the
    /// number of pending entries that timed out.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, pending| pending.expires_at > now);
        let expired = before - self.pending.len();

        let pending = &self.pending;
        self.aliases
            .retain(|(address, _), primary| pending.contains_key(&(address.clone(), primary.clone())));
        self.emitted.retain(|_, expires_at| *expires_at > now);
        self.emitted_derived.retain(|_, entry| entry.expires_at > now);

        if expired > 0 {
            tracing::debug!("Evicted {} unconfirmed transaction(s) past their TTL", expired);
            self.metrics
                .expired
                .fetch_add(expired as u64, Ordering::Relaxed);
        }
        self.metrics
            .pending
            .store(self.pending.len() as u64, Ordering::Relaxed);
        expired
    }
}
