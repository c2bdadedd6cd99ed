//! Inbound event frames and the notifications produced from them.
//!
//! A node pushes one JSON body per transaction on each subscribed channel.
//! [`EventFrame::parse`] turns that body into a [`TransferPayload`] tagged with
//! the subscription it arrived on; the correlator later merges the
//! unconfirmed and confirmed payloads into a single [`ConfirmedTransfer`].

use crate::error::ConnectorError;
use crate::model::{Address, Mosaic, PlainMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// NIS transaction type of a multisig wrapper, whose inner transaction is the transfer.
const MULTISIG_TRANSACTION_TYPE: u16 = 0x1004;

/// The event stream kind of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Transactions seen in the node's pending pool.
    Unconfirmed,
    /// Transactions included in an accepted block.
    Confirmed,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 2] = [ChannelKind::Unconfirmed, ChannelKind::Confirmed];
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Unconfirmed => f.write_str("unconfirmed"),
            ChannelKind::Confirmed => f.write_str("confirmed"),
        }
    }
}

/// Identifies one subscription: an address watched on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub address: Address,
    pub channel: ChannelKind,
}

impl SubscriptionKey {
    pub fn new(address: Address, channel: ChannelKind) -> Self {
        Self { address, channel }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.channel)
    }
}

/// A value identifying a transaction across its unconfirmed and confirmed stages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum TransactionIdentity {
    /// The transaction hash reported by the node.
    Hash(String),
    /// SHA-256 over the transfer's own fields (sender, recipient, amount, fee,
    /// timestamp, message, mosaics), used when no hash is known.
    Derived(String),
}

impl fmt::Display for TransactionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionIdentity::Hash(hash) => f.write_str(hash),
            TransactionIdentity::Derived(digest) => write!(f, "derived:{}", digest),
        }
    }
}

/// The transfer fields carried by an event frame. Every field is optional
/// because either stage may omit some of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPayload {
    /// Public key of the signer.
    pub sender: Option<String>,
    pub recipient: Option<Address>,
    /// Absolute micro-XEM, or the mosaic multiplier for mosaic transfers.
    pub amount: Option<u64>,
    pub fee: Option<u64>,
    pub message: Option<PlainMessage>,
    #[serde(default)]
    pub mosaics: Vec<Mosaic>,
    /// Seconds since the NEM epoch.
    pub time_stamp: Option<u32>,
    /// Block height; only known once confirmed.
    pub height: Option<u64>,
}

impl TransferPayload {
    /// Combines two stages of the same transfer, preferring `self` and
    /// falling back to `fallback` for anything `self` omits.
    pub fn merge(self, fallback: TransferPayload) -> TransferPayload {
        TransferPayload {
            sender: self.sender.or(fallback.sender),
            recipient: self.recipient.or(fallback.recipient),
            amount: self.amount.or(fallback.amount),
            fee: self.fee.or(fallback.fee),
            message: self.message.or(fallback.message),
            mosaics: if self.mosaics.is_empty() {
                fallback.mosaics
            } else {
                self.mosaics
            },
            time_stamp: self.time_stamp.or(fallback.time_stamp),
            height: self.height.or(fallback.height),
        }
    }

    /// Identity derived from the fields that are stable across both stages.
    pub fn derived_identity(&self) -> TransactionIdentity {
        let mut hasher = Sha256::new();
        hasher.update(self.sender.as_deref().unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(
            self.recipient
                .as_ref()
                .map(Address::plain)
                .unwrap_or_default()
                .as_bytes(),
        );
        hasher.update(b"|");
        hasher.update(self.amount.unwrap_or_default().to_be_bytes());
        hasher.update(b"|");
        hasher.update(self.fee.unwrap_or_default().to_be_bytes());
        hasher.update(b"|");
        hasher.update(self.time_stamp.unwrap_or_default().to_be_bytes());
        hasher.update(b"|");
        if let Some(message) = &self.message {
            hasher.update(message.payload().as_bytes());
        }
        for mosaic in &self.mosaics {
            hasher.update(b"|");
            hasher.update(mosaic.mosaic_id.namespace_id.as_bytes());
            hasher.update(b":");
            hasher.update(mosaic.mosaic_id.name.as_bytes());
            hasher.update(b"=");
            hasher.update(mosaic.quantity.to_be_bytes());
        }
        TransactionIdentity::Derived(hex::encode(hasher.finalize()))
    }
}

/// One transaction notification received on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    pub key: SubscriptionKey,
    pub hash: Option<String>,
    pub payload: TransferPayload,
}

impl EventFrame {
    pub fn new(key: SubscriptionKey, hash: Option<String>, payload: TransferPayload) -> Self {
        Self { key, hash, payload }
    }

    pub fn channel(&self) -> ChannelKind {
        self.key.channel
    }

    pub fn address(&self) -> &Address {
        &self.key.address
    }

    /// The primary identity: the hash if the node sent one, otherwise the derived one.
    pub fn identity(&self) -> TransactionIdentity {
        match &self.hash {
            Some(hash) => TransactionIdentity::Hash(hash.clone()),
            None => self.payload.derived_identity(),
        }
    }

    /// Decodes a NIS transaction/metadata pair as pushed on a subscription.
    pub fn parse(key: SubscriptionKey, body: &str) -> Result<Self, ConnectorError> {
        let pair: RawTransactionPair = serde_json::from_str(body)?;
        let hash = pair
            .meta
            .as_ref()
            .and_then(|meta| meta.hash.as_ref())
            .map(|hash| hash.data.clone())
            .filter(|hash| !hash.is_empty());
        let height = match key.channel {
            ChannelKind::Confirmed => pair.meta.as_ref().and_then(|meta| meta.height),
            ChannelKind::Unconfirmed => None,
        };

        let mut transfer = pair.transaction;
        if transfer.kind == Some(MULTISIG_TRANSACTION_TYPE) {
            if let Some(inner) = transfer.other_trans.take() {
                transfer = *inner;
            }
        }

        let payload = TransferPayload {
            sender: transfer.signer,
            recipient: transfer
                .recipient
                .as_deref()
                .map(Address::new)
                .transpose()?,
            amount: transfer.amount,
            fee: transfer.fee,
            message: transfer
                .message
                .as_ref()
                .map(PlainMessage::cast)
                .transpose()?,
            mosaics: transfer.mosaics.unwrap_or_default(),
            time_stamp: transfer.time_stamp,
            height,
        };

        Ok(Self { key, hash, payload })
    }
}

/// A correlated, deduplicated notification for one confirmed transfer
/// touching a watched address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmedTransfer {
    /// The watched address the notification is delivered for.
    pub address: Address,
    pub identity: TransactionIdentity,
    pub hash: Option<String>,
    #[serde(flatten)]
    pub payload: TransferPayload,
}

#[derive(Debug, Deserialize)]
struct RawTransactionPair {
    meta: Option<RawMeta>,
    transaction: RawTransaction,
}

#[derive(Debug, Deserialize)]
struct RawMeta {
    hash: Option<RawHash>,
    height: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawHash {
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    #[serde(rename = "type")]
    kind: Option<u16>,
    time_stamp: Option<u32>,
    amount: Option<u64>,
    fee: Option<u64>,
    recipient: Option<String>,
    signer: Option<String>,
    message: Option<Value>,
    mosaics: Option<Vec<Mosaic>>,
    other_trans: Option<Box<RawTransaction>>,
}
