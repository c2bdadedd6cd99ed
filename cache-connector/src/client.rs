//! # Announcement Gateway
//!
//! The boundary to the collaborators that sign and announce transfers. The
//! listener core never calls them; they are contracts that an application
//! (or the node's HTTP API) fulfils.
//!
//! - [`TransactionSigner`]: turns a [`TransferTransaction`] into a
//!   [`SignedTransaction`].
//! - [`TransactionAnnouncer`]: submits a signed transaction and reports the
//!   node's verdict as an [`AnnounceResult`]. There are no retries here.
//! - [`TransferAnnouncer`]: signs, then announces.

use crate::error::{ConnectorError, ModelError, Result};
use crate::model::TransferTransaction;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// NIS result code of an accepted announcement.
pub const NEUTRAL_SUCCESS_CODE: u32 = 1;

/// A serialized transfer and its signature, both hex encoded, as NIS expects
/// them on `/transaction/announce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub data: String,
    pub signature: String,
}

/// The node's verdict on an announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceOutcome {
    Accepted,
    Rejected { code: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceResult {
    pub kind: u32,
    pub code: u32,
    pub message: String,
    pub transaction_hash: Option<String>,
    pub inner_transaction_hash: Option<String>,
}

impl AnnounceResult {
    /// Parses the NIS announce response:
    /// `{ type, code, message, transactionHash: { data }, innerTransactionHash: { data } }`.
    pub fn cast(raw: &Value) -> Result<Self, ModelError> {
        let number = |field: &'static str| -> Result<u32, ModelError> {
            raw.get(field)
                .ok_or(ModelError::MissingField(field))?
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or(ModelError::InvalidField { field })
        };
        let hash = |field: &str| {
            raw.get(field)
                .and_then(|hash| hash.get("data"))
                .and_then(Value::as_str)
                .filter(|data| !data.is_empty())
                .map(str::to_string)
        };

        Ok(Self {
            kind: number("type")?,
            code: number("code")?,
            message: raw
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            transaction_hash: hash("transactionHash"),
            inner_transaction_hash: hash("innerTransactionHash"),
        })
    }

    pub fn is_accepted(&self) -> bool {
        self.code == NEUTRAL_SUCCESS_CODE
    }

    pub fn outcome(&self) -> AnnounceOutcome {
        if self.is_accepted() {
            AnnounceOutcome::Accepted
        } else {
            AnnounceOutcome::Rejected {
                code: self.code,
                reason: self.message.clone(),
            }
        }
    }
}

/// Signs transfers. Key management is the implementor's concern.
pub trait TransactionSigner: Send + Sync {
    fn sign(&self, transaction: &TransferTransaction) -> Result<SignedTransaction>;
}

/// Submits signed transactions to a node.
#[async_trait]
pub trait TransactionAnnouncer: Send + Sync {
    async fn announce(&self, transaction: &SignedTransaction) -> Result<AnnounceResult, ConnectorError>;
}

/// Signs a transfer and announces it in one step.
pub struct TransferAnnouncer<A: TransactionAnnouncer + ?Sized, S: TransactionSigner + ?Sized> {
    announcer: Arc<A>,
    signer: Arc<S>,
}

impl<A, S> Clone for TransferAnnouncer<A, S>
where
    A: TransactionAnnouncer + ?Sized,
    S: TransactionSigner + ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            announcer: self.announcer.clone(),
            signer: self.signer.clone(),
        }
    }
}

impl<A, S> TransferAnnouncer<A, S>
where
    A: TransactionAnnouncer + ?Sized,
    S: TransactionSigner + ?Sized,
{
    pub fn new(announcer: Arc<A>, signer: Arc<S>) -> Self {
        Self { announcer, signer }
    }

    pub async fn send(&self, transaction: &TransferTransaction) -> Result<AnnounceResult> {
        let signed = self.signer.sign(transaction)?;
        let result = self.announcer.announce(&signed).await?;
        match result.outcome() {
            AnnounceOutcome::Accepted => tracing::info!(
                "Transfer to {} accepted (hash {:?})",
                transaction.recipient,
                result.transaction_hash
            ),
            AnnounceOutcome::Rejected { code, ref reason } => tracing::warn!(
                "Transfer to {} rejected with code {}: {}",
                transaction.recipient,
                code,
                reason
            ),
        }
        Ok(result)
    }
}
