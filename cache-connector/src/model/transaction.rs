use crate::error::ModelError;
use crate::model::{Address, Mosaic, PlainMessage, TimeWindow};
use serde::Serialize;
use serde_json::Value;

/// NIS transaction type for transfers.
pub const TRANSFER_TRANSACTION_TYPE: u16 = 0x0101;

/// Fee step in micro-XEM (0.05 XEM).
const FEE_UNIT: u64 = 50_000;
/// Mosaic transfers carry a 1.000000 multiplier in the amount field.
const MOSAIC_MULTIPLIER: u64 = 1_000_000;
const MICRO_XEM: u64 = 1_000_000;

/// An unsigned transfer, either of plain XEM (version 1) or of mosaics (version 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTransaction {
    pub recipient: Address,
    /// Absolute micro-XEM for version 1, the mosaic multiplier for version 2.
    pub amount: u64,
    pub time_window: TimeWindow,
    pub version: u8,
    pub fee: u64,
    pub message: PlainMessage,
    pub mosaics: Vec<Mosaic>,
}

impl TransferTransaction {
    /// A plain XEM transfer of `amount` micro-XEM.
    pub fn create_with_xem(
        time_window: TimeWindow,
        recipient: Address,
        amount: u64,
        message: PlainMessage,
    ) -> Self {
        let fee = xem_transfer_fee(amount) + message_fee(&message);
        Self {
            recipient,
            amount,
            time_window,
            version: 1,
            fee,
            message,
            mosaics: Vec::new(),
        }
    }

    /// A mosaic transfer carrying every mosaic in `mosaics`.
    pub fn create_with_mosaics(
        time_window: TimeWindow,
        recipient: Address,
        mosaics: Vec<Mosaic>,
        message: PlainMessage,
    ) -> Result<Self, ModelError> {
        if mosaics.is_empty() {
            return Err(ModelError::NoMosaics);
        }
        let fee = FEE_UNIT * mosaics.len() as u64 + message_fee(&message);
        Ok(Self {
            recipient,
            amount: MOSAIC_MULTIPLIER,
            time_window,
            version: 2,
            fee,
            message,
            mosaics,
        })
    }

    /// Transfers a single token: `nem:xem` goes out as a plain XEM transfer,
    /// any other mosaic (CACHE included) as a mosaic transfer.
    pub fn create_with_token(
        time_window: TimeWindow,
        recipient: Address,
        mosaic: Mosaic,
        message: PlainMessage,
    ) -> Result<Self, ModelError> {
        if mosaic.mosaic_id.is_xem() {
            Ok(Self::create_with_xem(
                time_window,
                recipient,
                mosaic.quantity,
                message,
            ))
        } else {
            Self::create_with_mosaics(time_window, recipient, vec![mosaic], message)
        }
    }

    /// Rebuilds a transfer from a raw object received from an outside source.
    ///
    /// Reads `recipient`, `message`, `_xem.quantity`, `fee` and the optional
    /// `_mosaics` list; the presence of `_mosaics` selects version 2. The
    /// caller supplies the time window.
    pub fn cast(raw: &Value, time_window: TimeWindow) -> Result<Self, ModelError> {
        let recipient = Address::cast(raw.get("recipient").ok_or(ModelError::MissingField("recipient"))?)?;
        let message = match raw.get("message") {
            Some(message) => PlainMessage::cast(message)?,
            None => PlainMessage::empty(),
        };
        let amount = raw
            .get("_xem")
            .and_then(|xem| xem.get("quantity"))
            .ok_or(ModelError::MissingField("_xem.quantity"))?
            .as_u64()
            .ok_or(ModelError::InvalidField { field: "_xem.quantity" })?;
        let fee = match raw.get("fee") {
            Some(fee) => fee
                .as_u64()
                .ok_or(ModelError::InvalidField { field: "fee" })?,
            None => 0,
        };

        let mosaics = match raw.get("_mosaics") {
            Some(Value::Null) | None => None,
            Some(list) => Some(
                serde_json::from_value::<Vec<Mosaic>>(list.clone())
                    .map_err(|_| ModelError::InvalidField { field: "_mosaics" })?,
            ),
        };

        let (version, mosaics) = match mosaics {
            Some(mosaics) => (2, mosaics),
            None => (1, Vec::new()),
        };

        Ok(Self {
            recipient,
            amount,
            time_window,
            version,
            fee,
            message,
            mosaics,
        })
    }

    pub fn contains_mosaics(&self) -> bool {
        !self.mosaics.is_empty()
    }

    /// The mosaics this transfer moves, with plain XEM transfers reported as `nem:xem`.
    pub fn transferred(&self) -> Vec<Mosaic> {
        if self.contains_mosaics() {
            self.mosaics.clone()
        } else {
            vec![crate::model::TokenDescriptor::xem().from_absolute(self.amount)]
        }
    }

    /// The combined NIS version field: network byte in the high byte, version in the low one.
    pub fn network_version(&self) -> u32 {
        ((self.recipient.network().version_byte() as u32) << 24) | self.version as u32
    }
}

fn xem_transfer_fee(amount: u64) -> u64 {
    let whole_xem = amount / MICRO_XEM;
    (whole_xem / 10_000).clamp(1, 25) * FEE_UNIT
}

fn message_fee(message: &PlainMessage) -> u64 {
    if message.is_empty() {
        0
    } else {
        (message.len() as u64 / 32 + 1) * FEE_UNIT
    }
}
