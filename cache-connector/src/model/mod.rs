//! Transfer primitives bound to the CACHE token: addresses, messages,
//! mosaics, time windows and the transfer transaction with its factories.

mod address;
mod message;
mod mosaic;
mod time_window;
mod transaction;

pub use address::{Address, NetworkType};
pub use message::{PlainMessage, PLAIN_MESSAGE_TYPE};
pub use mosaic::{Mosaic, MosaicId, TokenDescriptor};
pub use time_window::{from_nem_seconds, to_nem_seconds, ExpirationType, TimeWindow, NEM_EPOCH_UNIX};
pub use transaction::{TransferTransaction, TRANSFER_TRANSACTION_TYPE};
