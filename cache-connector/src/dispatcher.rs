//! # Observer Dispatch
//!
//! Routes each correlated [`ConfirmedTransfer`] to the observers registered
//! for its watched address, in registration order.
//!
//! ## Guarantees
//! - A failing or panicking observer never prevents delivery to the others;
//!   its failure is reported on the side error channel.
//! - [`Dispatcher::cancel`] is idempotent and a hard barrier: once it
//!   returns, the cancelled observer receives nothing further. Cancelling from
//!   inside the observer's own callback is allowed.
use crate::error::{ListenerError, ObserverError};
use crate::events::ConfirmedTransfer;
use crate::model::Address;
use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// A caller-supplied sink for confirmed transfers.
///
/// Called on the pipeline task while the observer's gate is held. It must not
/// block: hand work off (as [`ChannelObserver`] does) instead. A blocked call
/// stalls the pipeline and every `cancel` of this observer.
pub trait Observer: Send + Sync + 'static {
    fn on_transfer(&self, transfer: &ConfirmedTransfer) -> Result<(), ObserverError>;
}

impl<F> Observer for F
where
    F: Fn(&ConfirmedTransfer) -> Result<(), ObserverError> + Send + Sync + 'static,
{
    fn on_transfer(&self, transfer: &ConfirmedTransfer) -> Result<(), ObserverError> {
        self(transfer)
    }
}

/// An observer that forwards transfers into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver(pub mpsc::UnboundedSender<ConfirmedTransfer>);

impl Observer for ChannelObserver {
    fn on_transfer(&self, transfer: &ConfirmedTransfer) -> Result<(), ObserverError> {
        self.0
            .send(transfer.clone())
            .map_err(|_| ObserverError::Disconnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies one registration; pass it to `cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObserverToken {
    pub id: ObserverId,
    pub address: Address,
}

struct ObserverEntry {
    id: ObserverId,
    observer: Box<dyn Observer>,
    cancelled: AtomicBool,
    /// Held for the duration of every delivery; `cancel` takes it to wait
    /// out an in-flight call.
    gate: ReentrantMutex<()>,
}

pub struct Dispatcher {
    observers: DashMap<Address, Vec<Arc<ObserverEntry>>>,
    next_id: AtomicU64,
    errors_tx: broadcast::Sender<ListenerError>,
}

impl Dispatcher {
    pub fn new(error_buffer: usize) -> Self {
        let (errors_tx, _) = broadcast::channel(error_buffer.max(1));
        Self {
            observers: DashMap::new(),
            next_id: AtomicU64::new(1),
            errors_tx,
        }
    }

    pub fn register(&self, address: Address, observer: impl Observer) -> ObserverToken {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(ObserverEntry {
            id,
            observer: Box::new(observer),
            cancelled: AtomicBool::new(false),
            gate: ReentrantMutex::new(()),
        });
        self.observers
            .entry(address.clone())
            .or_default()
            .push(entry);
        tracing::info!("Registered observer {} for {}", id, address);
        ObserverToken { id, address }
    }

    /// Cancels a registration. Returns `false` if it was already cancelled.
    ///
    /// Blocks until an in-flight delivery to this observer has finished. Async
    /// callers go through `ListenerHandle::cancel`, which waits off the runtime.
    pub fn cancel(&self, token: &ObserverToken) -> bool {
        let mut removed = None;
        self.observers.remove_if_mut(&token.address, |_, entries| {
            if let Some(position) = entries.iter().position(|entry| entry.id == token.id) {
                removed = Some(entries.remove(position));
            }
            entries.is_empty()
        });
        let Some(entry) = removed else {
            return false;
        };

        let _gate = entry.gate.lock();
        entry.cancelled.store(true, Ordering::Release);
        tracing::info!("Cancelled observer {} for {}", token.id, token.address);
        true
    }

    /// Delivers `transfer` to every observer of its address. Returns the
    /// number of observers that accepted it.
    pub fn dispatch(&self, transfer: &ConfirmedTransfer) -> usize {
        let Some(entries) = self
            .observers
            .get(&transfer.address)
            .map(|entries| entries.value().clone())
        else {
            tracing::debug!("No observers for {}; dropping {}", transfer.address, transfer.identity);
            return 0;
        };

        let mut delivered = 0;
        for entry in entries {
            let _gate = entry.gate.lock();
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.observer.on_transfer(transfer)))
                .unwrap_or_else(|payload| Err(ObserverError::Panicked(panic_message(payload))));
            match outcome {
                Ok(()) => delivered += 1,
                Err(error) => {
                    tracing::warn!(
                        "Observer {} for {} failed on {}: {}",
                        entry.id,
                        transfer.address,
                        transfer.identity,
                        error
                    );
                    self.report(ListenerError::Observer {
                        observer: entry.id.0,
                        address: transfer.address.clone(),
                        identity: transfer.identity.clone(),
                        error,
                    });
                }
            }
        }
        delivered
    }

    pub fn observer_count(&self, address: &Address) -> usize {
        self.observers
            .get(address)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn errors(&self) -> broadcast::Receiver<ListenerError> {
        self.errors_tx.subscribe()
    }

    /// Publishes a failure on the side channel. Dropped if nobody listens.
    pub fn report(&self, error: ListenerError) {
        let _ = self.errors_tx.send(error);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{TransactionIdentity, TransferPayload};
    use parking_lot::Mutex;
    use std::sync::OnceLock;

    const WATCHED: &str = "TDU225EF2XRJTDXJZOWPNPKE3K4NYR277EQPOPZD";

    fn transfer(hash: &str) -> ConfirmedTransfer {
        ConfirmedTransfer {
            address: Address::new(WATCHED).unwrap(),
            identity: TransactionIdentity::Hash(hash.to_string()),
            hash: Some(hash.to_string()),
            payload: TransferPayload {
                amount: Some(2),
                ..TransferPayload::default()
            },
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> impl Observer {
        let log = log.clone();
        move |transfer: &ConfirmedTransfer| -> Result<(), ObserverError> {
            log.lock().push(format!("{}:{}", name, transfer.identity));
            Ok(())
        }
    }

    #[test]
    fn delivers_in_registration_order() {
        let dispatcher = Dispatcher::new(8);
        let log = Arc::new(Mutex::new(Vec::new()));
        let address = Address::new(WATCHED).unwrap();
        dispatcher.register(address.clone(), recorder(&log, "first"));
        dispatcher.register(address, recorder(&log, "second"));

        assert_eq!(dispatcher.dispatch(&transfer("tx1")), 2);
        assert_eq!(*log.lock(), vec!["first:tx1", "second:tx1"]);
    }

    #[test]
    fn failures_are_isolated_and_reported() {
        let dispatcher = Dispatcher::new(8);
        let mut errors = dispatcher.errors();
        let log = Arc::new(Mutex::new(Vec::new()));
        let address = Address::new(WATCHED).unwrap();

        dispatcher.register(address.clone(), |_: &ConfirmedTransfer| -> Result<(), ObserverError> {
            Err(ObserverError::Failed("boom".to_string()))
        });
        dispatcher.register(address.clone(), |_: &ConfirmedTransfer| -> Result<(), ObserverError> {
            panic!("observer bug")
        });
        dispatcher.register(address, recorder(&log, "healthy"));

        assert_eq!(dispatcher.dispatch(&transfer("tx1")), 1);
        assert_eq!(*log.lock(), vec!["healthy:tx1"]);

        match errors.try_recv().unwrap() {
            ListenerError::Observer { error, .. } => {
                assert_eq!(error, ObserverError::Failed("boom".to_string()))
            }
            other => panic!("unexpected error {:?}", other),
        }
        match errors.try_recv().unwrap() {
            ListenerError::Observer { error, .. } => {
                assert_eq!(error, ObserverError::Panicked("observer bug".to_string()))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn cancel_is_idempotent() {
        let dispatcher = Dispatcher::new(8);
        let log = Arc::new(Mutex::new(Vec::new()));
        let token = dispatcher.register(Address::new(WATCHED).unwrap(), recorder(&log, "a"));

        assert!(dispatcher.cancel(&token));
        assert!(!dispatcher.cancel(&token));
        assert_eq!(dispatcher.dispatch(&transfer("tx1")), 0);
        assert!(log.lock().is_empty());
        assert_eq!(dispatcher.observer_count(&token.address), 0);
    }

    #[test]
    fn observer_may_cancel_itself_mid_delivery() {
        let dispatcher = Arc::new(Dispatcher::new(8));
        let token_cell: Arc<OnceLock<ObserverToken>> = Arc::new(OnceLock::new());
        let calls = Arc::new(AtomicU64::new(0));

        let observer = {
            let dispatcher = Arc::downgrade(&dispatcher);
            let token_cell = token_cell.clone();
            let calls = calls.clone();
            move |_: &ConfirmedTransfer| -> Result<(), ObserverError> {
                calls.fetch_add(1, Ordering::SeqCst);
                if let (Some(dispatcher), Some(token)) = (dispatcher.upgrade(), token_cell.get()) {
                    dispatcher.cancel(token);
                }
                Ok(())
            }
        };
        let token = dispatcher.register(Address::new(WATCHED).unwrap(), observer);
        token_cell.set(token).unwrap();

        dispatcher.dispatch(&transfer("tx1"));
        dispatcher.dispatch(&transfer("tx2"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn channel_observer_reports_a_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = ChannelObserver(tx);
        drop(rx);
        assert_eq!(
            observer.on_transfer(&transfer("tx1")),
            Err(ObserverError::Disconnected)
        );
    }
}
