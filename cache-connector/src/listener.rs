//! # Address Listeners
//!
//! [`AddressListener`] is the channel-backed way of observing a watched
//! address: it registers itself as an observer, yields every confirmed
//! transfer in order and cancels its registration (releasing the underlying
//! subscriptions) when it is dropped.

use crate::dispatcher::ObserverToken;
use crate::events::ConfirmedTransfer;
use crate::workers::ListenerHandle;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::Stream;

#[derive(Debug)]
pub struct AddressListener {
    transfer_rx: mpsc::UnboundedReceiver<ConfirmedTransfer>,
    /// `None` once the listener was unsubscribed manually.
    registration: Option<(ObserverToken, ListenerHandle)>,
}

impl AddressListener {
    pub(crate) fn new(
        transfer_rx: mpsc::UnboundedReceiver<ConfirmedTransfer>,
        token: ObserverToken,
        handle: ListenerHandle,
    ) -> Self {
        Self {
            transfer_rx,
            registration: Some((token, handle)),
        }
    }

    /// Receives the next confirmed transfer. Returns `None` once the listener
    /// has been cancelled and every buffered transfer was consumed.
    pub async fn next_transfer(&mut self) -> Option<ConfirmedTransfer> {
        self.transfer_rx.recv().await
    }

    /// Receives an already-buffered transfer without waiting.
    pub fn try_next_transfer(&mut self) -> Option<ConfirmedTransfer> {
        self.transfer_rx.try_recv().ok()
    }

    pub fn token(&self) -> Option<&ObserverToken> {
        self.registration.as_ref().map(|(token, _)| token)
    }

    /// Turns the listener into a stream of transfers.
    pub fn into_stream(self) -> impl Stream<Item = ConfirmedTransfer> {
        self
    }

    /// Cancels the registration and waits until its subscriptions are released.
    ///
    /// Consumes the listener; the automatic `Drop` cleanup is skipped.
    pub async fn unsubscribe(mut self) {
        if let Some((token, handle)) = self.registration.take() {
            tracing::debug!("Manual unsubscribe for AddressListener on {}", token.address);
            handle.cancel(&token).await;
        }
    }
}

impl Stream for AddressListener {
    type Item = ConfirmedTransfer;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.transfer_rx.poll_recv(cx)
    }
}

impl Drop for AddressListener {
    fn drop(&mut self) {
        if let Some((token, handle)) = self.registration.take() {
            tracing::debug!(
                "Automatic unsubscribe (on drop) for AddressListener on {}",
                token.address
            );
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        handle.cancel(&token).await;
                    });
                }
                Err(_) => {
                    handle.cancel_detached(&token);
                }
            }
        }
    }
}
