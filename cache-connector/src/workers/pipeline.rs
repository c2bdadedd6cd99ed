use crate::correlator::Correlator;
use crate::dispatcher::Dispatcher;
use crate::error::{ListenerError, SubscriptionError};
use crate::registry::SubscriptionRegistry;
use crate::transport::SessionEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

/// Reads session events in arrival order, correlates them and hands every
/// confirmed transfer to dispatch. Also runs the correlator's TTL sweep.
pub struct Pipeline {
    correlator: Correlator,
    events_rx: mpsc::Receiver<SessionEvent>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<SubscriptionRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    sweep_interval: Duration,
}

impl Pipeline {
    pub fn new(
        correlator: Correlator,
        events_rx: mpsc::Receiver<SessionEvent>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<SubscriptionRegistry>,
        shutdown_rx: watch::Receiver<bool>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            correlator,
            events_rx,
            dispatcher,
            registry,
            shutdown_rx,
            sweep_interval,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("Pipeline started. Waiting for session events...");
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        tracing::info!("All sessions gone. Pipeline shutting down.");
                        break;
                    }
                },
                _ = sweep.tick() => {
                    self.correlator.evict_expired(Instant::now());
                },
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        tracing::info!("Received shutdown signal. Pipeline exiting.");
                        break;
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Frame(frame) => {
                if let Some(transfer) = self.correlator.on_frame(frame, Instant::now()) {
                    let delivered = self.dispatcher.dispatch(&transfer);
                    tracing::debug!(
                        "[CONFIRMED] {} for {} delivered to {} observer(s)",
                        transfer.identity,
                        transfer.address,
                        delivered
                    );
                }
            }
            SessionEvent::Reconnected { endpoint } => {
                tracing::info!("Session resumed on {}", endpoint);
            }
            SessionEvent::Rejected { key, reason } => {
                self.registry.forget(&key);
                self.dispatcher
                    .report(ListenerError::Subscription(SubscriptionError::Rejected {
                        key,
                        reason,
                    }));
            }
            SessionEvent::Lost { attempts, error } => {
                tracing::error!("Session lost after {} attempts: {}", attempts, error);
                self.dispatcher
                    .report(ListenerError::SessionLost { attempts, error });
            }
        }
    }
}
