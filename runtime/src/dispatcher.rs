//! Post-commit event delivery.
//!
//! Each subscription owns a bounded queue and a worker task, so a slow
//! listener only delays itself. Dispatch never fails the operation that
//! produced the event: a full or closed queue is logged and counted, and a
//! listener error is logged and counted without reaching the caller.
//!
//! # Example
//!
//! ```ignore
//! let dispatcher = EventDispatcher::new(1024, clock);
//! dispatcher.subscribe(&[EventKind::CoordinationCut], Arc::new(loyalty));
//!
//! dispatcher.dispatch(event);
//! dispatcher.wait_idle().await;
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use waybill_flow_core::environment::Clock;
use waybill_flow_core::error::DocumentError;
use waybill_flow_core::event::{DocumentEvent, EventEnvelope, EventKind};
use waybill_flow_core::providers::ProviderError;

/// Failure reported by a listener.
#[derive(Error, Debug)]
pub enum ListenerError {
    /// An external collaborator failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A document operation failed.
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Consumer of dispatched events.
pub trait EventListener: Send + Sync + 'static {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Handle one event. Delivery is at-least-once; handlers must tolerate
    /// seeing the same envelope twice.
    ///
    /// # Errors
    ///
    /// Returns a [`ListenerError`], which the dispatcher logs and counts.
    fn handle<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), ListenerError>> + Send + 'a>>;
}

/// Delivery counters.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    dispatched: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Envelopes queued for a listener.
    pub dispatched: u64,
    /// Envelopes discarded because a queue was full or closed.
    pub dropped: u64,
    /// Envelopes handled successfully.
    pub delivered: u64,
    /// Envelopes whose listener returned an error.
    pub failed: u64,
}

impl DispatcherStats {
    /// Read every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct Subscription {
    listener: &'static str,
    kinds: BTreeSet<EventKind>,
    sender: mpsc::Sender<EventEnvelope>,
}

struct Inner {
    capacity: usize,
    clock: Arc<dyn Clock>,
    subscriptions: RwLock<Vec<Subscription>>,
    stats: DispatcherStats,
    in_flight: AtomicUsize,
    idle: watch::Sender<()>,
}

impl Inner {
    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.idle.send(());
        }
    }
}

/// Guard that marks one delivery complete on drop, even if the listener panics.
struct InFlightGuard(Arc<Inner>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.finish_one();
    }
}

/// Routes committed events to subscribed listeners.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("capacity", &self.inner.capacity)
            .field("in_flight", &self.inner.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    /// Create a dispatcher whose subscriptions buffer up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let (idle, _) = watch::channel(());
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                clock,
                subscriptions: RwLock::new(Vec::new()),
                stats: DispatcherStats::default(),
                in_flight: AtomicUsize::new(0),
                idle,
            }),
        }
    }

    /// Subscribe `listener` to `kinds`, spawning its worker task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, kinds: &[EventKind], listener: Arc<dyn EventListener>) {
        let (sender, mut receiver) = mpsc::channel::<EventEnvelope>(self.inner.capacity);
        let name = listener.name();
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let _guard = InFlightGuard(Arc::clone(&inner));
                match listener.handle(&envelope).await {
                    Ok(()) => {
                        inner.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    },
                    Err(error) => {
                        inner.stats.failed.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!(crate::metrics::LISTENER_FAILURES, "listener" => name)
                            .increment(1);
                        tracing::error!(
                            listener = name,
                            event_id = %envelope.event_id,
                            event_type = envelope.event.event_type(),
                            error = %error,
                            "Listener failed"
                        );
                    },
                }
            }
            tracing::debug!(listener = name, "Listener worker stopped");
        });

        self.inner
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                listener: name,
                kinds: kinds.iter().copied().collect(),
                sender,
            });
        tracing::info!(listener = name, ?kinds, "Listener subscribed");
    }

    /// Wrap `event` in an envelope and queue it for every subscriber of its kind.
    pub fn dispatch(&self, event: DocumentEvent) -> EventEnvelope {
        let envelope = EventEnvelope::new(event, self.inner.clock.now());
        let kind = envelope.kind();
        let subscriptions = self
            .inner
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        for subscription in subscriptions.iter().filter(|s| s.kinds.contains(&kind)) {
            self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
            match subscription.sender.try_send(envelope.clone()) {
                Ok(()) => {
                    self.inner.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(crate::metrics::EVENTS_DISPATCHED, "event" => kind.event_type())
                        .increment(1);
                },
                Err(error) => {
                    self.inner.finish_one();
                    self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(crate::metrics::EVENTS_DROPPED, "listener" => subscription.listener)
                        .increment(1);
                    let reason = match error {
                        mpsc::error::TrySendError::Full(_) => "queue full",
                        mpsc::error::TrySendError::Closed(_) => "queue closed",
                    };
                    tracing::warn!(
                        listener = subscription.listener,
                        event_id = %envelope.event_id,
                        event_type = kind.event_type(),
                        reason,
                        "Event dropped"
                    );
                },
            }
        }
        envelope
    }

    /// Dispatch several events in order.
    pub fn dispatch_all(&self, events: impl IntoIterator<Item = DocumentEvent>) {
        for event in events {
            self.dispatch(event);
        }
    }

    /// Wait until every queued event has been handled.
    ///
    /// Events dispatched by listeners while draining are waited for too.
    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        while self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            if idle.changed().await.is_err() {
                break;
            }
        }
    }

    /// [`wait_idle`](Self::wait_idle) with a deadline. Returns `false` on timeout.
    pub async fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_idle()).await.is_ok()
    }

    /// Delivery counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Events queued or being handled right now.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}
