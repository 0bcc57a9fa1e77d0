//! Subscription registry
//!
//! Tracks the named streaming calls of one service. Each registered call is
//! pumped by its own task, which forwards messages to a handler and removes
//! the entry once the call reaches a terminal status.
//!
//! Cancelling is a two-step protocol: request the cancel, then wait for the
//! call to report its terminal status. A cancel future resolves only on that
//! confirmation, never when the request is merely sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{oneshot, watch, Mutex};
use tonic::Code;
use tracing::{debug, trace, warn};

use crate::error::{NodeLinkError, Result};
use crate::events::EventBus;
use crate::transport::StreamingCall;

/// Receives the messages of a subscription
pub trait StreamHandler: Send + Sync + 'static {
    fn on_message(&self, subscription: &str, message: Bytes);
}

impl<F> StreamHandler for F
where
    F: Fn(&str, Bytes) + Send + Sync + 'static,
{
    fn on_message(&self, subscription: &str, message: Bytes) {
        self(subscription, message)
    }
}

/// How a pumped call finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    /// Clean end of stream
    Ended,
    /// Terminal status reported by the call
    Status(Code),
}

struct Entry {
    generation: u64,
    cancel: Option<oneshot::Sender<()>>,
    finished: watch::Receiver<Option<Finish>>,
}

/// Named streaming calls of one service
#[derive(Clone)]
pub struct SubscriptionRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    next_generation: Arc<AtomicU64>,
    events: EventBus,
}

impl SubscriptionRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(0)),
            events,
        }
    }

    /// Register a streaming call under `name` and start pumping it
    pub async fn register(
        &self,
        name: &str,
        call: StreamingCall,
        handler: impl StreamHandler,
    ) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(name) {
            let mut call = call;
            call.cancel();
            return Err(NodeLinkError::DuplicateSubscription(name.to_string()));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = watch::channel(None);

        entries.insert(
            name.to_string(),
            Entry {
                generation,
                cancel: Some(cancel_tx),
                finished: finished_rx,
            },
        );

        tokio::spawn(pump(
            self.clone(),
            name.to_string(),
            generation,
            call,
            cancel_rx,
            finished_tx,
            Box::new(handler),
        ));

        debug!(service = %self.events.service(), subscription = %name, "Subscription registered");
        Ok(())
    }

    /// Cancel one subscription and wait for the cancellation to be confirmed.
    ///
    /// Resolves immediately when nothing is registered under `name`.
    pub async fn cancel_one(&self, name: &str) {
        let (cancel, mut finished) = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(name) else {
                return;
            };
            // Capture the confirmation before the cancel request goes out
            (entry.cancel.take(), entry.finished.clone())
        };

        let initiated = cancel.is_some();
        if let Some(cancel) = cancel {
            self.events.unsubscribing(name);
            // The pump may already have finished; the watch still resolves
            let _ = cancel.send(());
        }

        let finish = match finished.wait_for(Option::is_some).await {
            Ok(finish) => *finish,
            // Pump task gone without reporting; nothing is left to cancel
            Err(_) => None,
        };

        match finish {
            Some(Finish::Status(Code::Cancelled)) => {
                trace!(service = %self.events.service(), subscription = %name, "Cancellation confirmed");
            }
            other => {
                debug!(
                    service = %self.events.service(),
                    subscription = %name,
                    finish = ?other,
                    "Stream ended during cancellation"
                );
            }
        }

        if initiated {
            self.events.unsubscribed(name);
        }
    }

    /// Cancel every subscription concurrently
    pub async fn cancel_all(&self) {
        let names = self.names().await;
        if names.is_empty() {
            return;
        }

        futures::future::join_all(names.iter().map(|name| self.cancel_one(name))).await;
    }

    /// Registered subscription names, sorted
    pub async fn names(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.entries.lock().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drop the entry if it still belongs to `generation`
    async fn remove(&self, name: &str, generation: u64) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(name) {
            Some(entry) if entry.generation == generation => {
                entries.remove(name);
                true
            }
            _ => false,
        }
    }
}

async fn pump(
    registry: SubscriptionRegistry,
    name: String,
    generation: u64,
    mut call: StreamingCall,
    mut cancel_rx: oneshot::Receiver<()>,
    finished_tx: watch::Sender<Option<Finish>>,
    handler: Box<dyn StreamHandler>,
) {
    let mut listening = true;
    let mut cancelling = false;

    let finish = loop {
        tokio::select! {
            biased;
            request = &mut cancel_rx, if listening => {
                listening = false;
                // A dropped sender is not a cancel request
                if request.is_ok() {
                    cancelling = true;
                    call.cancel();
                }
            }
            message = call.next() => match message {
                Some(Ok(message)) => {
                    if !cancelling {
                        handler.on_message(&name, message);
                    }
                }
                Some(Err(status)) => {
                    if status.code() != Code::Cancelled && !cancelling {
                        warn!(
                            service = %registry.events.service(),
                            subscription = %name,
                            code = ?status.code(),
                            message = %status.message(),
                            "Stream failed"
                        );
                    }
                    break Finish::Status(status.code());
                }
                None => break Finish::Ended,
            },
        }
    };

    let removed = registry.remove(&name, generation).await;
    if removed && !call.is_cancel_requested() {
        registry.events.subscription_ended(&name);
    }

    let _ = finished_tx.send(Some(finish));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ServiceEvent;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tonic::Status;

    /// Stream whose terminal status the test controls
    fn controlled_call() -> (StreamingCall, mpsc::UnboundedSender<Result<Bytes, Status>>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = cancels.clone();
        let messages = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let call = StreamingCall::new(Box::pin(messages), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (call, tx, cancels)
    }

    fn ignore(_: &str, _: Bytes) {}

    #[tokio::test]
    async fn test_cancel_all_on_empty_registry_is_immediate() {
        let bus = EventBus::new("alice");
        let mut rx = bus.subscribe();
        let registry = SubscriptionRegistry::new(bus);

        tokio::time::timeout(Duration::from_millis(100), registry.cancel_all())
            .await
            .expect("resolves immediately");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_one_unknown_name_is_noop() {
        let registry = SubscriptionRegistry::new(EventBus::new("alice"));
        tokio::time::timeout(Duration::from_millis(100), registry.cancel_one("nope"))
            .await
            .expect("resolves immediately");
    }

    #[tokio::test]
    async fn test_messages_reach_handler() {
        let registry = SubscriptionRegistry::new(EventBus::new("alice"));
        let (call, tx, _) = controlled_call();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        registry
            .register("invoices", call, move |name: &str, message: Bytes| {
                let _ = seen_tx.send((name.to_string(), message));
            })
            .await
            .unwrap();

        tx.send(Ok(Bytes::from_static(b"\x08\x01"))).unwrap();
        let (name, message) = seen_rx.recv().await.unwrap();
        assert_eq!(name, "invoices");
        assert_eq!(message, Bytes::from_static(b"\x08\x01"));
    }

    #[tokio::test]
    async fn test_natural_end_removes_entry_and_emits_once() {
        let bus = EventBus::new("alice");
        let mut rx = bus.subscribe();
        let registry = SubscriptionRegistry::new(bus);
        let (call, tx, _) = controlled_call();

        registry.register("x", call, ignore).await.unwrap();
        assert!(registry.contains("x").await);

        drop(tx);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            ServiceEvent::SubscriptionEnded {
                service: "alice".to_string(),
                subscription: "x".to_string()
            }
        );
        assert!(!registry.contains("x").await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_waits_for_confirmation() {
        let registry = SubscriptionRegistry::new(EventBus::new("alice"));
        let (call, tx, cancels) = controlled_call();
        registry.register("x", call, ignore).await.unwrap();

        let cancelling = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.cancel_one("x").await })
        };

        // Cancel request sent, but no confirmation yet
        while cancels.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!cancelling.is_finished());
        assert!(registry.contains("x").await);

        tx.send(Err(Status::cancelled("Cancelled on client"))).unwrap();
        cancelling.await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_natural_end_during_cancel_counts_as_cancelled() {
        let bus = EventBus::new("alice");
        let mut rx = bus.subscribe();
        let registry = SubscriptionRegistry::new(bus);
        let (call, tx, cancels) = controlled_call();
        registry.register("x", call, ignore).await.unwrap();

        let cancelling = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.cancel_one("x").await })
        };
        while cancels.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        drop(tx);
        cancelling.await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event);
        }
        assert!(kinds
            .iter()
            .all(|e| !matches!(e, ServiceEvent::SubscriptionEnded { .. })));
        assert!(kinds
            .iter()
            .any(|e| matches!(e, ServiceEvent::Unsubscribed { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = SubscriptionRegistry::new(EventBus::new("alice"));
        let (first, _tx1, _) = controlled_call();
        let (second, _tx2, second_cancels) = controlled_call();

        registry.register("x", first, ignore).await.unwrap();
        let err = registry.register("x", second, ignore).await.unwrap_err();
        assert!(matches!(err, NodeLinkError::DuplicateSubscription(_)));
        assert_eq!(second_cancels.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_all_empties_registry() {
        let registry = SubscriptionRegistry::new(EventBus::new("alice"));
        let mut senders = Vec::new();
        for name in ["a", "b", "c"] {
            let (call, tx, _) = controlled_call();
            registry.register(name, call, ignore).await.unwrap();
            senders.push(tx);
        }

        let cancelling = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.cancel_all().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!cancelling.is_finished());

        for tx in &senders {
            tx.send(Err(Status::cancelled("Cancelled on client"))).unwrap();
        }
        cancelling.await.unwrap();
        assert!(registry.is_empty().await);
    }
}
