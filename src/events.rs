//! Informational lifecycle events
//!
//! Every event is logged through `tracing` and broadcast to any observers
//! that subscribed through [`EventBus::subscribe`]. Nothing in the
//! connection core depends on an event being received.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the broadcast channel; slow observers see `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServiceEvent {
    Connecting { service: String },
    Connected { service: String },
    Disconnecting { service: String },
    Disconnected { service: String },
    /// A stream reached its end without being cancelled
    SubscriptionEnded { service: String, subscription: String },
    Unsubscribing { service: String, subscription: String },
    Unsubscribed { service: String, subscription: String },
}

impl ServiceEvent {
    pub fn service(&self) -> &str {
        match self {
            Self::Connecting { service }
            | Self::Connected { service }
            | Self::Disconnecting { service }
            | Self::Disconnected { service }
            | Self::SubscriptionEnded { service, .. }
            | Self::Unsubscribing { service, .. }
            | Self::Unsubscribed { service, .. } => service,
        }
    }

    pub fn subscription(&self) -> Option<&str> {
        match self {
            Self::SubscriptionEnded { subscription, .. }
            | Self::Unsubscribing { subscription, .. }
            | Self::Unsubscribed { subscription, .. } => Some(subscription),
            _ => None,
        }
    }
}

/// Fan-out of [`ServiceEvent`]s for one service
#[derive(Debug, Clone)]
pub struct EventBus {
    service: String,
    tx: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
    pub fn new(service: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            service: service.into(),
            tx,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    pub fn connecting(&self) {
        self.emit(ServiceEvent::Connecting {
            service: self.service.clone(),
        });
    }

    pub fn connected(&self) {
        self.emit(ServiceEvent::Connected {
            service: self.service.clone(),
        });
    }

    pub fn disconnecting(&self) {
        self.emit(ServiceEvent::Disconnecting {
            service: self.service.clone(),
        });
    }

    pub fn disconnected(&self) {
        self.emit(ServiceEvent::Disconnected {
            service: self.service.clone(),
        });
    }

    pub fn subscription_ended(&self, subscription: &str) {
        self.emit(ServiceEvent::SubscriptionEnded {
            service: self.service.clone(),
            subscription: subscription.to_string(),
        });
    }

    pub fn unsubscribing(&self, subscription: &str) {
        self.emit(ServiceEvent::Unsubscribing {
            service: self.service.clone(),
            subscription: subscription.to_string(),
        });
    }

    pub fn unsubscribed(&self, subscription: &str) {
        self.emit(ServiceEvent::Unsubscribed {
            service: self.service.clone(),
            subscription: subscription.to_string(),
        });
    }

    fn emit(&self, event: ServiceEvent) {
        match event.subscription() {
            Some(subscription) => info!(
                service = %self.service,
                subscription = %subscription,
                event = ?event,
                "Service event"
            ),
            None => info!(service = %self.service, event = ?event, "Service event"),
        }

        // No receivers is fine; events are informational
        if self.tx.send(event).is_err() {
            debug!(service = %self.service, "No event observers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_observers() {
        let bus = EventBus::new("alice");
        let mut rx = bus.subscribe();

        bus.connecting();
        bus.unsubscribing("invoices");

        assert_eq!(
            rx.recv().await.unwrap(),
            ServiceEvent::Connecting {
                service: "alice".to_string()
            }
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.service(), "alice");
        assert_eq!(event.subscription(), Some("invoices"));
    }

    #[test]
    fn test_emit_without_observers() {
        let bus = EventBus::new("alice");
        bus.disconnected();
    }

    #[test]
    fn test_event_serialization() {
        let event = ServiceEvent::SubscriptionEnded {
            service: "alice".to_string(),
            subscription: "invoices".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "subscription_ended");
        assert_eq!(json["subscription"], "invoices");
    }
}
