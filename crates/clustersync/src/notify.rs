//! Status notification boundary.
//!
//! The readiness engine calls [`StatusNotifier::notify`] whenever an
//! instance's resources become ready (or deployed). How events reach
//! external subscribers is up to the implementation; [`BroadcastNotifier`]
//! fans them out over a tokio broadcast channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// What happened to an app of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusEventKind {
    Deployed,
    Ready,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub instance_id: String,
    pub app: String,
    pub kind: StatusEventKind,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(instance_id: &str, app: &str, kind: StatusEventKind) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            app: app.to_string(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Receives readiness transitions.
pub trait StatusNotifier: Send + Sync {
    fn notify(&self, event: StatusEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl StatusNotifier for NoopNotifier {
    fn notify(&self, _event: StatusEvent) {}
}

/// Fans events out to any number of subscribers.
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<StatusEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    /// Subscribes to the events of one instance only.
    pub fn subscribe_instance(&self, instance_id: &str) -> InstanceSubscription {
        InstanceSubscription {
            instance_id: instance_id.to_string(),
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl StatusNotifier for BroadcastNotifier {
    fn notify(&self, event: StatusEvent) {
        log::debug!(
            "Status event {:?} for app {} of instance {}",
            event.kind,
            event.app,
            event.instance_id
        );
        // No active receivers is fine
        let _ = self.sender.send(event);
    }
}

/// Receiver filtered to one instance id.
pub struct InstanceSubscription {
    instance_id: String,
    receiver: broadcast::Receiver<StatusEvent>,
}

impl InstanceSubscription {
    /// Waits for the next event of the subscribed instance. Returns `None`
    /// once the notifier is dropped.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.instance_id == self.instance_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Status subscriber for instance {} lagged, {} events skipped",
                        self.instance_id,
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_instance_subscription_filters() {
        let notifier = BroadcastNotifier::default();
        let mut sub = notifier.subscribe_instance("2");

        notifier.notify(StatusEvent::new("1", "db", StatusEventKind::Ready));
        notifier.notify(StatusEvent::new("2", "web", StatusEventKind::Ready));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.instance_id, "2");
        assert_eq!(event.app, "web");
    }

    #[test]
    fn test_notify_without_subscribers() {
        let notifier = BroadcastNotifier::new(4);
        notifier.notify(StatusEvent::new("1", "db", StatusEventKind::Deployed));
    }

    #[test]
    fn test_event_serialization() {
        let event = StatusEvent::new("1", "db", StatusEventKind::Ready);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"instanceId\":\"1\""));
        assert!(json.contains("\"kind\":\"ready\""));
    }
}
