//! Inbound event bus.
//!
//! A bounded queue between event producers and the dispatch workers. Each
//! producing service publishes on its own topic; events without an origin are
//! labelled with the topic they arrived on, or `system` when the topic is not
//! a known service.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::trace;

use super::events::{InboundEvent, SYSTEM_ORIGIN};
use crate::{Error, Result};

pub const TOPIC_TASK: &str = "task";
pub const TOPIC_USER: &str = "user";
pub const TOPIC_AUDIT: &str = "audit";
pub const TOPIC_SYSTEM: &str = SYSTEM_ORIGIN;

const TOPICS: &[&str] = &[TOPIC_TASK, TOPIC_USER, TOPIC_AUDIT, TOPIC_SYSTEM];

/// Shared receiving end; workers take turns waiting on it.
pub type EventReceiver = Arc<Mutex<mpsc::Receiver<InboundEvent>>>;

#[derive(Clone)]
pub struct EventBus {
    sender: mpsc::Sender<InboundEvent>,
    receiver: EventReceiver,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Map a topic (or origin) name to a known topic, falling back to `system`.
    pub fn topic_for_origin(origin: Option<&str>) -> &'static str {
        let Some(origin) = origin.map(str::trim) else {
            return TOPIC_SYSTEM;
        };
        TOPICS
            .iter()
            .find(|t| t.eq_ignore_ascii_case(origin))
            .copied()
            .unwrap_or(TOPIC_SYSTEM)
    }

    fn label(topic: &str, event: &mut InboundEvent) {
        let missing = event
            .service_origin
            .as_deref()
            .is_none_or(|o| o.trim().is_empty());
        if missing {
            event.service_origin = Some(Self::topic_for_origin(Some(topic)).to_string());
        }
    }

    /// Publish an event, waiting for queue space.
    pub async fn publish(&self, topic: &str, mut event: InboundEvent) -> Result<()> {
        Self::label(topic, &mut event);
        trace!(topic, event_id = %event.event_id, "Publishing event");
        self.sender
            .send(event)
            .await
            .map_err(|_| Error::Other("Event bus closed".to_string()))
    }

    /// Publish without waiting. Fails when the queue is full.
    pub fn try_publish(&self, topic: &str, mut event: InboundEvent) -> Result<()> {
        Self::label(topic, &mut event);
        self.sender.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Other("Event bus full".to_string()),
            mpsc::error::TrySendError::Closed(_) => Error::Other("Event bus closed".to_string()),
        })
    }

    /// Number of events waiting in the queue.
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn receiver(&self) -> EventReceiver {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::events::NotificationType;

    fn event() -> InboundEvent {
        InboundEvent::new(NotificationType::UserRegistered, 1, "Welcome", "Hi")
    }

    #[test]
    fn test_topic_for_origin() {
        assert_eq!(EventBus::topic_for_origin(Some("Task")), TOPIC_TASK);
        assert_eq!(EventBus::topic_for_origin(Some("audit")), TOPIC_AUDIT);
        assert_eq!(EventBus::topic_for_origin(Some("billing")), TOPIC_SYSTEM);
        assert_eq!(EventBus::topic_for_origin(None), TOPIC_SYSTEM);
    }

    #[tokio::test]
    async fn test_publish_labels_missing_origin() {
        let bus = EventBus::new(8);
        bus.publish("user", event()).await.unwrap();
        bus.publish("billing", event()).await.unwrap();
        bus.publish("user", event().with_origin("audit"))
            .await
            .unwrap();
        assert_eq!(bus.len(), 3);

        let rx = bus.receiver();
        let mut rx = rx.lock().await;
        assert_eq!(rx.recv().await.unwrap().origin(), TOPIC_USER);
        assert_eq!(rx.recv().await.unwrap().origin(), TOPIC_SYSTEM);
        assert_eq!(rx.recv().await.unwrap().origin(), TOPIC_AUDIT);
    }

    #[tokio::test]
    async fn test_try_publish_reports_full_queue() {
        let bus = EventBus::new(1);
        bus.try_publish("task", event()).unwrap();
        assert!(bus.try_publish("task", event()).is_err());
    }
}
