use crate::dispatcher::HandleEvent;
use crate::model::{Topic, WebhookEvent};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

/// Outbound notification to the subscribing seller. The concrete sender
/// (WhatsApp, push, email) lives outside this pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub recipient_id: String,
    pub topic: String,
    pub resource: String,
    pub body: String,
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Fire-and-forget real-time channel for dashboard updates.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, channel: &str, payload: &Value) -> Result<()>;
}

/// Routes claimed events to their topic handlers. Collaborators are injected
/// at construction, never resolved per call.
pub struct TopicRouter {
    notifications: Arc<dyn NotificationSender>,
    events: Arc<dyn EventEmitter>,
}

impl TopicRouter {
    pub fn new(notifications: Arc<dyn NotificationSender>, events: Arc<dyn EventEmitter>) -> Self {
        Self {
            notifications,
            events,
        }
    }

    async fn question_received(&self, event: &WebhookEvent) -> Result<()> {
        self.events
            .emit("questions:new", &realtime_payload(event))
            .await?;
        self.notifications
            .send(&notification_for(
                event,
                format!("New question on {}", event.resource),
            ))
            .await
    }

    async fn order_updated(&self, event: &WebhookEvent) -> Result<()> {
        self.events
            .emit("orders:update", &realtime_payload(event))
            .await?;
        self.notifications
            .send(&notification_for(
                event,
                format!("Order update for {}", event.resource),
            ))
            .await
    }

    async fn item_updated(&self, event: &WebhookEvent) -> Result<()> {
        self.events
            .emit("items:update", &realtime_payload(event))
            .await
    }

    async fn payment_updated(&self, event: &WebhookEvent) -> Result<()> {
        self.events
            .emit("payments:update", &realtime_payload(event))
            .await?;
        self.notifications
            .send(&notification_for(
                event,
                format!("Payment update for {}", event.resource),
            ))
            .await
    }

    async fn message_received(&self, event: &WebhookEvent) -> Result<()> {
        self.events
            .emit("messages:new", &realtime_payload(event))
            .await?;
        self.notifications
            .send(&notification_for(
                event,
                format!("New message on {}", event.resource),
            ))
            .await
    }
}

#[async_trait]
impl HandleEvent for TopicRouter {
    async fn handle(&self, event: &WebhookEvent) -> Result<()> {
        match Topic::parse(&event.topic) {
            Some(Topic::Questions) => self.question_received(event).await,
            Some(Topic::OrdersV2) => self.order_updated(event).await,
            Some(Topic::Items) => self.item_updated(event).await,
            Some(Topic::Payments) => self.payment_updated(event).await,
            Some(Topic::Messages) => self.message_received(event).await,
            // Accepted topics without a dedicated handler complete as no-ops
            // so new marketplace topics never clog the retry queue.
            Some(other) => {
                info!(
                    event_id = %event.event_id,
                    topic = other.as_str(),
                    "no handler for topic; completing as no-op"
                );
                Ok(())
            }
            None => {
                info!(
                    event_id = %event.event_id,
                    topic = %event.topic,
                    "unroutable topic; completing as no-op"
                );
                Ok(())
            }
        }
    }
}

fn notification_for(event: &WebhookEvent, body: String) -> Notification {
    Notification {
        recipient_id: event.sender_id.clone(),
        topic: event.topic.clone(),
        resource: event.resource.clone(),
        body,
    }
}

fn realtime_payload(event: &WebhookEvent) -> Value {
    json!({
        "eventId": event.event_id,
        "topic": event.topic,
        "resource": event.resource,
        "senderId": event.sender_id,
    })
}

/// Default collaborators for deployments where the senders run elsewhere:
/// everything is visible in the logs, nothing leaves the process.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotificationSender;

#[async_trait]
impl NotificationSender for LoggingNotificationSender {
    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            recipient = %notification.recipient_id,
            topic = %notification.topic,
            resource = %notification.resource,
            "notification enqueued"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggingEventEmitter;

#[async_trait]
impl EventEmitter for LoggingEventEmitter {
    async fn emit(&self, channel: &str, payload: &Value) -> Result<()> {
        info!(channel, %payload, "realtime event emitted");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingSender {
        pub sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationSender for RecordingSender {
        async fn send(&self, notification: &Notification) -> Result<()> {
            self.sent
                .lock()
                .expect("sender mutex")
                .push(notification.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingEmitter {
        pub emitted: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl EventEmitter for RecordingEmitter {
        async fn emit(&self, channel: &str, payload: &Value) -> Result<()> {
            self.emitted
                .lock()
                .expect("emitter mutex")
                .push((channel.to_string(), payload.clone()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{RecordingEmitter, RecordingSender};
    use super::*;
    use crate::model::{EventStatus, PRIORITY_NORMAL};

    fn sample_event(topic: &str) -> WebhookEvent {
        WebhookEvent {
            event_id: "event-1".to_string(),
            idempotency_key: "key-a".to_string(),
            topic: topic.to_string(),
            resource: "/questions/123".to_string(),
            sender_id: "456".to_string(),
            application_id: "7890".to_string(),
            attempt_id: None,
            sent_at_epoch: 1_700_000_000,
            received_at_epoch: 1_700_000_001,
            priority: PRIORITY_NORMAL,
            status: EventStatus::Processing,
            attempts: 0,
            visible_at_epoch: 1_700_000_001,
            processed_at_epoch: None,
            last_error: None,
            replay_count: 0,
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn question_handler_emits_and_notifies() {
        let sender = Arc::new(RecordingSender::default());
        let emitter = Arc::new(RecordingEmitter::default());
        let router = TopicRouter::new(sender.clone(), emitter.clone());

        router
            .handle(&sample_event("questions"))
            .await
            .expect("handled");

        let sent = sender.sent.lock().expect("sent");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient_id, "456");
        assert!(sent[0].body.contains("/questions/123"));

        let emitted = emitter.emitted.lock().expect("emitted");
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].0, "questions:new");
    }

    #[tokio::test]
    async fn item_handler_only_emits() {
        let sender = Arc::new(RecordingSender::default());
        let emitter = Arc::new(RecordingEmitter::default());
        let router = TopicRouter::new(sender.clone(), emitter.clone());

        router.handle(&sample_event("items")).await.expect("handled");

        assert!(sender.sent.lock().expect("sent").is_empty());
        assert_eq!(emitter.emitted.lock().expect("emitted").len(), 1);
    }

    #[tokio::test]
    async fn unrouted_topics_are_silent_no_ops() {
        let sender = Arc::new(RecordingSender::default());
        let emitter = Arc::new(RecordingEmitter::default());
        let router = TopicRouter::new(sender.clone(), emitter.clone());

        router.handle(&sample_event("claims")).await.expect("claims");
        router
            .handle(&sample_event("brand_new_topic"))
            .await
            .expect("unknown");

        assert!(sender.sent.lock().expect("sent").is_empty());
        assert!(emitter.emitted.lock().expect("emitted").is_empty());
    }
}
