use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PRIORITY_HIGH: u8 = 1;
pub const PRIORITY_NORMAL: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Questions,
    OrdersV2,
    Items,
    Payments,
    Messages,
    Claims,
    Shipments,
}

impl Topic {
    pub const BUILT_IN: &'static [&'static str] = &[
        "questions",
        "orders_v2",
        "items",
        "payments",
        "messages",
        "claims",
        "shipments",
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "questions" => Some(Topic::Questions),
            "orders_v2" => Some(Topic::OrdersV2),
            "items" => Some(Topic::Items),
            "payments" => Some(Topic::Payments),
            "messages" => Some(Topic::Messages),
            "claims" => Some(Topic::Claims),
            "shipments" => Some(Topic::Shipments),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Questions => "questions",
            Topic::OrdersV2 => "orders_v2",
            Topic::Items => "items",
            Topic::Payments => "payments",
            Topic::Messages => "messages",
            Topic::Claims => "claims",
            Topic::Shipments => "shipments",
        }
    }

    /// Claims and payments are processed before everything else.
    pub fn priority(self) -> u8 {
        match self {
            Topic::Claims | Topic::Payments => PRIORITY_HIGH,
            _ => PRIORITY_NORMAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }
}

/// One inbound marketplace notification. The topic is kept as the raw
/// string so that records outlive the set of topics this build routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event_id: String,
    pub idempotency_key: String,
    pub topic: String,
    pub resource: String,
    pub sender_id: String,
    pub application_id: String,
    pub attempt_id: Option<String>,
    pub sent_at_epoch: i64,
    pub received_at_epoch: i64,
    pub priority: u8,
    pub status: EventStatus,
    pub attempts: u32,
    pub visible_at_epoch: i64,
    pub processed_at_epoch: Option<i64>,
    pub last_error: Option<String>,
    /// How many times an operator has replayed this event from the
    /// dead-letter store.
    pub replay_count: u32,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event: WebhookEvent,
    pub failure_reason: String,
    pub failed_at_epoch: i64,
    pub replay_count: u32,
}

#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Inserted,
    Duplicate(WebhookEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_built_in_topic() {
        for raw in Topic::BUILT_IN {
            let topic = Topic::parse(raw).expect("built-in topic parses");
            assert_eq!(topic.as_str(), *raw);
        }
        assert_eq!(Topic::parse("orders_v3"), None);
    }

    #[test]
    fn claims_and_payments_are_high_priority() {
        assert_eq!(Topic::Claims.priority(), PRIORITY_HIGH);
        assert_eq!(Topic::Payments.priority(), PRIORITY_HIGH);
        assert_eq!(Topic::Questions.priority(), PRIORITY_NORMAL);
        assert_eq!(Topic::Messages.priority(), PRIORITY_NORMAL);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!EventStatus::Pending.is_terminal());
        assert!(!EventStatus::Processing.is_terminal());
        assert!(EventStatus::Completed.is_terminal());
        assert!(EventStatus::Failed.is_terminal());
    }
}
