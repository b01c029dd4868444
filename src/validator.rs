use crate::config::Config;
use crate::signatures::verify_signature;
use axum::http::HeaderMap;
use chrono::DateTime;
use serde_json::Value;
use std::net::IpAddr;

pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    /// IP, signature, or staleness failures: the request is authentic-looking
    /// but not trusted. Surfaced as 403.
    Forbidden(&'static str),
    /// Structural failures: malformed JSON, missing fields, unknown topic.
    /// Surfaced as 400.
    BadRequest(&'static str),
}

impl ValidationError {
    pub fn reason(self) -> &'static str {
        match self {
            ValidationError::Forbidden(reason) => reason,
            ValidationError::BadRequest(reason) => reason,
        }
    }
}

/// A validated inbound notification, ready to become a webhook record.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundNotification {
    pub topic: String,
    pub resource: String,
    pub sender_id: String,
    pub application_id: String,
    pub attempt_id: Option<String>,
    pub sent_at_epoch: i64,
    pub payload: Value,
}

/// Runs the full intake validation in order: source IP, payload structure,
/// topic, signature, freshness. Fast and synchronous; must never block on
/// anything heavier than an HMAC.
pub fn validate_request(
    config: &Config,
    remote_ip: IpAddr,
    headers: &HeaderMap,
    body: &[u8],
    now_epoch: i64,
) -> Result<InboundNotification, ValidationError> {
    if config.enforce_ip_allowlist && !ip_allowed(config, remote_ip) {
        return Err(ValidationError::Forbidden("source ip not in allowlist"));
    }

    let payload: Value = serde_json::from_slice(body)
        .map_err(|_| ValidationError::BadRequest("invalid json payload"))?;

    let topic = required_string(&payload, "topic")
        .ok_or(ValidationError::BadRequest("missing topic"))?;
    let resource = required_string(&payload, "resource")
        .ok_or(ValidationError::BadRequest("missing resource"))?;
    let sender_id = required_string(&payload, "user_id")
        .ok_or(ValidationError::BadRequest("missing user_id"))?;
    let application_id = required_string(&payload, "application_id")
        .ok_or(ValidationError::BadRequest("missing application_id"))?;
    let sent = required_string(&payload, "sent")
        .ok_or(ValidationError::BadRequest("missing sent"))?;
    let attempt_id = required_string(&payload, "attempt_id");

    if !config.topic_is_known(&topic) {
        return Err(ValidationError::BadRequest("unknown topic"));
    }

    if let Some(secret) = &config.signing_secret {
        let signature = header_string(headers, SIGNATURE_HEADER)
            .ok_or(ValidationError::Forbidden("missing signature"))?;
        if !verify_signature(secret, body, &signature) {
            return Err(ValidationError::Forbidden("invalid signature"));
        }
    }

    let sent_at_epoch = DateTime::parse_from_rfc3339(&sent)
        .map(|timestamp| timestamp.timestamp())
        .map_err(|_| ValidationError::BadRequest("invalid sent timestamp"))?;

    if now_epoch - sent_at_epoch > config.freshness_window_seconds {
        return Err(ValidationError::Forbidden("stale notification"));
    }

    Ok(InboundNotification {
        topic,
        resource,
        sender_id,
        application_id,
        attempt_id,
        sent_at_epoch,
        payload,
    })
}

fn ip_allowed(config: &Config, remote_ip: IpAddr) -> bool {
    config
        .source_allowlist
        .iter()
        .any(|cidr| cidr.contains(&remote_ip))
}

/// The marketplace sends user_id and application_id as JSON numbers in some
/// topics and strings in others.
fn required_string(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::compute_hmac_sha256_hex;
    use axum::http::HeaderValue;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    fn test_config(signing_secret: Option<&str>, enforce_ip_allowlist: bool) -> Config {
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            environment: "test".to_string(),
            db_path: std::path::PathBuf::from("unused"),
            signing_secret: signing_secret.map(ToString::to_string),
            source_allowlist: vec!["10.1.0.0/16".parse().expect("cidr")],
            enforce_ip_allowlist,
            extra_topics: vec!["promotions".to_string()],
            freshness_window_seconds: 300,
            max_attempts: 3,
            retry_schedule_seconds: vec![5, 30, 300],
            dlq_retention_seconds: 7 * 24 * 60 * 60,
            dlq_sweep_interval_seconds: 3_600,
            worker_count: 1,
            poll_interval_ms: 250,
            max_payload_bytes: 1_048_576,
            ip_limit_per_minute: 100,
            audit_log_limit_per_minute: 30,
        }
    }

    fn sample_body(sent: &str) -> Vec<u8> {
        json!({
            "topic": "questions",
            "resource": "/questions/123",
            "user_id": 456,
            "application_id": "7890",
            "sent": sent,
            "attempt_id": "attempt-1"
        })
        .to_string()
        .into_bytes()
    }

    fn allowed_ip() -> IpAddr {
        "10.1.2.3".parse().expect("ip")
    }

    #[test]
    fn accepts_well_formed_notification() {
        let config = test_config(None, true);
        let body = sample_body("2023-11-14T22:13:20Z");

        let notification =
            validate_request(&config, allowed_ip(), &HeaderMap::new(), &body, NOW)
                .expect("valid notification");

        assert_eq!(notification.topic, "questions");
        assert_eq!(notification.resource, "/questions/123");
        assert_eq!(notification.sender_id, "456");
        assert_eq!(notification.application_id, "7890");
        assert_eq!(notification.attempt_id.as_deref(), Some("attempt-1"));
        assert_eq!(notification.sent_at_epoch, NOW);
    }

    #[test]
    fn rejects_ip_outside_allowlist_when_enforced() {
        let config = test_config(None, true);
        let body = sample_body("2023-11-14T22:13:20Z");
        let outside: IpAddr = "192.168.1.1".parse().expect("ip");

        assert_eq!(
            validate_request(&config, outside, &HeaderMap::new(), &body, NOW),
            Err(ValidationError::Forbidden("source ip not in allowlist"))
        );
    }

    #[test]
    fn bypasses_allowlist_when_not_enforced() {
        let config = test_config(None, false);
        let body = sample_body("2023-11-14T22:13:20Z");
        let outside: IpAddr = "192.168.1.1".parse().expect("ip");

        assert!(validate_request(&config, outside, &HeaderMap::new(), &body, NOW).is_ok());
    }

    #[test]
    fn rejects_each_missing_required_field() {
        let config = test_config(None, true);

        for field in ["topic", "resource", "user_id", "application_id", "sent"] {
            let mut payload = json!({
                "topic": "questions",
                "resource": "/questions/123",
                "user_id": 456,
                "application_id": "7890",
                "sent": "2023-11-14T22:13:20Z"
            });
            payload.as_object_mut().expect("object").remove(field);
            let body = payload.to_string().into_bytes();

            let result =
                validate_request(&config, allowed_ip(), &HeaderMap::new(), &body, NOW);
            assert!(
                matches!(result, Err(ValidationError::BadRequest(_))),
                "expected rejection when {field} is missing"
            );
        }
    }

    #[test]
    fn rejects_non_json_body_and_unknown_topic() {
        let config = test_config(None, true);

        assert_eq!(
            validate_request(&config, allowed_ip(), &HeaderMap::new(), b"not json", NOW),
            Err(ValidationError::BadRequest("invalid json payload"))
        );

        let body = json!({
            "topic": "mystery_topic",
            "resource": "/x/1",
            "user_id": 456,
            "application_id": "7890",
            "sent": "2023-11-14T22:13:20Z"
        })
        .to_string()
        .into_bytes();
        assert_eq!(
            validate_request(&config, allowed_ip(), &HeaderMap::new(), &body, NOW),
            Err(ValidationError::BadRequest("unknown topic"))
        );
    }

    #[test]
    fn accepts_operator_configured_extra_topic() {
        let config = test_config(None, true);
        let body = json!({
            "topic": "promotions",
            "resource": "/promotions/9",
            "user_id": 456,
            "application_id": "7890",
            "sent": "2023-11-14T22:13:20Z"
        })
        .to_string()
        .into_bytes();

        assert!(validate_request(&config, allowed_ip(), &HeaderMap::new(), &body, NOW).is_ok());
    }

    #[test]
    fn verifies_signature_when_secret_configured() {
        let config = test_config(Some("intake-secret"), true);
        let body = sample_body("2023-11-14T22:13:20Z");

        let missing =
            validate_request(&config, allowed_ip(), &HeaderMap::new(), &body, NOW);
        assert_eq!(missing, Err(ValidationError::Forbidden("missing signature")));

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_static("sha256=deadbeef"));
        let wrong = validate_request(&config, allowed_ip(), &headers, &body, NOW);
        assert_eq!(wrong, Err(ValidationError::Forbidden("invalid signature")));

        let digest = compute_hmac_sha256_hex("intake-secret", &body);
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&format!("sha256={digest}")).expect("header"),
        );
        assert!(validate_request(&config, allowed_ip(), &headers, &body, NOW).is_ok());
    }

    #[test]
    fn rejects_notification_older_than_freshness_window() {
        let config = test_config(None, true);
        // NOW is 2023-11-14T22:13:20Z; this is 301 seconds earlier.
        let body = sample_body("2023-11-14T22:08:19Z");

        assert_eq!(
            validate_request(&config, allowed_ip(), &HeaderMap::new(), &body, NOW),
            Err(ValidationError::Forbidden("stale notification"))
        );
    }

    #[test]
    fn accepts_notification_at_window_edge() {
        let config = test_config(None, true);
        // Exactly 300 seconds old.
        let body = sample_body("2023-11-14T22:08:20Z");

        assert!(validate_request(&config, allowed_ip(), &HeaderMap::new(), &body, NOW).is_ok());
    }

    #[test]
    fn rejects_unparseable_sent_timestamp() {
        let config = test_config(None, true);
        let body = sample_body("tomorrow-ish");

        assert_eq!(
            validate_request(&config, allowed_ip(), &HeaderMap::new(), &body, NOW),
            Err(ValidationError::BadRequest("invalid sent timestamp"))
        );
    }
}
