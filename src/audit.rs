use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tracing::warn;

const SECONDS_PER_MINUTE: i64 = 60;

/// Sink for security-relevant intake events. The dashboard's audit trail
/// consumes these out of band; the pipeline only has to emit them.
pub trait AuditSink: Send + Sync {
    fn record_validation_failure(&self, remote_ip: IpAddr, reason: &str, now_epoch: i64);
}

#[derive(Debug, Clone, Copy)]
struct ReasonWindow {
    minute_bucket: i64,
    count: u32,
}

/// Per-reason sliding-minute limiter so a sender retry storm cannot flood
/// the audit log.
#[derive(Debug, Clone)]
pub struct AuditLogLimiter {
    limit_per_minute: u32,
    windows: Arc<Mutex<HashMap<String, ReasonWindow>>>,
}

impl AuditLogLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn allow(&self, reason: &str, now_epoch: i64) -> bool {
        let now_minute = now_epoch / SECONDS_PER_MINUTE;
        let mut guard = match self.windows.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };

        let entry = guard.entry(reason.to_string()).or_insert(ReasonWindow {
            minute_bucket: now_minute,
            count: 0,
        });

        if entry.minute_bucket != now_minute {
            entry.minute_bucket = now_minute;
            entry.count = 0;
        }

        if entry.count >= self.limit_per_minute {
            return false;
        }

        entry.count = entry.count.saturating_add(1);
        true
    }
}

#[derive(Debug, Clone)]
pub struct TracingAuditSink {
    limiter: AuditLogLimiter,
}

impl TracingAuditSink {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limiter: AuditLogLimiter::new(limit_per_minute),
        }
    }
}

impl AuditSink for TracingAuditSink {
    fn record_validation_failure(&self, remote_ip: IpAddr, reason: &str, now_epoch: i64) {
        if !self.limiter.allow(reason, now_epoch) {
            return;
        }

        warn!(
            target: "security_audit",
            remote = %remote_ip,
            reason,
            "webhook validation failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_caps_per_reason_per_minute() {
        let limiter = AuditLogLimiter::new(2);

        assert!(limiter.allow("invalid signature", 60));
        assert!(limiter.allow("invalid signature", 61));
        assert!(!limiter.allow("invalid signature", 62));

        // Other reasons have their own budget.
        assert!(limiter.allow("stale notification", 62));
    }

    #[test]
    fn limiter_resets_each_minute() {
        let limiter = AuditLogLimiter::new(1);

        assert!(limiter.allow("invalid signature", 60));
        assert!(!limiter.allow("invalid signature", 90));
        assert!(limiter.allow("invalid signature", 120));
    }
}
