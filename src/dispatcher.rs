use crate::model::{EventStatus, WebhookEvent};
use crate::retry::RetryPolicy;
use crate::store::WebhookStore;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{Duration, sleep};
use tracing::{error, info, warn};

/// Seam between the dispatcher and the topic handlers. Production wires in
/// `handlers::TopicRouter`; tests substitute deterministic failures.
#[async_trait]
pub trait HandleEvent: Send + Sync {
    async fn handle(&self, event: &WebhookEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    Retried { attempts: u32, visible_at_epoch: i64 },
    DeadLettered,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: WebhookStore,
    handler: Arc<dyn HandleEvent>,
    retry_policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(store: WebhookStore, handler: Arc<dyn HandleEvent>, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            handler,
            retry_policy,
        }
    }

    /// Claims and processes at most one due event. The claim itself is the
    /// CAS transition to PROCESSING, so the handler runs at most once per
    /// claim even with concurrent dispatchers.
    pub async fn process_next(&self, now_epoch: i64) -> Result<Option<DispatchOutcome>> {
        let Some(event) = self.store.claim_next_due(now_epoch)? else {
            return Ok(None);
        };

        match self.handler.handle(&event).await {
            Ok(()) => {
                let completed = self.store.transition(
                    &event.event_id,
                    EventStatus::Processing,
                    EventStatus::Completed,
                    now_epoch,
                )?;
                if completed {
                    info!(
                        event_id = %event.event_id,
                        topic = %event.topic,
                        attempts = event.attempts + 1,
                        "webhook event completed"
                    );
                } else {
                    warn!(
                        event_id = %event.event_id,
                        "completion transition lost; record changed under us"
                    );
                }
                Ok(Some(DispatchOutcome::Completed))
            }
            Err(err) => self.handle_failure(&event, &err, now_epoch),
        }
    }

    fn handle_failure(
        &self,
        event: &WebhookEvent,
        err: &anyhow::Error,
        now_epoch: i64,
    ) -> Result<Option<DispatchOutcome>> {
        let reason = format!("{err:#}");
        let attempts_after = event.attempts + 1;

        if attempts_after < self.retry_policy.max_attempts() {
            // attempts_after failures so far; index the schedule by the
            // failure count minus one (first failure waits delays[0]).
            let visible_at_epoch = self
                .retry_policy
                .next_visible_at(now_epoch, attempts_after - 1);
            self.store
                .schedule_retry(&event.event_id, visible_at_epoch, &reason)?;
            warn!(
                event_id = %event.event_id,
                topic = %event.topic,
                attempts = attempts_after,
                retry_at = visible_at_epoch,
                error = %reason,
                "handler failed; retry scheduled"
            );
            Ok(Some(DispatchOutcome::Retried {
                attempts: attempts_after,
                visible_at_epoch,
            }))
        } else {
            self.store
                .fail_permanently(&event.event_id, &reason, now_epoch)?;
            error!(
                event_id = %event.event_id,
                topic = %event.topic,
                attempts = attempts_after,
                error = %reason,
                "handler exhausted retries; event moved to dead letter"
            );
            Ok(Some(DispatchOutcome::DeadLettered))
        }
    }
}

/// Long-running worker: drains due events back to back, sleeps when idle.
/// Multiple workers may run concurrently over the same store.
pub async fn run_dispatch_worker(
    dispatcher: Dispatcher,
    poll_interval: Duration,
    alive: Arc<AtomicBool>,
) {
    loop {
        match dispatcher.process_next(epoch_seconds()).await {
            Ok(Some(_)) => {}
            Ok(None) => sleep(poll_interval).await,
            Err(err) => {
                error!(error = %err, "dispatch iteration failed");
                sleep(poll_interval).await;
            }
        }

        if !alive.load(Ordering::SeqCst) {
            return;
        }
    }
}

pub fn epoch_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
