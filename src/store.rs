use crate::model::{DeadLetterEntry, EventStatus, RecordOutcome, WebhookEvent};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

const EVENTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("webhook_events");
const IDEMPOTENCY_INDEX_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("idempotency_index");
const DLQ_TABLE: TableDefinition<&str, &str> = TableDefinition::new("dead_letter");

/// Persistent webhook record store. redb serializes write transactions, so
/// every conditional update below is atomic with respect to concurrent
/// workers in this process.
#[derive(Debug, Clone)]
pub struct WebhookStore {
    db: Arc<Database>,
}

impl WebhookStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db directory at {}", parent.display()))?;
        }

        let db =
            Database::create(path).with_context(|| format!("open redb at {}", path.display()))?;
        let write_tx = db
            .begin_write()
            .context("begin write transaction for table init")?;
        {
            write_tx
                .open_table(EVENTS_TABLE)
                .context("open events table")?;
            write_tx
                .open_table(IDEMPOTENCY_INDEX_TABLE)
                .context("open idempotency index table")?;
            write_tx.open_table(DLQ_TABLE).context("open dlq table")?;
        }
        write_tx.commit().context("commit table init transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Conditional insert keyed by idempotency key. A key conflict returns
    /// the existing record untouched; this is the sole deduplication
    /// guarantee of the pipeline.
    pub fn record_or_reject(&self, event: WebhookEvent) -> Result<RecordOutcome> {
        let write_tx = self
            .db
            .begin_write()
            .context("begin write transaction for record_or_reject")?;

        let existing_event_id = {
            let mut index = write_tx
                .open_table(IDEMPOTENCY_INDEX_TABLE)
                .context("open idempotency index table")?;
            let existing = index
                .get(event.idempotency_key.as_str())
                .context("read idempotency key")?
                .map(|guard| guard.value().to_string());

            if existing.is_none() {
                index
                    .insert(event.idempotency_key.as_str(), event.event_id.as_str())
                    .context("insert idempotency key")?;
            }

            existing
        };

        if let Some(existing_id) = existing_event_id {
            let raw = {
                let events = write_tx
                    .open_table(EVENTS_TABLE)
                    .context("open events table")?;
                events
                    .get(existing_id.as_str())
                    .context("read existing event")?
                    .map(|guard| guard.value().to_string())
            };
            let raw = raw.with_context(|| {
                format!("idempotency index points at missing event {existing_id}")
            })?;
            // Dropping the transaction discards nothing: no mutation happened.
            return Ok(RecordOutcome::Duplicate(deserialize_json(&raw)?));
        }

        {
            let mut events = write_tx
                .open_table(EVENTS_TABLE)
                .context("open events table")?;
            let serialized = serialize_json(&event).context("serialize webhook event")?;
            events
                .insert(event.event_id.as_str(), serialized.as_str())
                .context("insert webhook event")?;
        }

        write_tx
            .commit()
            .context("commit record_or_reject transaction")?;

        Ok(RecordOutcome::Inserted)
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<WebhookEvent>> {
        let read_tx = self
            .db
            .begin_read()
            .context("begin read transaction for get_event")?;
        let events = read_tx
            .open_table(EVENTS_TABLE)
            .context("open events table")?;

        events
            .get(event_id)
            .context("read event")?
            .map(|guard| deserialize_json(guard.value()))
            .transpose()
    }

    /// Compare-and-swap status transition. Applies only when the current
    /// status matches `from`; stamps the processed timestamp on terminal
    /// transitions.
    pub fn transition(
        &self,
        event_id: &str,
        from: EventStatus,
        to: EventStatus,
        now_epoch: i64,
    ) -> Result<bool> {
        let write_tx = self
            .db
            .begin_write()
            .context("begin write transaction for transition")?;

        {
            let mut events = write_tx
                .open_table(EVENTS_TABLE)
                .context("open events table")?;
            let raw = events
                .get(event_id)
                .context("read event for transition")?
                .map(|guard| guard.value().to_string());

            let Some(raw) = raw else {
                return Ok(false);
            };

            let mut event: WebhookEvent = deserialize_json(&raw)?;
            if event.status != from {
                return Ok(false);
            }

            event.status = to;
            if to.is_terminal() {
                event.processed_at_epoch = Some(now_epoch);
            }

            let serialized = serialize_json(&event).context("serialize transitioned event")?;
            events
                .insert(event_id, serialized.as_str())
                .context("write transitioned event")?;
        }

        write_tx.commit().context("commit transition")?;
        Ok(true)
    }

    /// Claims the most urgent due PENDING event: lowest priority value first,
    /// then earliest arrival. The claim flips the record to PROCESSING inside
    /// the same write transaction, so concurrent workers cannot double-claim.
    pub fn claim_next_due(&self, now_epoch: i64) -> Result<Option<WebhookEvent>> {
        let write_tx = self
            .db
            .begin_write()
            .context("begin write transaction for claim_next_due")?;

        let mut selected: Option<WebhookEvent> = None;
        {
            let events = write_tx
                .open_table(EVENTS_TABLE)
                .context("open events table")?;
            let iter = events.iter().context("iterate events")?;

            for entry in iter {
                let (event_id_guard, payload_guard) = entry.context("read event row")?;
                let event_id = event_id_guard.value();
                let event: WebhookEvent = deserialize_json(payload_guard.value())
                    .with_context(|| format!("deserialize event {event_id}"))?;

                if event.status != EventStatus::Pending || event.visible_at_epoch > now_epoch {
                    continue;
                }

                let is_better = match &selected {
                    Some(best) => {
                        (event.priority, event.received_at_epoch, &event.event_id)
                            < (best.priority, best.received_at_epoch, &best.event_id)
                    }
                    None => true,
                };
                if is_better {
                    selected = Some(event);
                }
            }
        }

        if let Some(mut event) = selected {
            event.status = EventStatus::Processing;
            {
                let mut events = write_tx
                    .open_table(EVENTS_TABLE)
                    .context("open events table for claim")?;
                let serialized = serialize_json(&event).context("serialize claimed event")?;
                events
                    .insert(event.event_id.as_str(), serialized.as_str())
                    .context("write claimed event")?;
            }
            write_tx.commit().context("commit claim")?;
            return Ok(Some(event));
        }

        drop(write_tx);
        Ok(None)
    }

    /// PROCESSING -> PENDING with an incremented attempt count and a future
    /// visibility timestamp. The pending row itself is the retry schedule.
    pub fn schedule_retry(
        &self,
        event_id: &str,
        visible_at_epoch: i64,
        error: &str,
    ) -> Result<bool> {
        let write_tx = self
            .db
            .begin_write()
            .context("begin write transaction for schedule_retry")?;

        {
            let mut events = write_tx
                .open_table(EVENTS_TABLE)
                .context("open events table")?;
            let raw = events
                .get(event_id)
                .context("read event for retry")?
                .map(|guard| guard.value().to_string());

            let Some(raw) = raw else {
                return Ok(false);
            };

            let mut event: WebhookEvent = deserialize_json(&raw)?;
            if event.status != EventStatus::Processing {
                return Ok(false);
            }

            event.attempts += 1;
            event.status = EventStatus::Pending;
            event.visible_at_epoch = visible_at_epoch;
            event.last_error = Some(error.to_string());

            let serialized = serialize_json(&event).context("serialize retried event")?;
            events
                .insert(event_id, serialized.as_str())
                .context("write retried event")?;
        }

        write_tx.commit().context("commit schedule_retry")?;
        Ok(true)
    }

    /// PROCESSING -> FAILED plus a copy into the dead-letter table. Failed
    /// rows are never visible to the dispatcher again until replayed.
    pub fn fail_permanently(&self, event_id: &str, reason: &str, now_epoch: i64) -> Result<bool> {
        let write_tx = self
            .db
            .begin_write()
            .context("begin write transaction for fail_permanently")?;

        let failed_event = {
            let mut events = write_tx
                .open_table(EVENTS_TABLE)
                .context("open events table")?;
            let raw = events
                .get(event_id)
                .context("read event for failure")?
                .map(|guard| guard.value().to_string());

            let Some(raw) = raw else {
                return Ok(false);
            };

            let mut event: WebhookEvent = deserialize_json(&raw)?;
            if event.status != EventStatus::Processing {
                return Ok(false);
            }

            event.attempts += 1;
            event.status = EventStatus::Failed;
            event.processed_at_epoch = Some(now_epoch);
            event.last_error = Some(reason.to_string());

            let serialized = serialize_json(&event).context("serialize failed event")?;
            events
                .insert(event_id, serialized.as_str())
                .context("write failed event")?;
            event
        };

        {
            let mut dlq = write_tx.open_table(DLQ_TABLE).context("open dlq table")?;
            let entry = DeadLetterEntry {
                replay_count: failed_event.replay_count,
                event: failed_event,
                failure_reason: reason.to_string(),
                failed_at_epoch: now_epoch,
            };
            let serialized = serialize_json(&entry).context("serialize dlq entry")?;
            dlq.insert(event_id, serialized.as_str())
                .context("insert dlq entry")?;
        }

        write_tx.commit().context("commit fail_permanently")?;
        Ok(true)
    }

    /// Manual reprocessing: the dead-letter entry is removed and the event
    /// re-enters the pending queue at attempt 0, immediately visible.
    pub fn replay_dlq_event(&self, event_id: &str, now_epoch: i64) -> Result<bool> {
        let write_tx = self
            .db
            .begin_write()
            .context("begin write transaction for replay")?;

        let replay_event = {
            let mut dlq = write_tx.open_table(DLQ_TABLE).context("open dlq table")?;
            let raw = dlq
                .get(event_id)
                .context("read dlq entry")?
                .map(|guard| guard.value().to_string());

            let Some(raw) = raw else {
                return Ok(false);
            };

            let entry: DeadLetterEntry =
                deserialize_json(&raw).context("deserialize dlq entry for replay")?;

            let mut event = entry.event;
            event.status = EventStatus::Pending;
            event.attempts = 0;
            event.visible_at_epoch = now_epoch;
            event.processed_at_epoch = None;
            event.replay_count = entry.replay_count + 1;

            dlq.remove(event_id).context("remove dlq entry for replay")?;
            event
        };

        {
            let mut events = write_tx
                .open_table(EVENTS_TABLE)
                .context("open events table for replay")?;
            let serialized = serialize_json(&replay_event).context("serialize replayed event")?;
            events
                .insert(event_id, serialized.as_str())
                .context("write replayed event")?;
        }

        write_tx.commit().context("commit replay transaction")?;
        Ok(true)
    }

    /// Retention sweep: drops dead-letter entries older than the cutoff along
    /// with their event rows and idempotency keys.
    pub fn purge_dlq_older_than(&self, cutoff_epoch: i64) -> Result<usize> {
        let write_tx = self
            .db
            .begin_write()
            .context("begin write transaction for purge")?;

        let expired = {
            let mut dlq = write_tx.open_table(DLQ_TABLE).context("open dlq table")?;

            let mut expired: Vec<DeadLetterEntry> = Vec::new();
            {
                let iter = dlq.iter().context("iterate dlq table")?;
                for entry in iter {
                    let (_event_id_guard, payload_guard) = entry.context("read dlq row")?;
                    let dlq_entry: DeadLetterEntry = deserialize_json(payload_guard.value())
                        .context("deserialize dlq row")?;
                    if dlq_entry.failed_at_epoch < cutoff_epoch {
                        expired.push(dlq_entry);
                    }
                }
            }

            for entry in &expired {
                dlq.remove(entry.event.event_id.as_str())
                    .context("remove expired dlq entry")?;
            }

            expired
        };

        if expired.is_empty() {
            drop(write_tx);
            return Ok(0);
        }

        {
            let mut events = write_tx
                .open_table(EVENTS_TABLE)
                .context("open events table for purge")?;
            for entry in &expired {
                events
                    .remove(entry.event.event_id.as_str())
                    .context("remove expired event row")?;
            }
        }

        {
            let mut index = write_tx
                .open_table(IDEMPOTENCY_INDEX_TABLE)
                .context("open idempotency index for purge")?;
            for entry in &expired {
                index
                    .remove(entry.event.idempotency_key.as_str())
                    .context("remove expired idempotency key")?;
            }
        }

        write_tx.commit().context("commit purge transaction")?;
        Ok(expired.len())
    }

    /// Retention sweep for the happy path: COMPLETED rows past the cutoff
    /// are dropped along with their idempotency keys, keeping the claim scan
    /// bounded.
    pub fn purge_completed_older_than(&self, cutoff_epoch: i64) -> Result<usize> {
        let write_tx = self
            .db
            .begin_write()
            .context("begin write transaction for completed purge")?;

        let expired = {
            let mut events = write_tx
                .open_table(EVENTS_TABLE)
                .context("open events table for completed purge")?;

            let mut expired: Vec<WebhookEvent> = Vec::new();
            {
                let iter = events.iter().context("iterate events for completed purge")?;
                for entry in iter {
                    let (_event_id_guard, payload_guard) = entry.context("read event row")?;
                    let event: WebhookEvent = deserialize_json(payload_guard.value())
                        .context("deserialize event row")?;
                    let past_cutoff = event
                        .processed_at_epoch
                        .is_some_and(|processed_at| processed_at < cutoff_epoch);
                    if event.status == EventStatus::Completed && past_cutoff {
                        expired.push(event);
                    }
                }
            }

            for event in &expired {
                events
                    .remove(event.event_id.as_str())
                    .context("remove expired completed event")?;
            }

            expired
        };

        if expired.is_empty() {
            drop(write_tx);
            return Ok(0);
        }

        {
            let mut index = write_tx
                .open_table(IDEMPOTENCY_INDEX_TABLE)
                .context("open idempotency index for completed purge")?;
            for event in &expired {
                index
                    .remove(event.idempotency_key.as_str())
                    .context("remove expired idempotency key")?;
            }
        }

        write_tx.commit().context("commit completed purge")?;
        Ok(expired.len())
    }

    pub fn pending_count(&self) -> Result<usize> {
        let read_tx = self
            .db
            .begin_read()
            .context("begin read transaction for pending_count")?;
        let events = read_tx
            .open_table(EVENTS_TABLE)
            .context("open events table")?;

        let mut count = 0;
        let iter = events.iter().context("iterate events for count")?;
        for entry in iter {
            let (_event_id_guard, payload_guard) = entry.context("read event row")?;
            let event: WebhookEvent =
                deserialize_json(payload_guard.value()).context("deserialize event row")?;
            if event.status == EventStatus::Pending {
                count += 1;
            }
        }

        Ok(count)
    }

    pub fn dlq_count(&self) -> Result<usize> {
        let read_tx = self
            .db
            .begin_read()
            .context("begin read transaction for dlq_count")?;
        let dlq = read_tx.open_table(DLQ_TABLE).context("open dlq table")?;
        Ok(dlq.iter().context("iterate dlq for count")?.count())
    }

    pub fn list_dlq_events(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let read_tx = self
            .db
            .begin_read()
            .context("begin read transaction for list_dlq")?;
        let dlq = read_tx.open_table(DLQ_TABLE).context("open dlq table")?;

        let mut entries = Vec::new();
        let iter = dlq.iter().context("iterate dlq table")?;
        for (index, entry) in iter.enumerate() {
            if index >= limit {
                break;
            }
            let (_event_id_guard, payload_guard) = entry.context("read dlq row")?;
            entries.push(deserialize_json(payload_guard.value()).context("deserialize dlq row")?);
        }

        Ok(entries)
    }
}

fn serialize_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("serialize JSON")
}

fn deserialize_json<T: for<'de> serde::Deserialize<'de>>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).context("deserialize JSON")
}
