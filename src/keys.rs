use sha2::{Digest, Sha256};

/// Derives the idempotency key for one logical notification. The marketplace
/// redelivers the same event with fresh attempt ids, so the key covers only
/// the fields that identify the event itself.
pub fn idempotency_key(topic: &str, resource: &str, sender_id: &str, sent_at_epoch: i64) -> String {
    let canonical = format!("{topic}:{resource}:{sender_id}:{sent_at_epoch}");
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
