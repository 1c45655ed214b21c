//! Per-room state tables: peers, resume records, alias bindings and pending
//! deliveries. Kept as plain structs wrapping `HashMap`s — mirroring this
//! corpus's `SessionPool`-style state containers — rather than behind a
//! generic storage trait, since each `Room` actor is the table's only
//! writer and there is exactly one storage backend in play.

use std::collections::HashMap;

pub type PeerId = String;
pub type UserId = String;
pub type DeliveryId = String;
pub type ResumeToken = String;

#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub room_id: String,
    pub alias: Option<String>,
    pub resume_token: ResumeToken,
    pub resume_expires_at: i64,
    pub connected: bool,
    pub last_seen_at: i64,
    /// Bumped on every `attachSocket`; lets a departing socket's cleanup
    /// recognize it has already been superseded and skip tearing down the
    /// peer's new connection.
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct ResumeRecord {
    pub token: ResumeToken,
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub room_id: String,
    pub alias: Option<String>,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub delivery_id: DeliveryId,
    pub from_peer_id: PeerId,
    pub from_user_id: UserId,
    pub to_peer_id: PeerId,
    pub payload: serde_json::Value,
    pub sent_at: i64,
    pub attempts: u32,
    pub next_retry_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("storage failure persisting delivery")]
pub struct StorageError;

/// `pending:{toPeerId}:{deliveryId}` keyed store.
#[derive(Debug, Default)]
pub struct DeliveryStore {
    by_recipient: HashMap<PeerId, HashMap<DeliveryId, PendingDelivery>>,
}

impl DeliveryStore {
    pub fn put(&mut self, delivery: PendingDelivery) -> Result<(), StorageError> {
        self.by_recipient
            .entry(delivery.to_peer_id.clone())
            .or_default()
            .insert(delivery.delivery_id.clone(), delivery);
        Ok(())
    }

    pub fn remove(&mut self, to_peer_id: &str, delivery_id: &str) -> Option<PendingDelivery> {
        let bucket = self.by_recipient.get_mut(to_peer_id)?;
        let removed = bucket.remove(delivery_id);
        if bucket.is_empty() {
            self.by_recipient.remove(to_peer_id);
        }
        removed
    }

    pub fn for_recipient(&self, to_peer_id: &str) -> Vec<&PendingDelivery> {
        self.by_recipient
            .get(to_peer_id)
            .map(|bucket| bucket.values().collect())
            .unwrap_or_default()
    }

    pub fn remove_all_for_recipient(&mut self, to_peer_id: &str) {
        self.by_recipient.remove(to_peer_id);
    }

    /// All deliveries across all recipients, for `tick`'s sweep.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PendingDelivery> {
        self.by_recipient.values_mut().flat_map(|b| b.values_mut())
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&PendingDelivery) -> bool) {
        self.by_recipient.retain(|_, bucket| {
            bucket.retain(|_, d| keep(d));
            !bucket.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.by_recipient.values().map(|b| b.len()).sum()
    }
}

/// `resume:{token}` keyed store.
#[derive(Debug, Default)]
pub struct ResumeStore {
    by_token: HashMap<ResumeToken, ResumeRecord>,
}

impl ResumeStore {
    pub fn put(&mut self, record: ResumeRecord) -> Result<(), StorageError> {
        self.by_token.insert(record.token.clone(), record);
        Ok(())
    }

    pub fn take(&mut self, token: &str) -> Option<ResumeRecord> {
        self.by_token.remove(token)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResumeRecord> {
        self.by_token.values()
    }

    pub fn remove(&mut self, token: &str) -> Option<ResumeRecord> {
        self.by_token.remove(token)
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }
}

/// Room-scoped alias → peerId table.
#[derive(Debug, Default)]
pub struct AliasTable {
    bindings: HashMap<String, PeerId>,
}

impl AliasTable {
    pub fn holder(&self, alias: &str) -> Option<&PeerId> {
        self.bindings.get(alias)
    }

    pub fn bind(&mut self, alias: String, peer_id: PeerId) {
        self.bindings.insert(alias, peer_id);
    }

    pub fn release(&mut self, alias: &str) {
        self.bindings.remove(alias);
    }
}

/// Normalizes and validates an alias per the room's naming rules:
/// lowercase, length 2-32, charset `[a-z0-9][a-z0-9_.-]*`.
pub fn normalize_alias(raw: &str) -> Option<String> {
    let lower = raw.to_lowercase();
    if lower.len() < 2 || lower.len() > 32 {
        return None;
    }
    let mut chars = lower.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphanumeric() {
        return None;
    }
    if !lower
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return None;
    }
    Some(lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_mixed_case() {
        assert_eq!(normalize_alias("Alice.42"), Some("alice.42".to_string()));
    }

    #[test]
    fn rejects_too_short() {
        assert_eq!(normalize_alias("a"), None);
    }

    #[test]
    fn rejects_invalid_charset() {
        assert_eq!(normalize_alias("a@b"), None);
    }

    #[test]
    fn rejects_too_long() {
        let raw = "a".repeat(33);
        assert_eq!(normalize_alias(&raw), None);
    }

    #[test]
    fn accepts_boundary_lengths() {
        assert!(normalize_alias("ab").is_some());
        assert!(normalize_alias(&"a".repeat(32)).is_some());
    }

    #[test]
    fn delivery_store_buckets_by_recipient() {
        let mut store = DeliveryStore::default();
        store
            .put(PendingDelivery {
                delivery_id: "d1".into(),
                from_peer_id: "a".into(),
                from_user_id: "alice".into(),
                to_peer_id: "b".into(),
                payload: serde_json::json!({}),
                sent_at: 0,
                attempts: 0,
                next_retry_at: 0,
                expires_at: 1000,
            })
            .unwrap();
        assert_eq!(store.for_recipient("b").len(), 1);
        assert!(store.for_recipient("a").is_empty());
        let removed = store.remove("b", "d1");
        assert!(removed.is_some());
        assert!(store.for_recipient("b").is_empty());
    }
}
