//! Shared adapter mechanics: the building blocks every backend adapter
//! assembles into a full [`crate::db::DbLayer`]. None of this is itself a
//! `DbLayer` impl -- it's the "dumb KV" scaffolding an adapter's
//! `get`/`put`/`list_keys` methods are built from, so each adapter gets
//! the same `make_key`/`parse_key`/`make_prefix` helpers instead of
//! reinventing key composition.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::StoreId;
use crate::error::{DpsError, ErrorCode};

/// Current wall-clock time in milliseconds since the epoch, used for TTL
/// expiry and lock-lease deadlines by every adapter that emulates these
/// instead of delegating to the backend's native expiry.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// Base64-encodes `key` with the no-pad standard alphabet, for backends
/// that reject arbitrary bytes in a row key / document id (HBase,
/// Cassandra, Cloudant, Mongo, Couchbase).
pub fn b64_encode_key(key: &[u8]) -> String {
    STANDARD_NO_PAD.encode(key)
}

/// Inverse of [`b64_encode_key`].
pub fn b64_decode_key(encoded: &str) -> Result<Vec<u8>, DpsError> {
    STANDARD_NO_PAD
        .decode(encoded)
        .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))
}

/// Composes the physical storage key for `(store_id, encoded_user_key)`.
/// `base64_keys` selects whether the user key is base64-encoded first
/// (backends that require printable keys) or used as raw bytes (Redis,
/// Memcached).
pub fn data_key(store_id: StoreId, encoded_user_key: &[u8], base64_keys: bool) -> Vec<u8> {
    let key_part: Vec<u8> = if base64_keys {
        b64_encode_key(encoded_user_key).into_bytes()
    } else {
        encoded_user_key.to_vec()
    };
    let mut out = format!("dps_data:{store_id}:").into_bytes();
    out.extend_from_slice(&key_part);
    out
}

/// An auxiliary ordered key-set kept alongside a store's data, for
/// backends with no native scan primitive (Memcached, Cassandra
/// single-partition, HBase, Cloudant, Mongo, Couchbase). Updated under the
/// per-store structural mutex on put/remove.
#[derive(Debug, Default)]
pub struct KeySetRegistry {
    sets: RwLock<HashMap<StoreId, BTreeSet<Vec<u8>>>>,
}

impl KeySetRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `key` now exists in `store_id`'s key set.
    pub fn insert(&self, store_id: StoreId, key: Vec<u8>) {
        self.sets.write().entry(store_id).or_default().insert(key);
    }

    /// Records that `key` no longer exists in `store_id`'s key set.
    /// Returns whether it had been present.
    pub fn remove(&self, store_id: StoreId, key: &[u8]) -> bool {
        self.sets
            .write()
            .get_mut(&store_id)
            .is_some_and(|set| set.remove(key))
    }

    /// Snapshots the current key set for `store_id`.
    pub fn snapshot(&self, store_id: StoreId) -> Vec<Vec<u8>> {
        self.sets
            .read()
            .get(&store_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of keys currently tracked for `store_id`.
    pub fn len(&self, store_id: StoreId) -> usize {
        self.sets.read().get(&store_id).map_or(0, BTreeSet::len)
    }

    /// Drops the entire key set for `store_id` (store removal/clear).
    pub fn clear(&self, store_id: StoreId) {
        if let Some(set) = self.sets.write().get_mut(&store_id) {
            set.clear();
        }
    }

    /// Drops the registry entry entirely (store removal).
    pub fn drop_store(&self, store_id: StoreId) {
        self.sets.write().remove(&store_id);
    }
}

/// Splits a comma-separated Memcached catalog segment back into its
/// base64-encoded member keys. Empty segments decode to an empty vec.
pub fn split_catalog_segment(segment: &str) -> Vec<String> {
    if segment.is_empty() {
        Vec::new()
    } else {
        segment.split(',').map(str::to_string).collect()
    }
}

/// Joins base64-encoded member keys into a single comma-separated
/// Memcached catalog segment.
pub fn join_catalog_segment(keys: &[String]) -> String {
    keys.join(",")
}

/// Maximum size, in bytes, of one Memcached catalog segment before a new
/// segment is started.
pub const CATALOG_SEGMENT_MAX_BYTES: usize = 1_048_576;

/// Serializes structural store operations (create/remove/clear/iteration)
/// within this process, mirroring the backend's own `dps_lock:<store_id>`
/// key without a network round trip when the caller and the lock happen
/// to share a process. `StoreManager` acquires one of these around every
/// structural op; point operations never touch it.
#[derive(Debug, Default)]
pub struct StoreMutex {
    locks: DashMap<StoreId, Arc<Mutex<()>>>,
}

impl StoreMutex {
    /// Creates an empty registry of per-store mutexes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the mutex for `store_id`, creating it on first use.
    pub async fn lock(&self, store_id: StoreId) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(store_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b64_round_trips() {
        let key = b"\x00\x01binary-key\xff";
        let encoded = b64_encode_key(key);
        assert_eq!(b64_decode_key(&encoded).unwrap(), key);
    }

    #[test]
    fn data_key_embeds_store_id() {
        let key = data_key(StoreId(9), b"alpha", false);
        assert!(String::from_utf8_lossy(&key).starts_with("dps_data:9:"));
    }

    #[test]
    fn data_key_base64_mode_is_printable() {
        let key = data_key(StoreId(1), b"\x00\xff", true);
        assert!(std::str::from_utf8(&key).is_ok());
    }

    #[test]
    fn key_set_registry_tracks_inserts_and_removes() {
        let registry = KeySetRegistry::new();
        registry.insert(StoreId(1), b"a".to_vec());
        registry.insert(StoreId(1), b"b".to_vec());
        assert_eq!(registry.len(StoreId(1)), 2);

        assert!(registry.remove(StoreId(1), b"a"));
        assert!(!registry.remove(StoreId(1), b"a"));
        assert_eq!(registry.len(StoreId(1)), 1);
    }

    #[test]
    fn key_set_registry_scopes_by_store() {
        let registry = KeySetRegistry::new();
        registry.insert(StoreId(1), b"a".to_vec());
        registry.insert(StoreId(2), b"b".to_vec());
        assert_eq!(registry.snapshot(StoreId(1)), vec![b"a".to_vec()]);
        assert_eq!(registry.snapshot(StoreId(2)), vec![b"b".to_vec()]);
    }

    #[test]
    fn key_set_registry_drop_store_clears_everything() {
        let registry = KeySetRegistry::new();
        registry.insert(StoreId(1), b"a".to_vec());
        registry.drop_store(StoreId(1));
        assert_eq!(registry.len(StoreId(1)), 0);
    }

    #[test]
    fn catalog_segment_round_trip() {
        let keys = vec!["a2V5MQ".to_string(), "a2V5Mg".to_string()];
        let segment = join_catalog_segment(&keys);
        assert_eq!(split_catalog_segment(&segment), keys);
    }

    #[test]
    fn catalog_segment_empty_round_trip() {
        assert!(split_catalog_segment("").is_empty());
        assert_eq!(join_catalog_segment(&[]), "");
    }

    #[tokio::test]
    async fn store_mutex_serializes_same_store() {
        let mutex = StoreMutex::new();
        let guard = mutex.lock(StoreId(1)).await;
        drop(guard);
        // A second acquisition on the same store must still succeed.
        let _guard = mutex.lock(StoreId(1)).await;
    }

    #[tokio::test]
    async fn store_mutex_is_independent_per_store() {
        let mutex = StoreMutex::new();
        let _a = mutex.lock(StoreId(1)).await;
        // A different store's mutex must not be blocked by store 1's guard.
        let _b = mutex.lock(StoreId(2)).await;
    }
}
