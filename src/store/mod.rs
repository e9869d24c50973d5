//! The backend-agnostic store layer: [`StoreManager`]
//! holds nothing but an `Arc<D>` and a [`StoreMutex`], and every operation
//! delegates straight through to [`DbLayer`] -- all intelligence about
//! *what* a key or value means lives with the caller (via [`crate::codec`]),
//! not here.

pub mod iterator;

use std::sync::Arc;

pub use iterator::Iterator;

use crate::adapters::common::StoreMutex;
use crate::codec;
use crate::db::{DbLayer, StoreId};
use crate::error::DpsError;

/// Backend-agnostic store operations, generic over any [`DbLayer`]
/// implementation. Structural operations (`remove_store`, `clear`,
/// `begin_iteration`) serialize on the per-store mutex; point operations do
/// not.
#[derive(Debug)]
pub struct StoreManager<D: DbLayer + ?Sized> {
    backend: Arc<D>,
    mutexes: StoreMutex,
}

impl<D: DbLayer + ?Sized> StoreManager<D> {
    /// Builds a store layer over `backend`.
    pub fn new(backend: Arc<D>) -> Self {
        Self {
            backend,
            mutexes: StoreMutex::new(),
        }
    }

    /// Returns the underlying backend, e.g. for the escape-hatch commands.
    pub fn backend(&self) -> &Arc<D> {
        &self.backend
    }

    // ---- Store metadata ----

    /// Atomically reserves an id, writes the store header, and registers
    /// the name. Fails with `StoreExists` if `name` is already taken.
    pub async fn create_store(
        &self,
        name: &str,
        key_type: &str,
        value_type: &str,
    ) -> Result<StoreId, DpsError> {
        self.backend.create_store(name, key_type, value_type).await
    }

    /// As [`create_store`](Self::create_store), returning the existing id
    /// if `name` is already registered with matching type tags; mismatch
    /// fails with `StoreExistsWithDifferentTypes`.
    pub async fn create_or_get_store(
        &self,
        name: &str,
        key_type: &str,
        value_type: &str,
    ) -> Result<StoreId, DpsError> {
        self.backend
            .create_or_get_store(name, key_type, value_type)
            .await
    }

    /// Looks up a store by name; `StoreId::NONE` if absent.
    pub async fn find_store(&self, name: &str) -> Result<StoreId, DpsError> {
        self.backend.find_store(name).await
    }

    /// Removes a store's header, name index, data, and structural lock.
    /// Idempotent w.r.t. a missing id.
    pub async fn remove_store(&self, id: StoreId) -> Result<bool, DpsError> {
        let _guard = self.mutexes.lock(id).await;
        self.backend.remove_store(id).await
    }

    /// Removes every entry, preserving the header and lock
    /// (`absent → present(empty) → present(non-empty) → absent` minus the
    /// final transition).
    pub async fn clear(&self, id: StoreId) -> Result<(), DpsError> {
        let _guard = self.mutexes.lock(id).await;
        self.backend.clear(id).await
    }

    /// Current number of entries in the store.
    pub async fn size(&self, id: StoreId) -> Result<u64, DpsError> {
        self.backend.size(id).await
    }

    // ---- Store data (point operations; not serialized) ----

    /// Unconditional write.
    pub async fn put(&self, id: StoreId, key: &[u8], value: &[u8]) -> Result<bool, DpsError> {
        self.backend.put(id, key, value).await
    }

    /// Rejects the write if `key` is present with a different declared
    /// value type.
    pub async fn put_safe(
        &self,
        id: StoreId,
        key: &[u8],
        value: &[u8],
        value_type: &str,
    ) -> Result<bool, DpsError> {
        self.backend.put_safe(id, key, value, value_type).await
    }

    /// Reads a value; `Ok(None)` if missing.
    pub async fn get(&self, id: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, DpsError> {
        self.backend.get(id, key).await
    }

    /// As [`get`](Self::get), additionally checking the stored value's type
    /// tag.
    pub async fn get_safe(
        &self,
        id: StoreId,
        key: &[u8],
        value_type: &str,
    ) -> Result<Option<Vec<u8>>, DpsError> {
        self.backend.get_safe(id, key, value_type).await
    }

    /// Idempotent removal; returns whether the key existed.
    pub async fn remove(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        self.backend.remove(id, key).await
    }

    /// Whether `key` is present.
    pub async fn has(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        self.backend.has(id, key).await
    }

    // ---- Iteration ----

    /// Snapshots the current key set under the per-store mutex and returns
    /// a lock-free cursor over it.
    pub async fn begin_iteration(&self, id: StoreId) -> Result<Iterator, DpsError> {
        let _guard = self.mutexes.lock(id).await;
        let keys = self.backend.list_keys(id).await?;
        Ok(Iterator {
            store_id: id,
            keys,
            pos: 0,
        })
    }

    /// Advances `iter` and returns the next surviving `(key, value)` pair.
    /// Keys whose entries vanished mid-iteration are silently skipped
    /// rather than surfaced as an error.
    pub async fn get_next(
        &self,
        iter: &mut Iterator,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, DpsError> {
        while iter.pos < iter.keys.len() {
            let key = iter.keys[iter.pos].clone();
            iter.pos += 1;
            if let Some(value) = self.backend.get(iter.store_id, &key).await? {
                return Ok(Some((key, value)));
            }
        }
        Ok(None)
    }

    /// Releases the iterator's resources. The snapshot holds no backend
    /// handle, so this is purely a drop; kept as an explicit call to match
    /// the `newIterator`/`deleteIterator` lifecycle pairing.
    pub fn end_iteration(&self, _iter: Iterator) {}

    // ---- Serialization ----

    /// Concatenates every `(encoded_key, encoded_value)` pair currently in
    /// the store into one blob, each half produced by [`crate::codec`] and
    /// therefore self-delimiting.
    pub async fn serialize(&self, id: StoreId) -> Result<Vec<u8>, DpsError> {
        let keys = self.backend.list_keys(id).await?;
        let mut blob = Vec::new();
        for key in keys {
            if let Some(value) = self.backend.get(id, &key).await? {
                blob.extend_from_slice(&key);
                blob.extend_from_slice(&value);
            }
        }
        Ok(blob)
    }

    /// Inverse of [`serialize`](Self::serialize): walks `blob` two codec
    /// values at a time and `put`s each pair. Returns the number of pairs
    /// written.
    pub async fn deserialize(&self, id: StoreId, blob: &[u8]) -> Result<u64, DpsError> {
        let mut pos = 0;
        let mut count = 0u64;
        while pos < blob.len() {
            let key_len = codec::encoded_len(&blob[pos..])?;
            let key = blob[pos..pos + key_len].to_vec();
            pos += key_len;

            let value_len = codec::encoded_len(&blob[pos..])?;
            let value = blob[pos..pos + value_len].to_vec();
            pos += value_len;

            self.backend.put(id, &key, &value).await?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryBackend;
    use crate::codec::{encode, TypedValue};

    fn manager() -> StoreManager<MemoryBackend> {
        StoreManager::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn create_find_remove_round_trip() {
        let mgr = manager();
        let id = mgr.create_store("widgets", "rstring", "int64").await.unwrap();
        assert!(!id.is_none());
        assert_eq!(mgr.find_store("widgets").await.unwrap(), id);
        assert!(mgr.remove_store(id).await.unwrap());
        assert!(mgr.find_store("widgets").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_store_rejects_duplicate_name() {
        let mgr = manager();
        mgr.create_store("widgets", "rstring", "int64").await.unwrap();
        let err = mgr
            .create_store("widgets", "rstring", "int64")
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::StoreExists);
    }

    #[tokio::test]
    async fn put_get_remove_idempotence() {
        let mgr = manager();
        let id = mgr.create_store("kv", "rstring", "rstring").await.unwrap();

        assert!(mgr.put(id, b"a", b"1").await.unwrap());
        assert_eq!(mgr.get(id, b"a").await.unwrap(), Some(b"1".to_vec()));

        assert!(mgr.remove(id, b"a").await.unwrap());
        assert!(!mgr.remove(id, b"a").await.unwrap());
        assert_eq!(mgr.get(id, b"a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_preserves_header() {
        let mgr = manager();
        let id = mgr.create_store("kv", "rstring", "rstring").await.unwrap();
        mgr.put(id, b"a", b"1").await.unwrap();
        mgr.put(id, b"b", b"2").await.unwrap();
        assert_eq!(mgr.size(id).await.unwrap(), 2);

        mgr.clear(id).await.unwrap();
        assert_eq!(mgr.size(id).await.unwrap(), 0);
        assert_eq!(mgr.find_store("kv").await.unwrap(), id);
    }

    #[tokio::test]
    async fn iteration_visits_snapshotted_keys_and_skips_vanished_ones() {
        let mgr = manager();
        let id = mgr.create_store("kv", "rstring", "rstring").await.unwrap();
        mgr.put(id, b"a", b"1").await.unwrap();
        mgr.put(id, b"b", b"2").await.unwrap();
        mgr.put(id, b"c", b"3").await.unwrap();

        let mut iter = mgr.begin_iteration(id).await.unwrap();
        // Remove a snapshotted key after the snapshot was taken.
        mgr.remove(id, b"b").await.unwrap();

        let mut seen = Vec::new();
        while let Some((k, v)) = mgr.get_next(&mut iter).await.unwrap() {
            seen.push((k, v));
        }
        mgr.end_iteration(iter);

        assert_eq!(seen.len(), 2);
        assert!(seen.iter().any(|(k, _)| k == b"a"));
        assert!(seen.iter().any(|(k, _)| k == b"c"));
    }

    #[tokio::test]
    async fn serialize_deserialize_round_trip() {
        let mgr = manager();
        let id = mgr.create_store("kv", "int64", "rstring").await.unwrap();

        let k1 = encode(&TypedValue::Int64(1), "int64").unwrap();
        let v1 = encode(&TypedValue::Rstring("one".into()), "rstring").unwrap();
        let k2 = encode(&TypedValue::Int64(2), "int64").unwrap();
        let v2 = encode(&TypedValue::Rstring("two".into()), "rstring").unwrap();
        mgr.put(id, &k1, &v1).await.unwrap();
        mgr.put(id, &k2, &v2).await.unwrap();

        let blob = mgr.serialize(id).await.unwrap();

        let other = mgr.create_store("kv2", "int64", "rstring").await.unwrap();
        let pairs = mgr.deserialize(other, &blob).await.unwrap();
        assert_eq!(pairs, 2);
        assert_eq!(mgr.get(other, &k1).await.unwrap(), Some(v1));
        assert_eq!(mgr.get(other, &k2).await.unwrap(), Some(v2));
    }
}
