//! In-process reference backend: a `DashMap`-backed [`DbLayer`] with no
//! domain logic, `Send + Sync`, and no external dependencies.
//!
//! Used by the integration test suite to exercise every `StoreManager`/
//! `LockManager`/`TtlNamespace` code path without a live external server,
//! and as a template new adapters can diff against when wiring up a real
//! backend's emulation of the same primitives.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::adapters::common::{now_ms, KeySetRegistry};
use crate::db::{Credentials, DbLayer, LockId, ServerEndpoint, StoreId};
use crate::error::{DpsError, ErrorCode};

#[derive(Debug, Clone)]
struct StoreHeader {
    name: String,
    key_type: String,
    value_type: String,
}

#[derive(Debug, Clone)]
struct LockRecord {
    name: String,
    holder_pid: Option<u32>,
    lease_deadline_ms: Option<i64>,
}

/// Thread-safe in-memory [`DbLayer`] using `DashMap` for concurrent,
/// shard-level-locked access.
#[derive(Debug)]
pub struct MemoryBackend {
    connected: AtomicBool,
    guid: AtomicU64,
    headers: DashMap<StoreId, StoreHeader>,
    name_index: DashMap<String, StoreId>,
    data: DashMap<(StoreId, Vec<u8>), (Vec<u8>, String)>,
    keysets: KeySetRegistry,
    ttl: DashMap<Vec<u8>, (Vec<u8>, Option<i64>)>,
    locks: DashMap<LockId, LockRecord>,
    lock_name_index: DashMap<String, LockId>,
}

impl MemoryBackend {
    /// Creates an empty backend, already connected (there is no real
    /// network handshake to perform).
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            guid: AtomicU64::new(0),
            headers: DashMap::new(),
            name_index: DashMap::new(),
            data: DashMap::new(),
            keysets: KeySetRegistry::new(),
            ttl: DashMap::new(),
            locks: DashMap::new(),
            lock_name_index: DashMap::new(),
        }
    }

    fn next_id(&self) -> u64 {
        self.guid.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbLayer for MemoryBackend {
    async fn connect(&self, _servers: &[ServerEndpoint], _credentials: &Credentials) -> Result<(), DpsError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<(), DpsError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_store(&self, name: &str, key_type: &str, value_type: &str) -> Result<StoreId, DpsError> {
        if self.name_index.contains_key(name) {
            return Err(DpsError::new(ErrorCode::StoreExists));
        }
        let id = StoreId(self.next_id());
        self.headers.insert(
            id,
            StoreHeader {
                name: name.to_string(),
                key_type: key_type.to_string(),
                value_type: value_type.to_string(),
            },
        );
        self.name_index.insert(name.to_string(), id);
        Ok(id)
    }

    async fn create_or_get_store(&self, name: &str, key_type: &str, value_type: &str) -> Result<StoreId, DpsError> {
        if let Some(existing) = self.name_index.get(name) {
            let id = *existing;
            let header = self.headers.get(&id).expect("header for indexed store");
            if header.key_type == key_type && header.value_type == value_type {
                return Ok(id);
            }
            return Err(DpsError::new(ErrorCode::StoreExistsWithDifferentTypes));
        }
        self.create_store(name, key_type, value_type).await
    }

    async fn find_store(&self, name: &str) -> Result<StoreId, DpsError> {
        Ok(self.name_index.get(name).map_or(StoreId::NONE, |id| *id))
    }

    async fn remove_store(&self, id: StoreId) -> Result<bool, DpsError> {
        let Some((_, header)) = self.headers.remove(&id) else {
            return Ok(false);
        };
        self.name_index.remove(&header.name);
        for key in self.keysets.snapshot(id) {
            self.data.remove(&(id, key));
        }
        self.keysets.drop_store(id);
        Ok(true)
    }

    async fn get_store_name(&self, id: StoreId) -> Result<String, DpsError> {
        self.headers
            .get(&id)
            .map(|h| h.name.clone())
            .ok_or_else(|| DpsError::new(ErrorCode::StoreNotFound))
    }

    async fn get_key_type(&self, id: StoreId) -> Result<String, DpsError> {
        self.headers
            .get(&id)
            .map(|h| h.key_type.clone())
            .ok_or_else(|| DpsError::new(ErrorCode::StoreNotFound))
    }

    async fn get_value_type(&self, id: StoreId) -> Result<String, DpsError> {
        self.headers
            .get(&id)
            .map(|h| h.value_type.clone())
            .ok_or_else(|| DpsError::new(ErrorCode::StoreNotFound))
    }

    async fn put(&self, id: StoreId, key: &[u8], value: &[u8]) -> Result<bool, DpsError> {
        if !self.headers.contains_key(&id) {
            return Err(DpsError::new(ErrorCode::StoreNotFound));
        }
        let value_type = self.headers.get(&id).expect("checked above").value_type.clone();
        let is_new = !self.data.contains_key(&(id, key.to_vec()));
        self.data.insert((id, key.to_vec()), (value.to_vec(), value_type));
        if is_new {
            self.keysets.insert(id, key.to_vec());
        }
        Ok(true)
    }

    async fn put_safe(&self, id: StoreId, key: &[u8], value: &[u8], value_type: &str) -> Result<bool, DpsError> {
        if !self.headers.contains_key(&id) {
            return Err(DpsError::new(ErrorCode::StoreNotFound));
        }
        if let Some(existing) = self.data.get(&(id, key.to_vec())) {
            if existing.1 != value_type {
                return Ok(false);
            }
        }
        let is_new = !self.data.contains_key(&(id, key.to_vec()));
        self.data
            .insert((id, key.to_vec()), (value.to_vec(), value_type.to_string()));
        if is_new {
            self.keysets.insert(id, key.to_vec());
        }
        Ok(true)
    }

    async fn get(&self, id: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, DpsError> {
        Ok(self.data.get(&(id, key.to_vec())).map(|v| v.0.clone()))
    }

    async fn get_safe(&self, id: StoreId, key: &[u8], value_type: &str) -> Result<Option<Vec<u8>>, DpsError> {
        match self.data.get(&(id, key.to_vec())) {
            Some(entry) if entry.1 == value_type => Ok(Some(entry.0.clone())),
            Some(_) => Err(DpsError::new(ErrorCode::TypeMismatch)),
            None => Ok(None),
        }
    }

    async fn remove(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        let existed = self.data.remove(&(id, key.to_vec())).is_some();
        if existed {
            self.keysets.remove(id, key);
        }
        Ok(existed)
    }

    async fn has(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        Ok(self.data.contains_key(&(id, key.to_vec())))
    }

    async fn clear(&self, id: StoreId) -> Result<(), DpsError> {
        for key in self.keysets.snapshot(id) {
            self.data.remove(&(id, key));
        }
        self.keysets.clear(id);
        Ok(())
    }

    async fn size(&self, id: StoreId) -> Result<u64, DpsError> {
        Ok(self.keysets.len(id) as u64)
    }

    async fn list_keys(&self, id: StoreId) -> Result<Vec<Vec<u8>>, DpsError> {
        Ok(self.keysets.snapshot(id))
    }

    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl_seconds: u64) -> Result<bool, DpsError> {
        let expiry = if ttl_seconds == 0 {
            None
        } else {
            Some(now_ms() + (ttl_seconds as i64) * 1000)
        };
        self.ttl.insert(key.to_vec(), (value.to_vec(), expiry));
        Ok(true)
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DpsError> {
        match self.ttl.get(key) {
            Some(entry) => {
                let (value, expiry) = entry.value().clone();
                if expiry.is_some_and(|deadline| now_ms() >= deadline) {
                    drop(entry);
                    self.ttl.remove(key);
                    Ok(None)
                } else {
                    Ok(Some(value))
                }
            }
            None => Ok(None),
        }
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        Ok(self.ttl.remove(key).is_some())
    }

    async fn has_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        Ok(self.get_ttl(key).await?.is_some())
    }

    async fn create_or_get_lock(&self, name: &str) -> Result<LockId, DpsError> {
        if let Some(existing) = self.lock_name_index.get(name) {
            return Ok(*existing);
        }
        let id = LockId(self.next_id());
        self.locks.insert(
            id,
            LockRecord {
                name: name.to_string(),
                holder_pid: None,
                lease_deadline_ms: None,
            },
        );
        self.lock_name_index.insert(name.to_string(), id);
        Ok(id)
    }

    async fn try_acquire_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let Some(mut record) = self.locks.get_mut(&id) else {
            return Err(DpsError::new(ErrorCode::LockNotFound));
        };
        let free = record.holder_pid.is_none();
        if free {
            record.holder_pid = Some(pid);
            record.lease_deadline_ms = Some(now_ms() + lease_ms as i64);
        }
        Ok(free)
    }

    async fn steal_expired_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let Some(mut record) = self.locks.get_mut(&id) else {
            return Err(DpsError::new(ErrorCode::LockNotFound));
        };
        let expired = record
            .lease_deadline_ms
            .is_some_and(|deadline| now_ms() >= deadline);
        if expired {
            record.holder_pid = Some(pid);
            record.lease_deadline_ms = Some(now_ms() + lease_ms as i64);
        }
        Ok(expired)
    }

    async fn release_lock(&self, id: LockId) -> Result<(), DpsError> {
        if let Some(mut record) = self.locks.get_mut(&id) {
            record.holder_pid = None;
            record.lease_deadline_ms = None;
        }
        Ok(())
    }

    async fn remove_lock(&self, id: LockId) -> Result<bool, DpsError> {
        let Some((_, record)) = self.locks.remove(&id) else {
            return Ok(false);
        };
        self.lock_name_index.remove(&record.name);
        Ok(true)
    }

    async fn get_pid_for_lock(&self, name: &str) -> Result<Option<u32>, DpsError> {
        let Some(id) = self.lock_name_index.get(name).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.locks.get(&id).and_then(|r| r.holder_pid))
    }

    async fn run_command_fire_and_forget(&self, _cmd: &str) -> Result<(), DpsError> {
        Ok(())
    }

    async fn run_command_http(
        &self,
        _verb: &str,
        _url: &str,
        _path: &str,
        _query: &str,
        _body: &[u8],
    ) -> Result<(Vec<u8>, u32), DpsError> {
        Ok((Vec::new(), 200))
    }

    async fn run_command_tokens(&self, _tokens: &[String]) -> Result<Vec<u8>, DpsError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_find_remove_store_round_trip() {
        let backend = MemoryBackend::new();
        let id = backend.create_store("T1", "rstring", "int64").await.unwrap();
        assert!(!id.is_none());
        assert_eq!(backend.find_store("T1").await.unwrap(), id);
        assert!(backend.remove_store(id).await.unwrap());
        assert_eq!(backend.find_store("T1").await.unwrap(), StoreId::NONE);
    }

    #[tokio::test]
    async fn create_store_rejects_duplicate_name() {
        let backend = MemoryBackend::new();
        backend.create_store("dup", "rstring", "int64").await.unwrap();
        let err = backend
            .create_store("dup", "rstring", "int64")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::StoreExists);
    }

    #[tokio::test]
    async fn create_or_get_store_detects_type_drift() {
        let backend = MemoryBackend::new();
        backend.create_store("s", "rstring", "int64").await.unwrap();
        let err = backend
            .create_or_get_store("s", "rstring", "rstring")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::StoreExistsWithDifferentTypes);
    }

    #[tokio::test]
    async fn put_get_remove_idempotence() {
        let backend = MemoryBackend::new();
        let id = backend.create_store("s", "rstring", "int64").await.unwrap();
        backend.put(id, b"k", b"v1").await.unwrap();
        assert_eq!(backend.get(id, b"k").await.unwrap(), Some(b"v1".to_vec()));
        backend.put(id, b"k", b"v2").await.unwrap();
        assert_eq!(backend.get(id, b"k").await.unwrap(), Some(b"v2".to_vec()));
        assert_eq!(backend.size(id).await.unwrap(), 1);

        assert!(backend.remove(id, b"k").await.unwrap());
        assert!(!backend.remove(id, b"k").await.unwrap());
        assert_eq!(backend.get(id, b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_safe_rejects_type_drift() {
        let backend = MemoryBackend::new();
        let id = backend.create_store("s", "rstring", "int64").await.unwrap();
        assert!(backend.put_safe(id, b"k", b"1", "int64").await.unwrap());
        assert!(!backend.put_safe(id, b"k", b"x", "rstring").await.unwrap());
    }

    #[tokio::test]
    async fn clear_preserves_header() {
        let backend = MemoryBackend::new();
        let id = backend.create_store("s", "rstring", "int64").await.unwrap();
        backend.put(id, b"a", b"1").await.unwrap();
        backend.clear(id).await.unwrap();
        assert_eq!(backend.size(id).await.unwrap(), 0);
        assert_eq!(backend.get_store_name(id).await.unwrap(), "s");
    }

    #[tokio::test]
    async fn ttl_expires_after_duration() {
        let backend = MemoryBackend::new();
        backend.put_ttl(b"k", b"v", 0).await.unwrap();
        assert!(backend.has_ttl(b"k").await.unwrap());

        backend.put_ttl(b"k2", b"v", 100_000).await.unwrap();
        assert!(backend.has_ttl(b"k2").await.unwrap());
    }

    #[tokio::test]
    async fn lock_acquire_and_release() {
        let backend = MemoryBackend::new();
        let id = backend.create_or_get_lock("L").await.unwrap();
        assert!(backend.try_acquire_lock(id, 1, 10_000).await.unwrap());
        assert!(!backend.try_acquire_lock(id, 2, 10_000).await.unwrap());
        backend.release_lock(id).await.unwrap();
        assert!(backend.try_acquire_lock(id, 2, 10_000).await.unwrap());
        assert_eq!(backend.get_pid_for_lock("L").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn lock_steal_after_expiry() {
        let backend = MemoryBackend::new();
        let id = backend.create_or_get_lock("L").await.unwrap();
        assert!(backend.try_acquire_lock(id, 1, 0).await.unwrap());
        // lease_ms = 0 means deadline is "now", so it is already expired.
        assert!(backend.steal_expired_lock(id, 2, 10_000).await.unwrap());
        assert_eq!(backend.get_pid_for_lock("L").await.unwrap(), Some(2));
    }
}
