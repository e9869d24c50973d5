//! Memcached backend adapter.
//!
//! Memcached has no hash type and no scan, so store contents are
//! individual keys (`dps_data:<id>:<base64 key>`) and the key set is
//! tracked out-of-band in a "catalog": one or more comma-joined,
//! base64-encoded-key segments capped at
//! [`common::CATALOG_SEGMENT_MAX_BYTES`], indexed by the header's
//! catalog-segment-count field. Locks piggyback on memcached's native
//! `add` (atomic create-if-absent) and its own expiry for leases.

use async_memcached::Client;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::adapters::common::{self, b64_decode_key, b64_encode_key};
use crate::db::{keys, Credentials, DbLayer, LockId, ServerEndpoint, StoreId};
use crate::error::{DpsError, ErrorCode};

fn header_key(id: StoreId, field: &str) -> String {
    format!("dps_header:{id}:{field}")
}

fn catalog_segment_key(id: StoreId, segment: u32) -> String {
    format!("dps_catalog:{id}:{segment}")
}

/// Memcached backend. `async-memcached`'s client is not internally
/// clonable across tasks, so connection access is serialized.
pub struct MemcachedBackend {
    client: Mutex<Option<Client>>,
    servers: Mutex<Vec<ServerEndpoint>>,
}

impl MemcachedBackend {
    pub fn new() -> Self {
        Self {
            client: Mutex::new(None),
            servers: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemcachedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbLayer for MemcachedBackend {
    async fn connect(&self, servers: &[ServerEndpoint], _credentials: &Credentials) -> Result<(), DpsError> {
        let first = servers
            .first()
            .ok_or_else(|| DpsError::with_context(ErrorCode::ConnectionFailed, "no servers configured"))?;
        let client = Client::new(format!("tcp://{}", first.0))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::ConnectionFailed, e.to_string()))?;
        *self.client.lock().await = Some(client);
        *self.servers.lock().await = servers.to_vec();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.try_lock().map(|g| g.is_some()).unwrap_or(false)
    }

    async fn reconnect(&self) -> Result<(), DpsError> {
        let servers = self.servers.lock().await.clone();
        self.connect(&servers, &Credentials::default()).await
    }

    async fn create_store(&self, name: &str, key_type: &str, value_type: &str) -> Result<StoreId, DpsError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;

        let index_key = keys::name_index_key(name);
        let id = client
            .increment(&keys::GUID_KEY.to_string(), 1)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;

        client
            .add(&index_key, id.to_string().as_bytes(), None, None)
            .await
            .map_err(|_| DpsError::new(ErrorCode::StoreExists))?;

        client
            .set(&header_key(StoreId(id), keys::token::NAME), name.as_bytes(), None, None)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        client
            .set(
                &header_key(StoreId(id), keys::token::KEY_TYPE),
                key_type.as_bytes(),
                None,
                None,
            )
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        client
            .set(&header_key(StoreId(id), keys::token::VALUE_TYPE), value_type.as_bytes(), None, None)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        client
            .set(&header_key(StoreId(id), keys::token::SIZE), b"0", None, None)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;

        Ok(StoreId(id))
    }

    async fn create_or_get_store(&self, name: &str, key_type: &str, value_type: &str) -> Result<StoreId, DpsError> {
        let existing = self.find_store(name).await?;
        if !existing.is_none() {
            let stored_key_type = self.get_key_type(existing).await?;
            let stored_value_type = self.get_value_type(existing).await?;
            if stored_key_type == key_type && stored_value_type == value_type {
                return Ok(existing);
            }
            return Err(DpsError::new(ErrorCode::StoreExistsWithDifferentTypes));
        }
        self.create_store(name, key_type, value_type).await
    }

    async fn find_store(&self, name: &str) -> Result<StoreId, DpsError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        match client.get(&keys::name_index_key(name)).await {
            Ok(Some(value)) => {
                let id: u64 = String::from_utf8_lossy(&value.data)
                    .parse()
                    .map_err(|_| DpsError::new(ErrorCode::CodecMalformed))?;
                Ok(StoreId(id))
            }
            Ok(None) => Ok(StoreId::NONE),
            Err(e) => Err(DpsError::with_context(ErrorCode::BackendDriver, e.to_string())),
        }
    }

    async fn remove_store(&self, id: StoreId) -> Result<bool, DpsError> {
        let name = match self.get_store_name(id).await {
            Ok(name) => name,
            Err(_) => return Ok(false),
        };
        let keys_to_clear = self.list_keys(id).await.unwrap_or_default();
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        for encoded in &keys_to_clear {
            let _ = client
                .delete(&String::from_utf8_lossy(&common::data_key(id, encoded, true)))
                .await;
        }
        let _ = client.delete(&keys::name_index_key(&name)).await;
        for field in [keys::token::NAME, keys::token::KEY_TYPE, keys::token::VALUE_TYPE, keys::token::SIZE] {
            let _ = client.delete(&header_key(id, field)).await;
        }
        Ok(true)
    }

    async fn get_store_name(&self, id: StoreId) -> Result<String, DpsError> {
        self.read_header_string(id, keys::token::NAME).await
    }

    async fn get_key_type(&self, id: StoreId) -> Result<String, DpsError> {
        self.read_header_string(id, keys::token::KEY_TYPE).await
    }

    async fn get_value_type(&self, id: StoreId) -> Result<String, DpsError> {
        self.read_header_string(id, keys::token::VALUE_TYPE).await
    }

    async fn put(&self, id: StoreId, key: &[u8], value: &[u8]) -> Result<bool, DpsError> {
        let already_present = self.has(id, key).await.unwrap_or(false);
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let physical_key = String::from_utf8_lossy(&common::data_key(id, key, true)).into_owned();
        client
            .set(&physical_key, value, None, None)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        drop(guard);
        if !already_present {
            self.append_to_catalog(id, &b64_encode_key(key)).await?;
        }
        Ok(true)
    }

    async fn put_safe(&self, id: StoreId, key: &[u8], value: &[u8], value_type: &str) -> Result<bool, DpsError> {
        let declared = self.get_value_type(id).await?;
        if declared != value_type {
            return Ok(false);
        }
        self.put(id, key, value).await
    }

    async fn get(&self, id: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, DpsError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let physical_key = String::from_utf8_lossy(&common::data_key(id, key, true)).into_owned();
        client
            .get(&physical_key)
            .await
            .map(|opt| opt.map(|v| v.data))
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))
    }

    async fn get_safe(&self, id: StoreId, key: &[u8], value_type: &str) -> Result<Option<Vec<u8>>, DpsError> {
        let declared = self.get_value_type(id).await?;
        if declared != value_type {
            return Err(DpsError::new(ErrorCode::TypeMismatch));
        }
        self.get(id, key).await
    }

    async fn remove(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        let existed = self.has(id, key).await.unwrap_or(false);
        if !existed {
            return Ok(false);
        }
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let physical_key = String::from_utf8_lossy(&common::data_key(id, key, true)).into_owned();
        let _ = client.delete(&physical_key).await;
        drop(guard);
        self.remove_from_catalog(id, &b64_encode_key(key)).await?;
        Ok(true)
    }

    async fn has(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        Ok(self.get(id, key).await?.is_some())
    }

    async fn clear(&self, id: StoreId) -> Result<(), DpsError> {
        let keys_to_clear = self.list_keys(id).await?;
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        for encoded in &keys_to_clear {
            let _ = client
                .delete(&String::from_utf8_lossy(&common::data_key(id, encoded, true)))
                .await;
        }
        let mut segment = 0u32;
        loop {
            let existed = client.delete(&catalog_segment_key(id, segment)).await.is_ok();
            if !existed {
                break;
            }
            segment += 1;
        }
        Ok(())
    }

    async fn size(&self, id: StoreId) -> Result<u64, DpsError> {
        Ok(self.list_keys(id).await?.len() as u64)
    }

    async fn list_keys(&self, id: StoreId) -> Result<Vec<Vec<u8>>, DpsError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let mut keys_out = Vec::new();
        let mut segment = 0u32;
        loop {
            match client.get(&catalog_segment_key(id, segment)).await {
                Ok(Some(value)) => {
                    let text = String::from_utf8_lossy(&value.data).into_owned();
                    for encoded in common::split_catalog_segment(&text) {
                        keys_out.push(b64_decode_key(&encoded)?);
                    }
                    segment += 1;
                }
                _ => break,
            }
        }
        Ok(keys_out)
    }

    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl_seconds: u64) -> Result<bool, DpsError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let physical_key = format!("{}:{}", keys::TTL_NAMESPACE_KEY, b64_encode_key(key));
        let ttl = if ttl_seconds == 0 { None } else { Some(ttl_seconds as i64) };
        client
            .set(&physical_key, value, ttl, None)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(true)
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DpsError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let physical_key = format!("{}:{}", keys::TTL_NAMESPACE_KEY, b64_encode_key(key));
        client
            .get(&physical_key)
            .await
            .map(|opt| opt.map(|v| v.data))
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        let existed = self.get_ttl(key).await?.is_some();
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let physical_key = format!("{}:{}", keys::TTL_NAMESPACE_KEY, b64_encode_key(key));
        let _ = client.delete(&physical_key).await;
        Ok(existed)
    }

    async fn has_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        Ok(self.get_ttl(key).await?.is_some())
    }

    async fn create_or_get_lock(&self, name: &str) -> Result<LockId, DpsError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let index_key = keys::lock_name_index_key(name);
        if let Ok(Some(value)) = client.get(&index_key).await {
            let id: u64 = String::from_utf8_lossy(&value.data)
                .parse()
                .map_err(|_| DpsError::new(ErrorCode::CodecMalformed))?;
            return Ok(LockId(id));
        }
        let id = client
            .increment(&keys::GUID_KEY.to_string(), 1)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let _ = client.add(&index_key, id.to_string().as_bytes(), None, None).await;
        Ok(LockId(id))
    }

    async fn try_acquire_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let ttl_secs = lease_ms.div_ceil(1000) as i64;
        let acquired = client
            .add(&keys::distributed_lock_key(id.0), pid.to_string().as_bytes(), Some(ttl_secs), None)
            .await
            .is_ok();
        Ok(acquired)
    }

    async fn steal_expired_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        self.try_acquire_lock(id, pid, lease_ms).await
    }

    async fn release_lock(&self, id: LockId) -> Result<(), DpsError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let _ = client.delete(&keys::distributed_lock_key(id.0)).await;
        Ok(())
    }

    async fn remove_lock(&self, id: LockId) -> Result<bool, DpsError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        Ok(client.delete(&keys::distributed_lock_key(id.0)).await.is_ok())
    }

    async fn get_pid_for_lock(&self, name: &str) -> Result<Option<u32>, DpsError> {
        let id = self.create_or_get_lock(name).await?;
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        match client.get(&keys::distributed_lock_key(id.0)).await {
            Ok(Some(value)) => Ok(String::from_utf8_lossy(&value.data).parse().ok()),
            _ => Ok(None),
        }
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
        Err(DpsError::with_context(
            ErrorCode::BackendDriver,
            "memcached does not support HTTP-style commands",
        ))
    }

    async fn run_command_tokens(&self, _tokens: &[String]) -> Result<Vec<u8>, DpsError> {
        Err(DpsError::with_context(
            ErrorCode::BackendDriver,
            "memcached does not support token-array native commands",
        ))
    }
}

impl MemcachedBackend {
    async fn read_header_string(&self, id: StoreId, field: &str) -> Result<String, DpsError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        match client.get(&header_key(id, field)).await {
            Ok(Some(value)) => Ok(String::from_utf8_lossy(&value.data).into_owned()),
            _ => Err(DpsError::new(ErrorCode::StoreNotFound)),
        }
    }

    /// Appends `encoded_key` to the last catalog segment, starting a new
    /// one once the current segment would exceed
    /// [`common::CATALOG_SEGMENT_MAX_BYTES`]. Not compare-and-swapped:
    /// concurrent writers to the same store can race here the same way
    /// they would against the store's structural lock in the original
    /// design, since `StoreManager` serializes writes per store.
    async fn append_to_catalog(&self, id: StoreId, encoded_key: &str) -> Result<(), DpsError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let mut segment = 0u32;
        let mut current = String::new();
        loop {
            match client.get(&catalog_segment_key(id, segment)).await {
                Ok(Some(value)) => {
                    let text = String::from_utf8_lossy(&value.data).into_owned();
                    if text.len() + encoded_key.len() + 1 < common::CATALOG_SEGMENT_MAX_BYTES {
                        current = text;
                        break;
                    }
                    segment += 1;
                }
                _ => break,
            }
        }
        let mut members = common::split_catalog_segment(&current);
        members.push(encoded_key.to_string());
        let joined = common::join_catalog_segment(&members);
        client
            .set(&catalog_segment_key(id, segment), joined.as_bytes(), None, None)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(())
    }

    async fn remove_from_catalog(&self, id: StoreId, encoded_key: &str) -> Result<(), DpsError> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let mut segment = 0u32;
        loop {
            match client.get(&catalog_segment_key(id, segment)).await {
                Ok(Some(value)) => {
                    let text = String::from_utf8_lossy(&value.data).into_owned();
                    let mut members = common::split_catalog_segment(&text);
                    if let Some(pos) = members.iter().position(|m| m == encoded_key) {
                        members.remove(pos);
                        let joined = common::join_catalog_segment(&members);
                        let _ = client.set(&catalog_segment_key(id, segment), joined.as_bytes(), None, None).await;
                        return Ok(());
                    }
                    segment += 1;
                }
                _ => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_key_is_namespaced_per_store() {
        assert_eq!(header_key(StoreId(2), keys::token::NAME), "dps_header:2:0");
    }

    #[test]
    fn catalog_segment_key_is_namespaced_per_store() {
        assert_eq!(catalog_segment_key(StoreId(2), 0), "dps_catalog:2:0");
    }
}
