//! Redis Cluster backend adapter.
//!
//! Same hash-per-store layout as the single-node adapter, but hash tags
//! (`{store_id}`) pin every key belonging to one store to the same hash
//! slot so `HKEYS`/`HGETALL` stay single-node operations even when the
//! keyspace is sharded across the cluster.

use async_trait::async_trait;
use redis_cluster_async::redis::AsyncCommands;
use redis_cluster_async::Client;
use tokio::sync::RwLock;

use crate::db::{keys, Credentials, DbLayer, LockId, ServerEndpoint, StoreId};
use crate::error::{DpsError, ErrorCode};

type ClusterConnection = redis_cluster_async::Connection;

fn store_hash_key(id: StoreId) -> String {
    format!("{{dps-store-{id}}}:data")
}

fn header_hash_key(id: StoreId) -> String {
    format!("{{dps-store-{id}}}:header")
}

fn ttl_key(key: &[u8]) -> Vec<u8> {
    let mut out = format!("{}:", keys::TTL_NAMESPACE_KEY).into_bytes();
    out.extend_from_slice(key);
    out
}

/// Redis Cluster backend.
pub struct RedisClusterBackend {
    conn: RwLock<Option<ClusterConnection>>,
    servers: RwLock<Vec<ServerEndpoint>>,
}

impl RedisClusterBackend {
    pub fn new() -> Self {
        Self {
            conn: RwLock::new(None),
            servers: RwLock::new(Vec::new()),
        }
    }

    async fn connection(&self) -> Result<ClusterConnection, DpsError> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))
    }
}

impl Default for RedisClusterBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbLayer for RedisClusterBackend {
    async fn connect(&self, servers: &[ServerEndpoint], _credentials: &Credentials) -> Result<(), DpsError> {
        if servers.is_empty() {
            return Err(DpsError::with_context(ErrorCode::ConnectionFailed, "no servers configured"));
        }
        let urls: Vec<String> = servers.iter().map(|s| format!("redis://{}", s.0)).collect();
        let client = Client::open(urls.iter().map(String::as_str).collect::<Vec<_>>())
            .map_err(|e| DpsError::with_context(ErrorCode::ConnectionFailed, e.to_string()))?;
        let conn = client
            .get_connection()
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::ConnectionFailed, e.to_string()))?;
        *self.conn.write().await = Some(conn);
        *self.servers.write().await = servers.to_vec();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn.try_read().map(|g| g.is_some()).unwrap_or(false)
    }

    async fn reconnect(&self) -> Result<(), DpsError> {
        let servers = self.servers.read().await.clone();
        self.connect(&servers, &Credentials::default()).await
    }

    async fn create_store(&self, name: &str, key_type: &str, value_type: &str) -> Result<StoreId, DpsError> {
        let mut conn = self.connection().await?;
        let index_key = keys::name_index_key(name);
        let created: bool = conn
            .set_nx(&index_key, 0u64)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        if !created {
            return Err(DpsError::new(ErrorCode::StoreExists));
        }
        let id: u64 = conn
            .incr(keys::GUID_KEY, 1)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let _: () = conn
            .set(&index_key, id)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let _: () = conn
            .hset_multiple(
                header_hash_key(StoreId(id)),
                &[("0", name), ("2", key_type), ("3", value_type)],
            )
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
        let mut conn = self.connection().await?;
        let id: Option<u64> = conn
            .get(keys::name_index_key(name))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(StoreId(id.unwrap_or(0)))
    }

    async fn remove_store(&self, id: StoreId) -> Result<bool, DpsError> {
        let mut conn = self.connection().await?;
        let name: Option<String> = conn
            .hget(header_hash_key(id), "0")
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let Some(name) = name else { return Ok(false) };
        let _: () = conn
            .del(&[store_hash_key(id), header_hash_key(id), keys::name_index_key(&name)])
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(true)
    }

    async fn get_store_name(&self, id: StoreId) -> Result<String, DpsError> {
        self.header_field(id, "0").await
    }

    async fn get_key_type(&self, id: StoreId) -> Result<String, DpsError> {
        self.header_field(id, "2").await
    }

    async fn get_value_type(&self, id: StoreId) -> Result<String, DpsError> {
        self.header_field(id, "3").await
    }

    async fn put(&self, id: StoreId, key: &[u8], value: &[u8]) -> Result<bool, DpsError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .hset(store_hash_key(id), key, value)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
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
        let mut conn = self.connection().await?;
        conn.hget(store_hash_key(id), key)
            .await
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
        let mut conn = self.connection().await?;
        let removed: u64 = conn
            .hdel(store_hash_key(id), key)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(removed > 0)
    }

    async fn has(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        let mut conn = self.connection().await?;
        conn.hexists(store_hash_key(id), key)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))
    }

    async fn clear(&self, id: StoreId) -> Result<(), DpsError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .del(store_hash_key(id))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(())
    }

    async fn size(&self, id: StoreId) -> Result<u64, DpsError> {
        let mut conn = self.connection().await?;
        conn.hlen(store_hash_key(id))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))
    }

    async fn list_keys(&self, id: StoreId) -> Result<Vec<Vec<u8>>, DpsError> {
        let mut conn = self.connection().await?;
        conn.hkeys(store_hash_key(id))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))
    }

    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl_seconds: u64) -> Result<bool, DpsError> {
        let mut conn = self.connection().await?;
        if ttl_seconds == 0 {
            let _: () = conn
                .set(ttl_key(key), value)
                .await
                .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        } else {
            let _: () = conn
                .set_ex(ttl_key(key), value, ttl_seconds)
                .await
                .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        }
        Ok(true)
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DpsError> {
        let mut conn = self.connection().await?;
        conn.get(ttl_key(key))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn
            .del(ttl_key(key))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(removed > 0)
    }

    async fn has_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        let mut conn = self.connection().await?;
        conn.exists(ttl_key(key))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))
    }

    async fn create_or_get_lock(&self, name: &str) -> Result<LockId, DpsError> {
        let mut conn = self.connection().await?;
        let index_key = keys::lock_name_index_key(name);
        let created: bool = conn
            .set_nx(&index_key, 0u64)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        if !created {
            let id: u64 = conn
                .get(&index_key)
                .await
                .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
            return Ok(LockId(id));
        }
        let id: u64 = conn
            .incr(keys::GUID_KEY, 1)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let _: () = conn
            .set(&index_key, id)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(LockId(id))
    }

    async fn try_acquire_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let mut conn = self.connection().await?;
        let acquired: bool = redis_cluster_async::redis::cmd("SET")
            .arg(keys::distributed_lock_key(id.0))
            .arg(pid)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await
            .unwrap_or(false);
        Ok(acquired)
    }

    async fn steal_expired_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        self.try_acquire_lock(id, pid, lease_ms).await
    }

    async fn release_lock(&self, id: LockId) -> Result<(), DpsError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .del(keys::distributed_lock_key(id.0))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(())
    }

    async fn remove_lock(&self, id: LockId) -> Result<bool, DpsError> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn
            .del(keys::distributed_lock_key(id.0))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(removed > 0)
    }

    async fn get_pid_for_lock(&self, name: &str) -> Result<Option<u32>, DpsError> {
        let mut conn = self.connection().await?;
        let id: Option<u64> = conn
            .get(keys::lock_name_index_key(name))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let Some(id) = id else { return Ok(None) };
        conn.get(keys::distributed_lock_key(id))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))
    }

    async fn run_command_fire_and_forget(&self, cmd: &str) -> Result<(), DpsError> {
        let tokens: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
        let _ = self.run_command_tokens(&tokens).await;
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
            "redis cluster does not support HTTP-style commands",
        ))
    }

    async fn run_command_tokens(&self, tokens: &[String]) -> Result<Vec<u8>, DpsError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis_cluster_async::redis::cmd(tokens.first().map(String::as_str).unwrap_or(""));
        for token in tokens.iter().skip(1) {
            cmd.arg(token);
        }
        let reply: redis_cluster_async::redis::Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(format!("{reply:?}").into_bytes())
    }
}

impl RedisClusterBackend {
    async fn header_field(&self, id: StoreId, token: &str) -> Result<String, DpsError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn
            .hget(header_hash_key(id), token)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        value.ok_or_else(|| DpsError::new(ErrorCode::StoreNotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_hash_key_is_hash_tagged() {
        assert_eq!(store_hash_key(StoreId(3)), "{dps-store-3}:data");
    }

    #[test]
    fn header_hash_key_shares_the_hash_tag() {
        assert_eq!(header_hash_key(StoreId(3)), "{dps-store-3}:header");
    }
}
