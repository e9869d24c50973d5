//! Redis (single-node) backend adapter.
//!
//! Store contents live in a Redis hash (`HSET`/`HGET`/`HDEL`/`HKEYS`), so
//! Redis needs no auxiliary key-set: it is the one backend with a native
//! scan primitive. Locks use `SET NX PX`; TTL entries use `SETEX`.
//! Atomic multi-step operations (`create_store`, `put_safe`,
//! `try_acquire_lock`) are Lua scripts (`redis::Script`).

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::RwLock;

use crate::db::{keys, Credentials, DbLayer, LockId, ServerEndpoint, StoreId};
use crate::error::{DpsError, ErrorCode};

fn store_hash_key(id: StoreId) -> String {
    format!("dps_store_data:{id}")
}

fn header_hash_key(id: StoreId) -> String {
    format!("dps_header:{id}")
}

fn ttl_key(key: &[u8]) -> Vec<u8> {
    let mut out = format!("{}:", keys::TTL_NAMESPACE_KEY).into_bytes();
    out.extend_from_slice(key);
    out
}

/// Creates the store's name index entry and header atomically, using a
/// freshly allocated guid. The header key is derived from the id the
/// script itself allocates, so two concurrent creates never touch the same
/// header key. Returns 0 if the name already exists.
const LUA_CREATE_STORE: &str = r#"
local name_index_key = KEYS[1]
local existing = redis.call('GET', name_index_key)
if existing then
    return 0
end
local id = redis.call('INCR', KEYS[2])
redis.call('SET', name_index_key, id)
local header = 'dps_header:'..id
redis.call('HSET', header, '0', ARGV[1], '1', '0', '2', ARGV[2], '3', ARGV[3])
return id
"#;

/// `SET NX PX` with a lease; returns 1 on success, 0 if already held.
const LUA_TRY_ACQUIRE: &str = r#"
return redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) and 1 or 0
"#;

/// Steals an expired lock: Redis's own `PX` expiry already deletes the key
/// once the lease passes, so "steal" degenerates to the same `SET NX PX`
/// -- if the key is truly gone the set succeeds.
const LUA_STEAL: &str = LUA_TRY_ACQUIRE;

/// Redis single-node backend.
pub struct RedisBackend {
    conn: RwLock<Option<ConnectionManager>>,
    servers: RwLock<Vec<ServerEndpoint>>,
}

impl RedisBackend {
    /// Creates an adapter with no connection yet; call
    /// [`DbLayer::connect`] before use.
    pub fn new() -> Self {
        Self {
            conn: RwLock::new(None),
            servers: RwLock::new(Vec::new()),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, DpsError> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))
    }
}

impl Default for RedisBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbLayer for RedisBackend {
    async fn connect(&self, servers: &[ServerEndpoint], credentials: &Credentials) -> Result<(), DpsError> {
        let first = servers
            .first()
            .ok_or_else(|| DpsError::with_context(ErrorCode::ConnectionFailed, "no servers configured"))?;
        let url = match (&credentials.username, &credentials.password) {
            (Some(user), Some(pass)) => format!("redis://{user}:{pass}@{}", first.0),
            (None, Some(pass)) => format!("redis://:{pass}@{}", first.0),
            _ => format!("redis://{}", first.0),
        };
        let client = redis::Client::open(url)
            .map_err(|e| DpsError::with_context(ErrorCode::ConnectionFailed, e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::ConnectionFailed, e.to_string()))?;
        *self.conn.write().await = Some(manager);
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
        let id: u64 = Script::new(LUA_CREATE_STORE)
            .key(keys::name_index_key(name))
            .key(keys::GUID_KEY)
            .arg(name)
            .arg(key_type)
            .arg(value_type)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        if id == 0 {
            return Err(DpsError::new(ErrorCode::StoreExists));
        }
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
            .hget(header_hash_key(id), keys::token::NAME)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let Some(name) = name else {
            return Ok(false);
        };
        let _: () = conn
            .del(&[
                store_hash_key(id),
                header_hash_key(id),
                keys::name_index_key(&name),
                keys::store_lock_key(id.0),
            ])
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(true)
    }

    async fn get_store_name(&self, id: StoreId) -> Result<String, DpsError> {
        self.header_field(id, keys::token::NAME).await
    }

    async fn get_key_type(&self, id: StoreId) -> Result<String, DpsError> {
        self.header_field(id, keys::token::KEY_TYPE).await
    }

    async fn get_value_type(&self, id: StoreId) -> Result<String, DpsError> {
        self.header_field(id, keys::token::VALUE_TYPE).await
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
        let existing: Option<u64> = conn
            .get(&index_key)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        if let Some(id) = existing {
            return Ok(LockId(id));
        }
        let id: u64 = conn
            .incr(keys::GUID_KEY, 1)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let _: bool = conn
            .set_nx(&index_key, id)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let confirmed: u64 = conn
            .get(&index_key)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(LockId(confirmed))
    }

    async fn try_acquire_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let mut conn = self.connection().await?;
        let acquired: i32 = Script::new(LUA_TRY_ACQUIRE)
            .key(keys::distributed_lock_key(id.0))
            .arg(pid)
            .arg(lease_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(acquired == 1)
    }

    async fn steal_expired_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let mut conn = self.connection().await?;
        let acquired: i32 = Script::new(LUA_STEAL)
            .key(keys::distributed_lock_key(id.0))
            .arg(pid)
            .arg(lease_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(acquired == 1)
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
            "redis does not support HTTP-style commands",
        ))
    }

    async fn run_command_tokens(&self, tokens: &[String]) -> Result<Vec<u8>, DpsError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd(tokens.first().map(String::as_str).unwrap_or(""));
        for token in tokens.iter().skip(1) {
            cmd.arg(token);
        }
        let reply: redis::Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(format!("{reply:?}").into_bytes())
    }
}

impl RedisBackend {
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
    fn ttl_key_is_namespaced() {
        let key = ttl_key(b"session");
        assert!(String::from_utf8_lossy(&key).starts_with("dps_ttl_kv_global_store:"));
    }

    #[test]
    fn store_hash_key_embeds_id() {
        assert_eq!(store_hash_key(StoreId(5)), "dps_store_data:5");
    }
}
