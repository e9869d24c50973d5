//! Cassandra backend adapter, built on `scylla` (the CQL driver also
//! compatible with real Cassandra clusters).
//!
//! Unlike Memcached/HBase/Cloudant, Cassandra's clustering columns give a
//! native per-partition scan, so store contents need no auxiliary key
//! set: `store_data` is partitioned by `store_id` with `user_key` as the
//! clustering column, and `SELECT * WHERE store_id = ?` already returns
//! every key in a consistent order. Store creation, name lookup, and lock
//! acquisition all go through lightweight transactions (`IF NOT EXISTS`
//! / `IF col = ?`), Cassandra's only compare-and-swap primitive.

use async_trait::async_trait;
use scylla::{Session, SessionBuilder};

use crate::db::{keys, Credentials, DbLayer, LockId, ServerEndpoint, StoreId};
use crate::error::{DpsError, ErrorCode};

const KEYSPACE: &str = "dps";

const SCHEMA: &[&str] = &[
    "CREATE KEYSPACE IF NOT EXISTS dps WITH replication = {'class': 'SimpleStrategy', 'replication_factor': 1}",
    "CREATE TABLE IF NOT EXISTS dps.store_headers (store_id bigint PRIMARY KEY, name text, key_type text, value_type text)",
    "CREATE TABLE IF NOT EXISTS dps.name_index (name text PRIMARY KEY, store_id bigint)",
    "CREATE TABLE IF NOT EXISTS dps.store_data (store_id bigint, user_key blob, value blob, PRIMARY KEY (store_id, user_key))",
    "CREATE TABLE IF NOT EXISTS dps.ttl_kv (key blob PRIMARY KEY, value blob)",
    "CREATE TABLE IF NOT EXISTS dps.locks (lock_id bigint PRIMARY KEY, holder_pid int, lease_deadline_ms bigint)",
    "CREATE TABLE IF NOT EXISTS dps.lock_name_index (name text PRIMARY KEY, lock_id bigint)",
    "CREATE TABLE IF NOT EXISTS dps.guid (name text PRIMARY KEY, value bigint)",
];

/// Cassandra backend.
pub struct CassandraBackend {
    session: tokio::sync::RwLock<Option<Session>>,
}

impl CassandraBackend {
    pub fn new() -> Self {
        Self {
            session: tokio::sync::RwLock::new(None),
        }
    }

    async fn next_guid(&self, name: &str) -> Result<u64, DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        loop {
            let row = session
                .query_unpaged("SELECT value FROM dps.guid WHERE name = ?", (name,))
                .await
                .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
                .into_rows_result()
                .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
            let current: i64 = row
                .rows::<(i64,)>()
                .ok()
                .and_then(|mut r| r.next())
                .and_then(Result::ok)
                .map(|(v,)| v)
                .unwrap_or(0);
            let next = current + 1;
            let applied = session
                .query_unpaged(
                    "UPDATE dps.guid SET value = ? WHERE name = ? IF value = ?",
                    (next, name, current),
                )
                .await
                .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
            if applied.result_not_rows().is_ok() {
                return Ok(next as u64);
            }
        }
    }
}

impl Default for CassandraBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbLayer for CassandraBackend {
    async fn connect(&self, servers: &[ServerEndpoint], _credentials: &Credentials) -> Result<(), DpsError> {
        let known_nodes: Vec<&str> = servers.iter().map(|s| s.0.as_str()).collect();
        let session = SessionBuilder::new()
            .known_nodes(&known_nodes)
            .build()
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::ConnectionFailed, e.to_string()))?;
        for statement in SCHEMA {
            session
                .query_unpaged(*statement, &[])
                .await
                .map_err(|e| DpsError::with_context(ErrorCode::ConnectionFailed, e.to_string()))?;
        }
        session
            .use_keyspace(KEYSPACE, false)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::ConnectionFailed, e.to_string()))?;
        *self.session.write().await = Some(session);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.try_read().map(|g| g.is_some()).unwrap_or(false)
    }

    async fn reconnect(&self) -> Result<(), DpsError> {
        Err(DpsError::with_context(
            ErrorCode::ReconnectNeeded,
            "cassandra sessions self-heal; call connect() again with the original server list",
        ))
    }

    async fn create_store(&self, name: &str, key_type: &str, value_type: &str) -> Result<StoreId, DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let id = self.next_guid(keys::GUID_KEY).await?;
        let applied = session
            .query_unpaged(
                "INSERT INTO name_index (name, store_id) VALUES (?, ?) IF NOT EXISTS",
                (name, id as i64),
            )
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        if applied.result_not_rows().is_err() {
            return Err(DpsError::new(ErrorCode::StoreExists));
        }
        session
            .query_unpaged(
                "INSERT INTO store_headers (store_id, name, key_type, value_type) VALUES (?, ?, ?, ?)",
                (id as i64, name, key_type, value_type),
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
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let rows = session
            .query_unpaged("SELECT store_id FROM name_index WHERE name = ?", (name,))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
            .into_rows_result()
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let id = rows
            .rows::<(i64,)>()
            .ok()
            .and_then(|mut r| r.next())
            .and_then(Result::ok)
            .map(|(v,)| v as u64)
            .unwrap_or(0);
        Ok(StoreId(id))
    }

    async fn remove_store(&self, id: StoreId) -> Result<bool, DpsError> {
        let name = match self.get_store_name(id).await {
            Ok(name) => name,
            Err(_) => return Ok(false),
        };
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        session
            .query_unpaged("DELETE FROM store_data WHERE store_id = ?", (id.0 as i64,))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        session
            .query_unpaged("DELETE FROM store_headers WHERE store_id = ?", (id.0 as i64,))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        session
            .query_unpaged("DELETE FROM name_index WHERE name = ?", (name,))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(true)
    }

    async fn get_store_name(&self, id: StoreId) -> Result<String, DpsError> {
        self.header_field(id, "name").await
    }

    async fn get_key_type(&self, id: StoreId) -> Result<String, DpsError> {
        self.header_field(id, "key_type").await
    }

    async fn get_value_type(&self, id: StoreId) -> Result<String, DpsError> {
        self.header_field(id, "value_type").await
    }

    async fn put(&self, id: StoreId, key: &[u8], value: &[u8]) -> Result<bool, DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        session
            .query_unpaged(
                "INSERT INTO store_data (store_id, user_key, value) VALUES (?, ?, ?)",
                (id.0 as i64, key.to_vec(), value.to_vec()),
            )
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
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let rows = session
            .query_unpaged(
                "SELECT value FROM store_data WHERE store_id = ? AND user_key = ?",
                (id.0 as i64, key.to_vec()),
            )
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
            .into_rows_result()
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(rows
            .rows::<(Vec<u8>,)>()
            .ok()
            .and_then(|mut r| r.next())
            .and_then(Result::ok)
            .map(|(v,)| v))
    }

    async fn get_safe(&self, id: StoreId, key: &[u8], value_type: &str) -> Result<Option<Vec<u8>>, DpsError> {
        let declared = self.get_value_type(id).await?;
        if declared != value_type {
            return Err(DpsError::new(ErrorCode::TypeMismatch));
        }
        self.get(id, key).await
    }

    async fn remove(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        let existed = self.has(id, key).await?;
        if !existed {
            return Ok(false);
        }
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        session
            .query_unpaged(
                "DELETE FROM store_data WHERE store_id = ? AND user_key = ?",
                (id.0 as i64, key.to_vec()),
            )
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(true)
    }

    async fn has(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        Ok(self.get(id, key).await?.is_some())
    }

    async fn clear(&self, id: StoreId) -> Result<(), DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        session
            .query_unpaged("DELETE FROM store_data WHERE store_id = ?", (id.0 as i64,))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(())
    }

    async fn size(&self, id: StoreId) -> Result<u64, DpsError> {
        Ok(self.list_keys(id).await?.len() as u64)
    }

    async fn list_keys(&self, id: StoreId) -> Result<Vec<Vec<u8>>, DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let rows = session
            .query_unpaged("SELECT user_key FROM store_data WHERE store_id = ?", (id.0 as i64,))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
            .into_rows_result()
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(rows
            .rows::<(Vec<u8>,)>()
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
            .filter_map(Result::ok)
            .map(|(k,)| k)
            .collect())
    }

    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl_seconds: u64) -> Result<bool, DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        if ttl_seconds == 0 {
            session
                .query_unpaged(
                    "INSERT INTO ttl_kv (key, value) VALUES (?, ?)",
                    (key.to_vec(), value.to_vec()),
                )
                .await
        } else {
            session
                .query_unpaged(
                    "INSERT INTO ttl_kv (key, value) VALUES (?, ?) USING TTL ?",
                    (key.to_vec(), value.to_vec(), ttl_seconds as i32),
                )
                .await
        }
        .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(true)
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let rows = session
            .query_unpaged("SELECT value FROM ttl_kv WHERE key = ?", (key.to_vec(),))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
            .into_rows_result()
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(rows
            .rows::<(Vec<u8>,)>()
            .ok()
            .and_then(|mut r| r.next())
            .and_then(Result::ok)
            .map(|(v,)| v))
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        let existed = self.get_ttl(key).await?.is_some();
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        session
            .query_unpaged("DELETE FROM ttl_kv WHERE key = ?", (key.to_vec(),))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(existed)
    }

    async fn has_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        Ok(self.get_ttl(key).await?.is_some())
    }

    async fn create_or_get_lock(&self, name: &str) -> Result<LockId, DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let rows = session
            .query_unpaged("SELECT lock_id FROM lock_name_index WHERE name = ?", (name,))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
            .into_rows_result()
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        if let Some((id,)) = rows.rows::<(i64,)>().ok().and_then(|mut r| r.next()).and_then(Result::ok) {
            return Ok(LockId(id as u64));
        }
        drop(guard);
        let id = self.next_guid(keys::GUID_KEY).await?;
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        session
            .query_unpaged(
                "INSERT INTO lock_name_index (name, lock_id) VALUES (?, ?) IF NOT EXISTS",
                (name, id as i64),
            )
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(LockId(id))
    }

    async fn try_acquire_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let deadline = crate::adapters::common::now_ms() + lease_ms as i64;
        let applied = session
            .query_unpaged(
                "INSERT INTO locks (lock_id, holder_pid, lease_deadline_ms) VALUES (?, ?, ?) IF NOT EXISTS",
                (id.0 as i64, pid as i32, deadline),
            )
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(applied.result_not_rows().is_err())
    }

    async fn steal_expired_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let rows = session
            .query_unpaged("SELECT lease_deadline_ms FROM locks WHERE lock_id = ?", (id.0 as i64,))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
            .into_rows_result()
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let Some((old_deadline,)) = rows.rows::<(i64,)>().ok().and_then(|mut r| r.next()).and_then(Result::ok) else {
            return self.try_acquire_lock(id, pid, lease_ms).await;
        };
        if old_deadline > crate::adapters::common::now_ms() {
            return Ok(false);
        }
        let new_deadline = crate::adapters::common::now_ms() + lease_ms as i64;
        let applied = session
            .query_unpaged(
                "UPDATE locks SET holder_pid = ?, lease_deadline_ms = ? WHERE lock_id = ? IF lease_deadline_ms = ?",
                (pid as i32, new_deadline, id.0 as i64, old_deadline),
            )
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(applied.result_not_rows().is_ok())
    }

    async fn release_lock(&self, id: LockId) -> Result<(), DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        session
            .query_unpaged("DELETE FROM locks WHERE lock_id = ?", (id.0 as i64,))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(())
    }

    async fn remove_lock(&self, id: LockId) -> Result<bool, DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        session
            .query_unpaged("DELETE FROM locks WHERE lock_id = ?", (id.0 as i64,))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(true)
    }

    async fn get_pid_for_lock(&self, name: &str) -> Result<Option<u32>, DpsError> {
        let id = self.create_or_get_lock(name).await?;
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let rows = session
            .query_unpaged("SELECT holder_pid FROM locks WHERE lock_id = ?", (id.0 as i64,))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
            .into_rows_result()
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(rows
            .rows::<(i32,)>()
            .ok()
            .and_then(|mut r| r.next())
            .and_then(Result::ok)
            .map(|(pid,)| pid as u32))
    }

    async fn run_command_fire_and_forget(&self, cmd: &str) -> Result<(), DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let _ = session.query_unpaged(cmd.to_string(), &[]).await;
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
            "cassandra does not support HTTP-style commands",
        ))
    }

    async fn run_command_tokens(&self, tokens: &[String]) -> Result<Vec<u8>, DpsError> {
        self.run_command_fire_and_forget(&tokens.join(" ")).await?;
        Ok(Vec::new())
    }
}

impl CassandraBackend {
    async fn header_field(&self, id: StoreId, field: &str) -> Result<String, DpsError> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))?;
        let query = format!("SELECT {field} FROM store_headers WHERE store_id = ?");
        let rows = session
            .query_unpaged(query, (id.0 as i64,))
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
            .into_rows_result()
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        rows.rows::<(String,)>()
            .ok()
            .and_then(|mut r| r.next())
            .and_then(Result::ok)
            .map(|(v,)| v)
            .ok_or_else(|| DpsError::new(ErrorCode::StoreNotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_keyspace_first() {
        assert!(SCHEMA[0].contains("CREATE KEYSPACE"));
    }
}
