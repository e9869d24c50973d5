//! HBase backend adapter, driven over the HBase REST
//! gateway (Stargate) via `reqwest`. The gateway's JSON protocol requires
//! every row key, column, and cell value to be base64-encoded, and has no
//! notion of scanning a single row's column family back in insertion
//! order cheaply for our purposes, so -- as with Memcached and Cloudant --
//! the key set is tracked in [`common::KeySetRegistry`].

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::adapters::common::{b64_decode_key, b64_encode_key, now_ms, KeySetRegistry};
use crate::db::{keys, Credentials, DbLayer, LockId, ServerEndpoint, StoreId};
use crate::error::{DpsError, ErrorCode};

const DATA_TABLE: &str = "dps_store_data";
const META_TABLE: &str = "dps_dl_meta_data";
const FAMILY: &str = "cf";

/// HBase backend, via the REST gateway.
pub struct HbaseBackend {
    client: Client,
    base_url: RwLock<Option<String>>,
    keysets: KeySetRegistry,
}

impl HbaseBackend {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: RwLock::new(None),
            keysets: KeySetRegistry::new(),
        }
    }

    async fn base(&self) -> Result<String, DpsError> {
        self.base_url
            .read()
            .await
            .clone()
            .ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))
    }

    async fn ensure_table(&self, table: &str) -> Result<(), DpsError> {
        let base = self.base().await?;
        let schema = json!({ "name": table, "ColumnSchema": [{ "name": FAMILY }] });
        let _ = self.client.post(format!("{base}/{table}/schema")).json(&schema).send().await;
        Ok(())
    }

    /// Writes one cell. HBase REST wants `{"Row": [{"key": b64, "Cell": [{"column": b64, "$": b64}]}]}`.
    async fn put_cell(&self, table: &str, row_key_b64: &str, column: &str, value: &[u8]) -> Result<(), DpsError> {
        let base = self.base().await?;
        let body = json!({
            "Row": [{
                "key": row_key_b64,
                "Cell": [{
                    "column": b64_encode_key(format!("{FAMILY}:{column}").as_bytes()),
                    "$": b64_encode_key(value),
                }],
            }],
        });
        let response = self
            .client
            .put(format!("{base}/{table}/{row_key_b64}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        if !response.status().is_success() {
            return Err(DpsError::with_context(
                ErrorCode::HttpError(response.status().as_u16() as u32),
                "hbase put failed",
            ));
        }
        Ok(())
    }

    async fn get_cell(&self, table: &str, row_key_b64: &str, column: &str) -> Result<Option<Vec<u8>>, DpsError> {
        let base = self.base().await?;
        let column_b64 = b64_encode_key(format!("{FAMILY}:{column}").as_bytes());
        let response = self
            .client
            .get(format!("{base}/{table}/{row_key_b64}/{column_b64}"))
            .send()
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DpsError::with_context(
                ErrorCode::HttpError(response.status().as_u16() as u32),
                "hbase get failed",
            ));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::RestParseFailure, e.to_string()))?;
        let cell_value = body["Row"][0]["Cell"][0]["$"].as_str();
        cell_value.map(b64_decode_key).transpose()
    }

    async fn delete_row(&self, table: &str, row_key_b64: &str) -> Result<bool, DpsError> {
        let base = self.base().await?;
        let existed = self.get_cell(table, row_key_b64, "v").await?.is_some();
        let response = self
            .client
            .delete(format!("{base}/{table}/{row_key_b64}"))
            .send()
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(existed && response.status().is_success())
    }

    fn data_row_key(id: StoreId, key: &[u8]) -> String {
        b64_encode_key(format!("{id}:{}", b64_encode_key(key)).as_bytes())
    }
}

impl Default for HbaseBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbLayer for HbaseBackend {
    async fn connect(&self, servers: &[ServerEndpoint], _credentials: &Credentials) -> Result<(), DpsError> {
        let first = servers
            .first()
            .ok_or_else(|| DpsError::with_context(ErrorCode::ConnectionFailed, "no servers configured"))?;
        *self.base_url.write().await = Some(format!("http://{}", first.0));
        self.ensure_table(DATA_TABLE).await?;
        self.ensure_table(META_TABLE).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.base_url.try_read().map(|g| g.is_some()).unwrap_or(false)
    }

    async fn reconnect(&self) -> Result<(), DpsError> {
        Ok(())
    }

    async fn create_store(&self, name: &str, key_type: &str, value_type: &str) -> Result<StoreId, DpsError> {
        let index_key = b64_encode_key(keys::name_index_key(name).as_bytes());
        if self.get_cell(META_TABLE, &index_key, "v").await?.is_some() {
            return Err(DpsError::new(ErrorCode::StoreExists));
        }
        let guid_key = b64_encode_key(keys::GUID_KEY.as_bytes());
        let current = self
            .get_cell(META_TABLE, &guid_key, "v")
            .await?
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let id = current + 1;
        self.put_cell(META_TABLE, &guid_key, "v", id.to_string().as_bytes()).await?;
        self.put_cell(META_TABLE, &index_key, "v", id.to_string().as_bytes()).await?;
        let header_key = b64_encode_key(format!("dps_header:{id}").as_bytes());
        self.put_cell(META_TABLE, &header_key, "name", name.as_bytes()).await?;
        self.put_cell(META_TABLE, &header_key, "key_type", key_type.as_bytes()).await?;
        self.put_cell(META_TABLE, &header_key, "value_type", value_type.as_bytes()).await?;
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
        let index_key = b64_encode_key(keys::name_index_key(name).as_bytes());
        let value = self.get_cell(META_TABLE, &index_key, "v").await?;
        Ok(value
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(StoreId)
            .unwrap_or(StoreId::NONE))
    }

    async fn remove_store(&self, id: StoreId) -> Result<bool, DpsError> {
        let name = match self.get_store_name(id).await {
            Ok(name) => name,
            Err(_) => return Ok(false),
        };
        for key in self.keysets.snapshot(id) {
            let _ = self.delete_row(DATA_TABLE, &Self::data_row_key(id, &key)).await;
        }
        self.keysets.drop_store(id);
        let index_key = b64_encode_key(keys::name_index_key(&name).as_bytes());
        let _ = self.delete_row(META_TABLE, &index_key).await;
        let header_key = b64_encode_key(format!("dps_header:{id}").as_bytes());
        let _ = self.delete_row(META_TABLE, &header_key).await;
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
        let row_key = Self::data_row_key(id, key);
        let is_new = self.get_cell(DATA_TABLE, &row_key, "v").await?.is_none();
        self.put_cell(DATA_TABLE, &row_key, "v", value).await?;
        if is_new {
            self.keysets.insert(id, key.to_vec());
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
        self.get_cell(DATA_TABLE, &Self::data_row_key(id, key), "v").await
    }

    async fn get_safe(&self, id: StoreId, key: &[u8], value_type: &str) -> Result<Option<Vec<u8>>, DpsError> {
        let declared = self.get_value_type(id).await?;
        if declared != value_type {
            return Err(DpsError::new(ErrorCode::TypeMismatch));
        }
        self.get(id, key).await
    }

    async fn remove(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        let removed = self.delete_row(DATA_TABLE, &Self::data_row_key(id, key)).await?;
        if removed {
            self.keysets.remove(id, key);
        }
        Ok(removed)
    }

    async fn has(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        Ok(self.get(id, key).await?.is_some())
    }

    async fn clear(&self, id: StoreId) -> Result<(), DpsError> {
        for key in self.keysets.snapshot(id) {
            let _ = self.delete_row(DATA_TABLE, &Self::data_row_key(id, &key)).await;
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
        let row_key = b64_encode_key(format!("{}:{}", keys::TTL_NAMESPACE_KEY, b64_encode_key(key)).as_bytes());
        self.put_cell(META_TABLE, &row_key, "v", value).await?;
        if ttl_seconds > 0 {
            let deadline = now_ms() + (ttl_seconds as i64) * 1000;
            self.put_cell(META_TABLE, &row_key, "exp", deadline.to_string().as_bytes()).await?;
        }
        Ok(true)
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DpsError> {
        let row_key = b64_encode_key(format!("{}:{}", keys::TTL_NAMESPACE_KEY, b64_encode_key(key)).as_bytes());
        if let Some(expiry_bytes) = self.get_cell(META_TABLE, &row_key, "exp").await? {
            let deadline: i64 = String::from_utf8_lossy(&expiry_bytes).parse().unwrap_or(i64::MAX);
            if now_ms() >= deadline {
                let _ = self.delete_row(META_TABLE, &row_key).await;
                return Ok(None);
            }
        }
        self.get_cell(META_TABLE, &row_key, "v").await
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        let row_key = b64_encode_key(format!("{}:{}", keys::TTL_NAMESPACE_KEY, b64_encode_key(key)).as_bytes());
        self.delete_row(META_TABLE, &row_key).await
    }

    async fn has_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        Ok(self.get_ttl(key).await?.is_some())
    }

    async fn create_or_get_lock(&self, name: &str) -> Result<LockId, DpsError> {
        let index_key = b64_encode_key(format!("dps_name_of_this_lock:{name}").as_bytes());
        if let Some(bytes) = self.get_cell(META_TABLE, &index_key, "v").await? {
            if let Ok(id) = String::from_utf8_lossy(&bytes).parse() {
                return Ok(LockId(id));
            }
        }
        let guid_key = b64_encode_key(keys::GUID_KEY.as_bytes());
        let current = self
            .get_cell(META_TABLE, &guid_key, "v")
            .await?
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let id = current + 1;
        self.put_cell(META_TABLE, &guid_key, "v", id.to_string().as_bytes()).await?;
        self.put_cell(META_TABLE, &index_key, "v", id.to_string().as_bytes()).await?;
        Ok(LockId(id))
    }

    async fn try_acquire_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let row_key = b64_encode_key(keys::distributed_lock_key(id.0).as_bytes());
        if self.get_cell(META_TABLE, &row_key, "pid").await?.is_some() {
            return Ok(false);
        }
        let deadline = now_ms() + lease_ms as i64;
        self.put_cell(META_TABLE, &row_key, "pid", pid.to_string().as_bytes()).await?;
        self.put_cell(META_TABLE, &row_key, "deadline", deadline.to_string().as_bytes()).await?;
        Ok(true)
    }

    async fn steal_expired_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let row_key = b64_encode_key(keys::distributed_lock_key(id.0).as_bytes());
        let Some(deadline_bytes) = self.get_cell(META_TABLE, &row_key, "deadline").await? else {
            return self.try_acquire_lock(id, pid, lease_ms).await;
        };
        let old_deadline: i64 = String::from_utf8_lossy(&deadline_bytes).parse().unwrap_or(i64::MAX);
        if old_deadline > now_ms() {
            return Ok(false);
        }
        let new_deadline = now_ms() + lease_ms as i64;
        self.put_cell(META_TABLE, &row_key, "pid", pid.to_string().as_bytes()).await?;
        self.put_cell(META_TABLE, &row_key, "deadline", new_deadline.to_string().as_bytes()).await?;
        Ok(true)
    }

    async fn release_lock(&self, id: LockId) -> Result<(), DpsError> {
        let row_key = b64_encode_key(keys::distributed_lock_key(id.0).as_bytes());
        let _ = self.delete_row(META_TABLE, &row_key).await;
        Ok(())
    }

    async fn remove_lock(&self, id: LockId) -> Result<bool, DpsError> {
        let row_key = b64_encode_key(keys::distributed_lock_key(id.0).as_bytes());
        self.delete_row(META_TABLE, &row_key).await
    }

    async fn get_pid_for_lock(&self, name: &str) -> Result<Option<u32>, DpsError> {
        let id = self.create_or_get_lock(name).await?;
        let row_key = b64_encode_key(keys::distributed_lock_key(id.0).as_bytes());
        let bytes = self.get_cell(META_TABLE, &row_key, "pid").await?;
        Ok(bytes.and_then(|b| String::from_utf8_lossy(&b).parse().ok()))
    }

    async fn run_command_fire_and_forget(&self, _cmd: &str) -> Result<(), DpsError> {
        Ok(())
    }

    async fn run_command_http(
        &self,
        verb: &str,
        url: &str,
        path: &str,
        query: &str,
        body: &[u8],
    ) -> Result<(Vec<u8>, u32), DpsError> {
        let full_url = if query.is_empty() {
            format!("{url}{path}")
        } else {
            format!("{url}{path}?{query}")
        };
        let method = reqwest::Method::from_bytes(verb.as_bytes())
            .map_err(|_| DpsError::with_context(ErrorCode::RestParseFailure, "invalid HTTP verb"))?;
        let response = self
            .client
            .request(method, full_url)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let status = response.status().as_u16() as u32;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok((bytes.to_vec(), status))
    }

    async fn run_command_tokens(&self, _tokens: &[String]) -> Result<Vec<u8>, DpsError> {
        Err(DpsError::with_context(
            ErrorCode::BackendDriver,
            "hbase does not support token-array native commands",
        ))
    }
}

impl HbaseBackend {
    async fn header_field(&self, id: StoreId, field: &str) -> Result<String, DpsError> {
        let header_key = b64_encode_key(format!("dps_header:{id}").as_bytes());
        let bytes = self
            .get_cell(META_TABLE, &header_key, field)
            .await?
            .ok_or_else(|| DpsError::new(ErrorCode::StoreNotFound))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_row_key_is_printable() {
        let key = HbaseBackend::data_row_key(StoreId(4), b"\x00\xffkey");
        assert!(key.chars().all(|c| c.is_ascii_graphic()));
    }
}
