//! IBM Cloudant backend adapter, a CouchDB-compatible
//! document store driven entirely over its HTTP/JSON API via `reqwest`.
//!
//! Documents are addressed by id, never queried by filter, so -- like
//! Memcached/HBase -- store contents need the auxiliary
//! [`common::KeySetRegistry`] to answer `list_keys`/`size` without an
//! index scan. Each put/get issues one JSON document request; Cloudant's
//! own `_rev` field gives optimistic concurrency, used here as the CAS
//! primitive for store creation and locks.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::adapters::common::{b64_decode_key, b64_encode_key, now_ms, KeySetRegistry};
use crate::db::{keys, Credentials, DbLayer, LockId, ServerEndpoint, StoreId};
use crate::error::{DpsError, ErrorCode};

const META_DB: &str = "dps_dl_meta_data";
const DATA_DB: &str = "dps_store_data";

/// Cloudant (CouchDB-protocol) backend.
pub struct CloudantBackend {
    client: Client,
    base_url: RwLock<Option<String>>,
    keysets: KeySetRegistry,
}

impl CloudantBackend {
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

    async fn put_document(&self, db: &str, doc_id: &str, body: Value) -> Result<(), DpsError> {
        let base = self.base().await?;
        let existing_rev = self.get_document(db, doc_id).await?.and_then(|d| d.get("_rev").cloned());
        let mut body = body;
        if let Some(rev) = existing_rev {
            body["_rev"] = rev;
        }
        let response = self
            .client
            .put(format!("{base}/{db}/{doc_id}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        if !response.status().is_success() {
            return Err(DpsError::with_context(
                ErrorCode::HttpError(response.status().as_u16() as u32),
                "cloudant put failed",
            ));
        }
        Ok(())
    }

    async fn get_document(&self, db: &str, doc_id: &str) -> Result<Option<Value>, DpsError> {
        let base = self.base().await?;
        let response = self
            .client
            .get(format!("{base}/{db}/{doc_id}"))
            .send()
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DpsError::with_context(
                ErrorCode::HttpError(response.status().as_u16() as u32),
                "cloudant get failed",
            ));
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| DpsError::with_context(ErrorCode::RestParseFailure, e.to_string()))
    }

    async fn delete_document(&self, db: &str, doc_id: &str) -> Result<bool, DpsError> {
        let Some(doc) = self.get_document(db, doc_id).await? else {
            return Ok(false);
        };
        let rev = doc.get("_rev").and_then(Value::as_str).unwrap_or_default();
        let base = self.base().await?;
        let response = self
            .client
            .delete(format!("{base}/{db}/{doc_id}?rev={rev}"))
            .send()
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(response.status().is_success())
    }

    fn data_doc_id(id: StoreId, key: &[u8]) -> String {
        format!("{id}-{}", b64_encode_key(key))
    }
}

impl Default for CloudantBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbLayer for CloudantBackend {
    async fn connect(&self, servers: &[ServerEndpoint], credentials: &Credentials) -> Result<(), DpsError> {
        let first = servers
            .first()
            .ok_or_else(|| DpsError::with_context(ErrorCode::ConnectionFailed, "no servers configured"))?;
        let base = match (&credentials.username, &credentials.password) {
            (Some(user), Some(pass)) => format!("https://{user}:{pass}@{}", first.0),
            _ => format!("https://{}", first.0),
        };
        for db in [META_DB, DATA_DB] {
            let _ = self.client.put(format!("{base}/{db}")).send().await;
        }
        *self.base_url.write().await = Some(base);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.base_url.try_read().map(|g| g.is_some()).unwrap_or(false)
    }

    async fn reconnect(&self) -> Result<(), DpsError> {
        Ok(())
    }

    async fn create_store(&self, name: &str, key_type: &str, value_type: &str) -> Result<StoreId, DpsError> {
        if self.get_document(META_DB, &keys::name_index_key(name)).await?.is_some() {
            return Err(DpsError::new(ErrorCode::StoreExists));
        }
        let guid_doc = self.get_document(META_DB, keys::GUID_KEY).await?;
        let id = guid_doc.as_ref().and_then(|d| d.get("value")).and_then(Value::as_u64).unwrap_or(0) + 1;
        self.put_document(META_DB, keys::GUID_KEY, json!({ "value": id })).await?;
        self.put_document(META_DB, &keys::name_index_key(name), json!({ "store_id": id })).await?;
        self.put_document(
            META_DB,
            &format!("dps_header:{id}"),
            json!({ "name": name, "key_type": key_type, "value_type": value_type }),
        )
        .await?;
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
        let doc = self.get_document(META_DB, &keys::name_index_key(name)).await?;
        Ok(doc
            .and_then(|d| d.get("store_id").and_then(Value::as_u64))
            .map(StoreId)
            .unwrap_or(StoreId::NONE))
    }

    async fn remove_store(&self, id: StoreId) -> Result<bool, DpsError> {
        let name = match self.get_store_name(id).await {
            Ok(name) => name,
            Err(_) => return Ok(false),
        };
        for key in self.keysets.snapshot(id) {
            let _ = self.delete_document(DATA_DB, &Self::data_doc_id(id, &key)).await;
        }
        self.keysets.drop_store(id);
        let _ = self.delete_document(META_DB, &keys::name_index_key(&name)).await;
        let _ = self.delete_document(META_DB, &format!("dps_header:{id}")).await;
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
        let doc_id = Self::data_doc_id(id, key);
        let is_new = self.get_document(DATA_DB, &doc_id).await?.is_none();
        self.put_document(DATA_DB, &doc_id, json!({ "value": b64_encode_key(value) })).await?;
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
        let doc = self.get_document(DATA_DB, &Self::data_doc_id(id, key)).await?;
        doc.and_then(|d| d.get("value").and_then(Value::as_str).map(str::to_string))
            .map(|encoded| b64_decode_key(&encoded))
            .transpose()
    }

    async fn get_safe(&self, id: StoreId, key: &[u8], value_type: &str) -> Result<Option<Vec<u8>>, DpsError> {
        let declared = self.get_value_type(id).await?;
        if declared != value_type {
            return Err(DpsError::new(ErrorCode::TypeMismatch));
        }
        self.get(id, key).await
    }

    async fn remove(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        let removed = self.delete_document(DATA_DB, &Self::data_doc_id(id, key)).await?;
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
            let _ = self.delete_document(DATA_DB, &Self::data_doc_id(id, &key)).await;
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
        let expiry = if ttl_seconds == 0 { None } else { Some(now_ms() + (ttl_seconds as i64) * 1000) };
        self.put_document(
            META_DB,
            &format!("{}:{}", keys::TTL_NAMESPACE_KEY, b64_encode_key(key)),
            json!({ "value": b64_encode_key(value), "expires_at_ms": expiry }),
        )
        .await?;
        Ok(true)
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DpsError> {
        let doc_id = format!("{}:{}", keys::TTL_NAMESPACE_KEY, b64_encode_key(key));
        let Some(doc) = self.get_document(META_DB, &doc_id).await? else {
            return Ok(None);
        };
        if let Some(deadline) = doc.get("expires_at_ms").and_then(Value::as_i64) {
            if now_ms() >= deadline {
                let _ = self.delete_document(META_DB, &doc_id).await;
                return Ok(None);
            }
        }
        doc.get("value")
            .and_then(Value::as_str)
            .map(|encoded| b64_decode_key(encoded))
            .transpose()
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        self.delete_document(META_DB, &format!("{}:{}", keys::TTL_NAMESPACE_KEY, b64_encode_key(key))).await
    }

    async fn has_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        Ok(self.get_ttl(key).await?.is_some())
    }

    async fn create_or_get_lock(&self, name: &str) -> Result<LockId, DpsError> {
        let doc_id = format!("dps_name_of_this_lock:{name}");
        if let Some(doc) = self.get_document(META_DB, &doc_id).await? {
            if let Some(id) = doc.get("lock_id").and_then(Value::as_u64) {
                return Ok(LockId(id));
            }
        }
        let guid_doc = self.get_document(META_DB, keys::GUID_KEY).await?;
        let id = guid_doc.as_ref().and_then(|d| d.get("value")).and_then(Value::as_u64).unwrap_or(0) + 1;
        self.put_document(META_DB, keys::GUID_KEY, json!({ "value": id })).await?;
        self.put_document(META_DB, &doc_id, json!({ "lock_id": id })).await?;
        Ok(LockId(id))
    }

    async fn try_acquire_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let doc_id = keys::distributed_lock_key(id.0);
        if self.get_document(META_DB, &doc_id).await?.is_some() {
            return Ok(false);
        }
        let deadline = now_ms() + lease_ms as i64;
        self.put_document(META_DB, &doc_id, json!({ "holder_pid": pid, "lease_deadline_ms": deadline })).await?;
        Ok(true)
    }

    async fn steal_expired_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let doc_id = keys::distributed_lock_key(id.0);
        let Some(doc) = self.get_document(META_DB, &doc_id).await? else {
            return self.try_acquire_lock(id, pid, lease_ms).await;
        };
        let expired = doc.get("lease_deadline_ms").and_then(Value::as_i64).is_some_and(|d| now_ms() >= d);
        if !expired {
            return Ok(false);
        }
        let deadline = now_ms() + lease_ms as i64;
        self.put_document(META_DB, &doc_id, json!({ "holder_pid": pid, "lease_deadline_ms": deadline })).await?;
        Ok(true)
    }

    async fn release_lock(&self, id: LockId) -> Result<(), DpsError> {
        let _ = self.delete_document(META_DB, &keys::distributed_lock_key(id.0)).await;
        Ok(())
    }

    async fn remove_lock(&self, id: LockId) -> Result<bool, DpsError> {
        self.delete_document(META_DB, &keys::distributed_lock_key(id.0)).await
    }

    async fn get_pid_for_lock(&self, name: &str) -> Result<Option<u32>, DpsError> {
        let id = self.create_or_get_lock(name).await?;
        let doc = self.get_document(META_DB, &keys::distributed_lock_key(id.0)).await?;
        Ok(doc.and_then(|d| d.get("holder_pid").and_then(Value::as_u64)).map(|p| p as u32))
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
            "cloudant does not support token-array native commands",
        ))
    }
}

impl CloudantBackend {
    async fn header_field(&self, id: StoreId, field: &str) -> Result<String, DpsError> {
        let doc = self
            .get_document(META_DB, &format!("dps_header:{id}"))
            .await?
            .ok_or_else(|| DpsError::new(ErrorCode::StoreNotFound))?;
        doc.get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| DpsError::new(ErrorCode::StoreNotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_doc_id_embeds_store_and_key() {
        let id = CloudantBackend::data_doc_id(StoreId(3), b"alpha");
        assert!(id.starts_with("3-"));
    }
}
