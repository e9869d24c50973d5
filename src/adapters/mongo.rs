//! MongoDB backend adapter, built on the official
//! `mongodb` driver.
//!
//! Like Cassandra, Mongo's query model gives every collection a native
//! scan (`find` with a filter), so no auxiliary key set is needed: store
//! contents are one document per key in a `store_data` collection,
//! `{ store_id, key, value }`, with a compound index on
//! `(store_id, key)`. Store/lock creation uses `findOneAndUpdate` with
//! `upsert: false` (insert-only) to get the same create-if-absent
//! semantics Cassandra gets from lightweight transactions.

use async_trait::async_trait;
use mongodb::bson::{doc, Binary, Bson};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use mongodb::{Client, Database};
use tokio::sync::RwLock;

use crate::adapters::common::now_ms;
use crate::db::{keys, Credentials, DbLayer, LockId, ServerEndpoint, StoreId};
use crate::error::{DpsError, ErrorCode};

fn binary(bytes: &[u8]) -> Bson {
    Bson::Binary(Binary {
        subtype: mongodb::bson::spec::BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    })
}

fn as_bytes(value: &Bson) -> Option<Vec<u8>> {
    match value {
        Bson::Binary(b) => Some(b.bytes.clone()),
        _ => None,
    }
}

/// MongoDB backend.
pub struct MongoBackend {
    db: RwLock<Option<Database>>,
}

impl MongoBackend {
    pub fn new() -> Self {
        Self { db: RwLock::new(None) }
    }

    async fn database(&self) -> Result<Database, DpsError> {
        self.db
            .read()
            .await
            .clone()
            .ok_or_else(|| DpsError::new(ErrorCode::ReconnectNeeded))
    }

    async fn next_guid(&self, db: &Database) -> Result<u64, DpsError> {
        let counters = db.collection::<mongodb::bson::Document>("guid_counters");
        let result = counters
            .find_one_and_update(
                doc! { "_id": keys::GUID_KEY },
                doc! { "$inc": { "value": 1i64 } },
            )
            .with_options(
                FindOneAndUpdateOptions::builder()
                    .upsert(true)
                    .return_document(ReturnDocument::After)
                    .build(),
            )
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let value = result.and_then(|doc| doc.get_i64("value").ok()).unwrap_or(1);
        Ok(value as u64)
    }
}

impl Default for MongoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbLayer for MongoBackend {
    async fn connect(&self, servers: &[ServerEndpoint], credentials: &Credentials) -> Result<(), DpsError> {
        let first = servers
            .first()
            .ok_or_else(|| DpsError::with_context(ErrorCode::ConnectionFailed, "no servers configured"))?;
        let uri = match (&credentials.username, &credentials.password) {
            (Some(user), Some(pass)) => format!("mongodb://{user}:{pass}@{}", first.0),
            _ => format!("mongodb://{}", first.0),
        };
        let client = Client::with_uri_str(&uri)
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::ConnectionFailed, e.to_string()))?;
        let db = client.database(keys::META_DATA_DB_NAME);
        *self.db.write().await = Some(db);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.db.try_read().map(|g| g.is_some()).unwrap_or(false)
    }

    async fn reconnect(&self) -> Result<(), DpsError> {
        Err(DpsError::with_context(
            ErrorCode::ReconnectNeeded,
            "mongodb pools reconnect transparently; call connect() again with the original server list",
        ))
    }

    async fn create_store(&self, name: &str, key_type: &str, value_type: &str) -> Result<StoreId, DpsError> {
        let db = self.database().await?;
        let headers = db.collection::<mongodb::bson::Document>("store_headers");
        let id = self.next_guid(&db).await?;
        let inserted = headers
            .find_one_and_update(
                doc! { "_id": name },
                doc! { "$setOnInsert": { "store_id": id as i64, "key_type": key_type, "value_type": value_type } },
            )
            .with_options(FindOneAndUpdateOptions::builder().upsert(true).build())
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        if inserted.is_some() {
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
        let db = self.database().await?;
        let headers = db.collection::<mongodb::bson::Document>("store_headers");
        let doc = headers
            .find_one(doc! { "_id": name })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(doc
            .and_then(|d| d.get_i64("store_id").ok())
            .map(|id| StoreId(id as u64))
            .unwrap_or(StoreId::NONE))
    }

    async fn remove_store(&self, id: StoreId) -> Result<bool, DpsError> {
        let name = match self.get_store_name(id).await {
            Ok(name) => name,
            Err(_) => return Ok(false),
        };
        let db = self.database().await?;
        db.collection::<mongodb::bson::Document>("store_headers")
            .delete_one(doc! { "_id": &name })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        db.collection::<mongodb::bson::Document>("store_data")
            .delete_many(doc! { "store_id": id.0 as i64 })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(true)
    }

    async fn get_store_name(&self, id: StoreId) -> Result<String, DpsError> {
        let db = self.database().await?;
        let headers = db.collection::<mongodb::bson::Document>("store_headers");
        let doc = headers
            .find_one(doc! { "store_id": id.0 as i64 })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
            .ok_or_else(|| DpsError::new(ErrorCode::StoreNotFound))?;
        doc.get_str("_id")
            .map(str::to_string)
            .map_err(|_| DpsError::new(ErrorCode::StoreNotFound))
    }

    async fn get_key_type(&self, id: StoreId) -> Result<String, DpsError> {
        self.header_field(id, "key_type").await
    }

    async fn get_value_type(&self, id: StoreId) -> Result<String, DpsError> {
        self.header_field(id, "value_type").await
    }

    async fn put(&self, id: StoreId, key: &[u8], value: &[u8]) -> Result<bool, DpsError> {
        let db = self.database().await?;
        let data = db.collection::<mongodb::bson::Document>("store_data");
        data.find_one_and_update(
            doc! { "store_id": id.0 as i64, "key": binary(key) },
            doc! { "$set": { "value": binary(value) } },
        )
        .with_options(FindOneAndUpdateOptions::builder().upsert(true).build())
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
        let db = self.database().await?;
        let data = db.collection::<mongodb::bson::Document>("store_data");
        let doc = data
            .find_one(doc! { "store_id": id.0 as i64, "key": binary(key) })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(doc.and_then(|d| d.get("value").and_then(as_bytes)))
    }

    async fn get_safe(&self, id: StoreId, key: &[u8], value_type: &str) -> Result<Option<Vec<u8>>, DpsError> {
        let declared = self.get_value_type(id).await?;
        if declared != value_type {
            return Err(DpsError::new(ErrorCode::TypeMismatch));
        }
        self.get(id, key).await
    }

    async fn remove(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        let db = self.database().await?;
        let data = db.collection::<mongodb::bson::Document>("store_data");
        let result = data
            .delete_one(doc! { "store_id": id.0 as i64, "key": binary(key) })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(result.deleted_count > 0)
    }

    async fn has(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError> {
        Ok(self.get(id, key).await?.is_some())
    }

    async fn clear(&self, id: StoreId) -> Result<(), DpsError> {
        let db = self.database().await?;
        db.collection::<mongodb::bson::Document>("store_data")
            .delete_many(doc! { "store_id": id.0 as i64 })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(())
    }

    async fn size(&self, id: StoreId) -> Result<u64, DpsError> {
        let db = self.database().await?;
        db.collection::<mongodb::bson::Document>("store_data")
            .count_documents(doc! { "store_id": id.0 as i64 })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))
    }

    async fn list_keys(&self, id: StoreId) -> Result<Vec<Vec<u8>>, DpsError> {
        use futures_util::TryStreamExt;
        let db = self.database().await?;
        let data = db.collection::<mongodb::bson::Document>("store_data");
        let mut cursor = data
            .find(doc! { "store_id": id.0 as i64 })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let mut keys_out = Vec::new();
        while let Some(doc) = cursor
            .try_next()
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
        {
            if let Some(bytes) = doc.get("key").and_then(as_bytes) {
                keys_out.push(bytes);
            }
        }
        Ok(keys_out)
    }

    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl_seconds: u64) -> Result<bool, DpsError> {
        let db = self.database().await?;
        let ttl = db.collection::<mongodb::bson::Document>("ttl_kv");
        let expiry = if ttl_seconds == 0 { None } else { Some(now_ms() + (ttl_seconds as i64) * 1000) };
        ttl.find_one_and_update(
            doc! { "_id": binary(key) },
            doc! { "$set": { "value": binary(value), "expires_at_ms": expiry } },
        )
        .with_options(FindOneAndUpdateOptions::builder().upsert(true).build())
        .await
        .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(true)
    }

    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DpsError> {
        let db = self.database().await?;
        let ttl = db.collection::<mongodb::bson::Document>("ttl_kv");
        let Some(doc) = ttl
            .find_one(doc! { "_id": binary(key) })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
        else {
            return Ok(None);
        };
        if let Ok(deadline) = doc.get_i64("expires_at_ms") {
            if now_ms() >= deadline {
                let _ = ttl.delete_one(doc! { "_id": binary(key) }).await;
                return Ok(None);
            }
        }
        Ok(doc.get("value").and_then(as_bytes))
    }

    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        let db = self.database().await?;
        let result = db
            .collection::<mongodb::bson::Document>("ttl_kv")
            .delete_one(doc! { "_id": binary(key) })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(result.deleted_count > 0)
    }

    async fn has_ttl(&self, key: &[u8]) -> Result<bool, DpsError> {
        Ok(self.get_ttl(key).await?.is_some())
    }

    async fn create_or_get_lock(&self, name: &str) -> Result<LockId, DpsError> {
        let db = self.database().await?;
        let id = self.next_guid(&db).await?;
        let locks = db.collection::<mongodb::bson::Document>("lock_name_index");
        let result = locks
            .find_one_and_update(
                doc! { "_id": name },
                doc! { "$setOnInsert": { "lock_id": id as i64 } },
            )
            .with_options(
                FindOneAndUpdateOptions::builder()
                    .upsert(true)
                    .return_document(ReturnDocument::After)
                    .build(),
            )
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        let lock_id = result.and_then(|d| d.get_i64("lock_id").ok()).unwrap_or(id as i64);
        Ok(LockId(lock_id as u64))
    }

    async fn try_acquire_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let db = self.database().await?;
        let locks = db.collection::<mongodb::bson::Document>("locks");
        let deadline = now_ms() + lease_ms as i64;
        let result = locks
            .find_one_and_update(
                doc! { "_id": id.0 as i64 },
                doc! { "$setOnInsert": { "holder_pid": pid as i32, "lease_deadline_ms": deadline } },
            )
            .with_options(
                FindOneAndUpdateOptions::builder()
                    .upsert(true)
                    .return_document(ReturnDocument::Before)
                    .build(),
            )
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(result.is_none())
    }

    async fn steal_expired_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError> {
        let db = self.database().await?;
        let locks = db.collection::<mongodb::bson::Document>("locks");
        let deadline = now_ms() + lease_ms as i64;
        let result = locks
            .find_one_and_update(
                doc! { "_id": id.0 as i64, "lease_deadline_ms": { "$lte": now_ms() } },
                doc! { "$set": { "holder_pid": pid as i32, "lease_deadline_ms": deadline } },
            )
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(result.is_some())
    }

    async fn release_lock(&self, id: LockId) -> Result<(), DpsError> {
        let db = self.database().await?;
        db.collection::<mongodb::bson::Document>("locks")
            .delete_one(doc! { "_id": id.0 as i64 })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(())
    }

    async fn remove_lock(&self, id: LockId) -> Result<bool, DpsError> {
        let db = self.database().await?;
        let result = db
            .collection::<mongodb::bson::Document>("locks")
            .delete_one(doc! { "_id": id.0 as i64 })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(result.deleted_count > 0)
    }

    async fn get_pid_for_lock(&self, name: &str) -> Result<Option<u32>, DpsError> {
        let id = self.create_or_get_lock(name).await?;
        let db = self.database().await?;
        let doc = db
            .collection::<mongodb::bson::Document>("locks")
            .find_one(doc! { "_id": id.0 as i64 })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?;
        Ok(doc.and_then(|d| d.get_i32("holder_pid").ok()).map(|p| p as u32))
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
            "mongodb does not support HTTP-style commands",
        ))
    }

    async fn run_command_tokens(&self, _tokens: &[String]) -> Result<Vec<u8>, DpsError> {
        Err(DpsError::with_context(
            ErrorCode::BackendDriver,
            "mongodb does not support token-array native commands",
        ))
    }
}

impl MongoBackend {
    async fn header_field(&self, id: StoreId, field: &str) -> Result<String, DpsError> {
        let db = self.database().await?;
        let headers = db.collection::<mongodb::bson::Document>("store_headers");
        let doc = headers
            .find_one(doc! { "store_id": id.0 as i64 })
            .await
            .map_err(|e| DpsError::with_context(ErrorCode::BackendDriver, e.to_string()))?
            .ok_or_else(|| DpsError::new(ErrorCode::StoreNotFound))?;
        doc.get_str(field)
            .map(str::to_string)
            .map_err(|_| DpsError::new(ErrorCode::StoreNotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_round_trips_through_bson() {
        let b = binary(b"\x00\xffhello");
        assert_eq!(as_bytes(&b), Some(b"\x00\xffhello".to_vec()));
    }
}
