//! The global TTL namespace: a typed, encode-optional K/V
//! layer over [`DbLayer::put_ttl`]/`get_ttl`/`remove_ttl`/`has_ttl`, keyed
//! solely by the encoded user key with no enclosing store. Unlike
//! [`crate::store::StoreManager`], which is purely byte-oriented,
//! `TtlNamespace` sits directly on [`crate::codec`] because the raw-mode
//! escape hatch (`encode_key=false`/`encode_value=false`) is meaningless
//! below the typed boundary.

use std::sync::Arc;

use crate::codec::{self, TypeTag, TypedValue};
use crate::db::DbLayer;
use crate::error::{DpsError, ErrorState};

/// Typed wrapper around a backend's global TTL namespace. Holds the `ttl`
/// channel of a shared [`ErrorState`] so a failing TTL call never clobbers
/// the store/lock channel a concurrent operation is reporting.
#[derive(Debug)]
pub struct TtlNamespace<D: DbLayer + ?Sized> {
    backend: Arc<D>,
    errors: Arc<ErrorState>,
}

impl<D: DbLayer + ?Sized> TtlNamespace<D> {
    /// Builds a TTL layer over `backend`, sharing `errors` with the rest of
    /// the facade.
    pub fn new(backend: Arc<D>, errors: Arc<ErrorState>) -> Self {
        Self { backend, errors }
    }

    fn encode_key(key: &TypedValue, tag: &TypeTag, raw: bool) -> Result<Vec<u8>, DpsError> {
        if raw {
            codec::encode_raw(key)
        } else {
            codec::encode(key, tag)
        }
    }

    fn encode_value(value: &TypedValue, tag: &TypeTag, raw: bool) -> Result<Vec<u8>, DpsError> {
        if raw {
            codec::encode_raw(value)
        } else {
            codec::encode(value, tag)
        }
    }

    fn decode_value(bytes: &[u8], tag: &TypeTag, raw: bool) -> Result<TypedValue, DpsError> {
        if raw {
            codec::decode_raw(bytes, tag.eq_ignore_ascii_case("ustring"))
        } else {
            codec::decode(bytes, tag)
        }
    }

    /// Stores `value` under `key` with `ttl_seconds` until expiry; `0`
    /// means no expiry. `encode_key`/`encode_value` default to `true`; set
    /// `false` only for `Rstring`/`Ustring` to store plain UTF-8 bytes a
    /// native backend tool can read directly.
    pub async fn put_ttl(
        &self,
        key: &TypedValue,
        key_tag: &TypeTag,
        value: &TypedValue,
        value_tag: &TypeTag,
        ttl_seconds: u64,
        encode_key: bool,
        encode_value: bool,
    ) -> Result<bool, DpsError> {
        self.errors.reset_ttl();
        match self
            .put_ttl_inner(
                key,
                key_tag,
                value,
                value_tag,
                ttl_seconds,
                encode_key,
                encode_value,
            )
            .await
        {
            Ok(v) => Ok(v),
            Err(e) => {
                self.errors.set_ttl(&e);
                Err(e)
            }
        }
    }

    async fn put_ttl_inner(
        &self,
        key: &TypedValue,
        key_tag: &TypeTag,
        value: &TypedValue,
        value_tag: &TypeTag,
        ttl_seconds: u64,
        encode_key: bool,
        encode_value: bool,
    ) -> Result<bool, DpsError> {
        let k = Self::encode_key(key, key_tag, !encode_key)?;
        let v = Self::encode_value(value, value_tag, !encode_value)?;
        self.backend.put_ttl(&k, &v, ttl_seconds).await
    }

    /// Reads a TTL-namespace value; `Ok(None)` if missing or expired.
    pub async fn get_ttl(
        &self,
        key: &TypedValue,
        key_tag: &TypeTag,
        value_tag: &TypeTag,
        encode_key: bool,
        encode_value: bool,
    ) -> Result<Option<TypedValue>, DpsError> {
        self.errors.reset_ttl();
        match self
            .get_ttl_inner(key, key_tag, value_tag, encode_key, encode_value)
            .await
        {
            Ok(v) => Ok(v),
            Err(e) => {
                self.errors.set_ttl(&e);
                Err(e)
            }
        }
    }

    async fn get_ttl_inner(
        &self,
        key: &TypedValue,
        key_tag: &TypeTag,
        value_tag: &TypeTag,
        encode_key: bool,
        encode_value: bool,
    ) -> Result<Option<TypedValue>, DpsError> {
        let k = Self::encode_key(key, key_tag, !encode_key)?;
        match self.backend.get_ttl(&k).await? {
            Some(bytes) => Ok(Some(Self::decode_value(&bytes, value_tag, !encode_value)?)),
            None => Ok(None),
        }
    }

    /// Removes a TTL-namespace entry. Returns whether it existed.
    pub async fn remove_ttl(
        &self,
        key: &TypedValue,
        key_tag: &TypeTag,
        encode_key: bool,
    ) -> Result<bool, DpsError> {
        self.errors.reset_ttl();
        match self.remove_ttl_inner(key, key_tag, encode_key).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.errors.set_ttl(&e);
                Err(e)
            }
        }
    }

    async fn remove_ttl_inner(
        &self,
        key: &TypedValue,
        key_tag: &TypeTag,
        encode_key: bool,
    ) -> Result<bool, DpsError> {
        let k = Self::encode_key(key, key_tag, !encode_key)?;
        self.backend.remove_ttl(&k).await
    }

    /// Whether a non-expired TTL-namespace entry exists for `key`.
    pub async fn has_ttl(
        &self,
        key: &TypedValue,
        key_tag: &TypeTag,
        encode_key: bool,
    ) -> Result<bool, DpsError> {
        self.errors.reset_ttl();
        match self.has_ttl_inner(key, key_tag, encode_key).await {
            Ok(v) => Ok(v),
            Err(e) => {
                self.errors.set_ttl(&e);
                Err(e)
            }
        }
    }

    async fn has_ttl_inner(
        &self,
        key: &TypedValue,
        key_tag: &TypeTag,
        encode_key: bool,
    ) -> Result<bool, DpsError> {
        let k = Self::encode_key(key, key_tag, !encode_key)?;
        self.backend.has_ttl(&k).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryBackend;

    fn namespace() -> TtlNamespace<MemoryBackend> {
        TtlNamespace::new(Arc::new(MemoryBackend::new()), Arc::new(ErrorState::new()))
    }

    #[tokio::test]
    async fn put_get_round_trip_encoded() {
        let ns = namespace();
        let key = TypedValue::Rstring("session-1".into());
        let value = TypedValue::Int64(42);

        assert!(ns
            .put_ttl(&key, "rstring", &value, "int64", 0, true, true)
            .await
            .unwrap());
        let fetched = ns
            .get_ttl(&key, "rstring", "int64", true, true)
            .await
            .unwrap();
        assert_eq!(fetched, Some(value));
    }

    #[tokio::test]
    async fn raw_mode_stores_plain_utf8() {
        let ns = namespace();
        let key = TypedValue::Rstring("plain-key".into());
        let value = TypedValue::Rstring("plain-value".into());

        ns.put_ttl(&key, "rstring", &value, "rstring", 0, false, false)
            .await
            .unwrap();
        let fetched = ns
            .get_ttl(&key, "rstring", "rstring", false, false)
            .await
            .unwrap();
        assert_eq!(fetched, Some(value));
    }

    #[tokio::test]
    async fn remove_and_has_ttl() {
        let ns = namespace();
        let key = TypedValue::Rstring("k".into());
        let value = TypedValue::Int64(1);

        ns.put_ttl(&key, "rstring", &value, "int64", 0, true, true)
            .await
            .unwrap();
        assert!(ns.has_ttl(&key, "rstring", true).await.unwrap());
        assert!(ns.remove_ttl(&key, "rstring", true).await.unwrap());
        assert!(!ns.remove_ttl(&key, "rstring", true).await.unwrap());
        assert!(!ns.has_ttl(&key, "rstring", true).await.unwrap());
    }

    #[tokio::test]
    async fn ttl_failure_is_recorded_on_the_ttl_channel_only() {
        let errors = Arc::new(ErrorState::new());
        let ns = TtlNamespace::new(Arc::new(MemoryBackend::new()), errors.clone());

        // Raw mode on a non-string type is rejected by the codec.
        let key = TypedValue::Int64(9);
        let value = TypedValue::Int64(1);
        let err = ns
            .put_ttl(&key, "int64", &value, "int64", 0, false, false)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::CodecMalformed);
        assert!(errors.last_ttl().is_some());
        assert!(errors.last_normal().is_none());
    }
}
