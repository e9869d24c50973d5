//! The `BackendDriver` contract: the uniform interface every backend
//! adapter implements, covering store metadata, store data, the TTL
//! namespace, locks, and the three escape-hatch "run a native command"
//! shapes.

pub mod keys;

use async_trait::async_trait;
use std::fmt;

use crate::error::DpsError;

/// A store id. `0` is the sentinel for "does not exist"; never returned on
/// a successful create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(pub u64);

impl StoreId {
    /// The "not present" sentinel.
    pub const NONE: StoreId = StoreId(0);

    /// `true` if this is the `NONE` sentinel.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A lock id. Same sentinel convention as [`StoreId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(pub u64);

impl LockId {
    /// The "not present" sentinel.
    pub const NONE: LockId = LockId(0);

    /// `true` if this is the `NONE` sentinel.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One backend server endpoint (`host:port`, or a base URL for REST
/// backends).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint(pub String);

/// Credentials for a backend connection. Any field the backend doesn't
/// need is left `None`.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Username, if the backend requires one.
    pub username: Option<String>,
    /// Password or API token.
    pub password: Option<String>,
}

/// The uniform contract every backend adapter implements. Implementations
/// must be `Send + Sync`: either the underlying client is itself
/// thread-safe, or the adapter pools connections internally.
#[async_trait]
pub trait DbLayer: Send + Sync {
    // ---- Lifecycle ----

    /// Establishes the connection(s) to `servers` using `credentials`.
    async fn connect(
        &self,
        servers: &[ServerEndpoint],
        credentials: &Credentials,
    ) -> Result<(), DpsError>;

    /// Returns whether the adapter currently believes it is connected.
    fn is_connected(&self) -> bool;

    /// Re-establishes the connection using the last-known servers/credentials.
    async fn reconnect(&self) -> Result<(), DpsError>;

    /// Flushes any backend-specific durability operation. Most backends
    /// have nothing to do here; the default is a no-op.
    async fn persist(&self) -> Result<(), DpsError> {
        Ok(())
    }

    // ---- Store metadata ----

    /// Atomically allocates a fresh store id and writes its header.
    /// Fails with `StoreExists` if `name` is already registered.
    async fn create_store(
        &self,
        name: &str,
        key_type: &str,
        value_type: &str,
    ) -> Result<StoreId, DpsError>;

    /// As [`create_store`](Self::create_store), but returns the existing
    /// id if `name` is already registered with matching type tags.
    async fn create_or_get_store(
        &self,
        name: &str,
        key_type: &str,
        value_type: &str,
    ) -> Result<StoreId, DpsError>;

    /// Looks up a store id by name; returns `StoreId::NONE` if absent.
    async fn find_store(&self, name: &str) -> Result<StoreId, DpsError>;

    /// Removes a store's header, name index, data, and structural lock.
    /// Idempotent: returns `false` if the store did not exist.
    async fn remove_store(&self, id: StoreId) -> Result<bool, DpsError>;

    /// Returns the store's name.
    async fn get_store_name(&self, id: StoreId) -> Result<String, DpsError>;

    /// Returns the store's declared key type tag.
    async fn get_key_type(&self, id: StoreId) -> Result<String, DpsError>;

    /// Returns the store's declared value type tag.
    async fn get_value_type(&self, id: StoreId) -> Result<String, DpsError>;

    // ---- Store data ----

    /// Unconditional write; no existence check.
    async fn put(&self, id: StoreId, key: &[u8], value: &[u8]) -> Result<bool, DpsError>;

    /// As [`put`](Self::put), but rejects the write if the key is already
    /// present with a value of a different declared type.
    async fn put_safe(
        &self,
        id: StoreId,
        key: &[u8],
        value: &[u8],
        value_type: &str,
    ) -> Result<bool, DpsError>;

    /// Reads a value by key; `Ok(None)` if missing, no error.
    async fn get(&self, id: StoreId, key: &[u8]) -> Result<Option<Vec<u8>>, DpsError>;

    /// As [`get`](Self::get), additionally checking the stored value's type
    /// tag against `value_type`.
    async fn get_safe(
        &self,
        id: StoreId,
        key: &[u8],
        value_type: &str,
    ) -> Result<Option<Vec<u8>>, DpsError>;

    /// Removes a key. Returns whether it existed (idempotent).
    async fn remove(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError>;

    /// Returns whether `key` is present.
    async fn has(&self, id: StoreId, key: &[u8]) -> Result<bool, DpsError>;

    /// Removes every entry, preserving the store's header and lock.
    async fn clear(&self, id: StoreId) -> Result<(), DpsError>;

    /// Returns the current number of entries.
    async fn size(&self, id: StoreId) -> Result<u64, DpsError>;

    /// Lists the encoded keys currently present, in backend-defined order.
    /// The sole scan/emulation primitive every adapter must provide;
    /// iteration snapshots are built from this by `StoreManager`.
    async fn list_keys(&self, id: StoreId) -> Result<Vec<Vec<u8>>, DpsError>;

    // ---- TTL namespace ----

    /// Stores `value` under `key` in the global TTL namespace. `ttl_seconds
    /// == 0` means "no expiry".
    async fn put_ttl(&self, key: &[u8], value: &[u8], ttl_seconds: u64) -> Result<bool, DpsError>;

    /// Reads a TTL-namespace value; `Ok(None)` if missing or expired.
    async fn get_ttl(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DpsError>;

    /// Removes a TTL-namespace entry. Returns whether it existed.
    async fn remove_ttl(&self, key: &[u8]) -> Result<bool, DpsError>;

    /// Returns whether a (non-expired) TTL-namespace entry exists.
    async fn has_ttl(&self, key: &[u8]) -> Result<bool, DpsError>;

    // ---- Locks ----

    /// Atomically allocates a fresh lock id, or returns the existing one
    /// for `name`.
    async fn create_or_get_lock(&self, name: &str) -> Result<LockId, DpsError>;

    /// Attempts the atomic create-if-absent that grants the lock to `pid`
    /// for `lease_ms` milliseconds. Returns `false` (not an error) if
    /// already held by a live lease.
    async fn try_acquire_lock(&self, id: LockId, pid: u32, lease_ms: u64) -> Result<bool, DpsError>;

    /// Attempts to steal a lock whose lease has already expired, via
    /// compare-and-swap against the last-observed holder.
    async fn steal_expired_lock(
        &self,
        id: LockId,
        pid: u32,
        lease_ms: u64,
    ) -> Result<bool, DpsError>;

    /// Unconditionally deletes the lock key. A lease-expired former holder
    /// can inadvertently release a new holder's lock; this is documented,
    /// preserved behavior, not a bug.
    async fn release_lock(&self, id: LockId) -> Result<(), DpsError>;

    /// Deletes both the lock key and its name index. Returns whether the
    /// name existed.
    async fn remove_lock(&self, id: LockId) -> Result<bool, DpsError>;

    /// Returns the PID currently holding the named lock, if any.
    async fn get_pid_for_lock(&self, name: &str) -> Result<Option<u32>, DpsError>;

    // ---- Escape hatches ----

    /// Issues a fire-and-forget native command string (e.g. a Redis
    /// command line). No response is captured.
    async fn run_command_fire_and_forget(&self, cmd: &str) -> Result<(), DpsError>;

    /// Issues an HTTP-style request/response native command (REST
    /// backends). Returns the raw response body and status code.
    async fn run_command_http(
        &self,
        verb: &str,
        url: &str,
        path: &str,
        query: &str,
        body: &[u8],
    ) -> Result<(Vec<u8>, u32), DpsError>;

    /// Issues a Redis-style token-array native command.
    async fn run_command_tokens(&self, tokens: &[String]) -> Result<Vec<u8>, DpsError>;
}
