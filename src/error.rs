//! Closed error-code taxonomy and the dual (normal / TTL) error channels.
//!
//! Every public operation on [`crate::facade::Dps`] resets its channel to
//! `None` at entry and records the last `(code, message)` pair on failure,
//! mirroring the IBM Streams DPS toolkit's `getLastDpsErrorCode` /
//! `getLastDpsErrorCodeTTL` contract: two processes sharing a backend must
//! agree on the numeric codes, so [`ErrorCode::as_i32`] is stable and must
//! never be renumbered.

use parking_lot::Mutex;
use thiserror::Error;

/// Stable, closed set of error codes. Numeric values are part of the wire
/// contract and must not change once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    /// Connecting to the configured backend failed.
    #[error("connection to backend failed")]
    ConnectionFailed,
    /// Backend rejected the supplied credentials.
    #[error("authentication failed")]
    AuthenticationFailed,
    /// The connection was dropped and a reconnect is required before retrying.
    #[error("reconnect required")]
    ReconnectNeeded,

    /// No store exists with the given name or id.
    #[error("store not found")]
    StoreNotFound,
    /// `createStore` was called with a name that already exists.
    #[error("store already exists")]
    StoreExists,
    /// `createOrGetStore` found an existing store whose type tags differ.
    #[error("store exists with different key/value types")]
    StoreExistsWithDifferentTypes,
    /// A store id or lock id supplied by the caller is not well-formed.
    #[error("invalid id")]
    InvalidId,
    /// No lock exists with the given name or id.
    #[error("lock not found")]
    LockNotFound,
    /// Allocating a fresh store/lock id from the GUID counter failed.
    #[error("guid allocation failed")]
    GuidError,

    /// The per-store structural mutex could not be acquired.
    #[error("could not acquire store lock")]
    CouldNotGetStoreLock,
    /// `acquireLock` exceeded its `maxWait` budget.
    #[error("lock acquire timed out")]
    DlGetLockTimeout,

    /// `get`/`getSafe` found no value for the given key.
    #[error("key not found")]
    KeyNotFound,
    /// `putSafe`/`getSafe` detected a stored value whose type tag differs
    /// from the caller's declared type.
    #[error("type mismatch")]
    TypeMismatch,
    /// The codec could not decode a byte sequence: trailing bytes or an
    /// inconsistent length prefix.
    #[error("malformed encoded bytes")]
    CodecMalformed,

    /// The backend returned a non-2xx HTTP response.
    #[error("backend HTTP error: {0}")]
    HttpError(u32),
    /// A REST response body could not be parsed.
    #[error("REST response parse failure")]
    RestParseFailure,
    /// The backend's native client returned an error; `message` carries the
    /// backend-specific subcode/text verbatim. Higher layers never inspect
    /// this text, only propagate it.
    #[error("backend driver error")]
    BackendDriver,

    /// The backend or the process is out of memory.
    #[error("out of memory")]
    OutOfMemory,
    /// Allocating an iterator snapshot failed.
    #[error("iterator allocation failed")]
    IteratorAllocationFailed,

    /// This backend cannot support TTL semantics at all.
    #[error("TTL not supported on this backend")]
    TtlNotSupported,

    /// The configuration file was not found at the configured path.
    #[error("config file not found")]
    ConfigNotFound,
    /// The configuration file named an unsupported backend or was malformed.
    #[error("invalid configuration")]
    InvalidConfig,
}

impl ErrorCode {
    /// Maps to the stable numeric code shared across cooperating processes.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::ConnectionFailed => 100,
            Self::AuthenticationFailed => 101,
            Self::ReconnectNeeded => 102,
            Self::StoreNotFound => 200,
            Self::StoreExists => 201,
            Self::StoreExistsWithDifferentTypes => 202,
            Self::InvalidId => 203,
            Self::LockNotFound => 204,
            Self::GuidError => 205,
            Self::CouldNotGetStoreLock => 300,
            Self::DlGetLockTimeout => 301,
            Self::KeyNotFound => 400,
            Self::TypeMismatch => 401,
            Self::CodecMalformed => 402,
            Self::HttpError(_) => 500,
            Self::RestParseFailure => 501,
            Self::BackendDriver => 502,
            Self::OutOfMemory => 600,
            Self::IteratorAllocationFailed => 601,
            Self::TtlNotSupported => 700,
            Self::ConfigNotFound => 800,
            Self::InvalidConfig => 801,
        }
    }
}

/// An error surfaced by any DPS operation: a stable [`ErrorCode`] plus a
/// human-readable message. Backend-specific detail (native driver text,
/// HTTP body snippets) lives in the message only -- callers must switch on
/// `code`, never parse `message`.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct DpsError {
    /// The stable error code.
    pub code: ErrorCode,
    /// Human-readable detail, including any backend-specific subcode.
    pub message: String,
}

impl DpsError {
    /// Builds an error carrying `code`'s default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.to_string(),
        }
    }

    /// Builds an error carrying `code` with additional context appended.
    pub fn with_context(code: ErrorCode, context: impl Into<String>) -> Self {
        Self {
            code,
            message: format!("{code}: {}", context.into()),
        }
    }
}

/// One of the two parallel error channels: `Normal` backs
/// store and lock operations, `Ttl` backs the TTL namespace so a failing
/// TTL call never clobbers the state a concurrent store operation is
/// reporting.
#[derive(Debug, Default)]
pub struct ErrorState {
    normal: Mutex<Option<(ErrorCode, String)>>,
    ttl: Mutex<Option<(ErrorCode, String)>>,
}

impl ErrorState {
    /// Creates an empty error state (both channels clear).
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the normal channel. Call at the start of every store/lock op.
    pub fn reset_normal(&self) {
        *self.normal.lock() = None;
    }

    /// Resets the TTL channel. Call at the start of every TTL op.
    pub fn reset_ttl(&self) {
        *self.ttl.lock() = None;
    }

    /// Records a failure on the normal channel.
    pub fn set_normal(&self, err: &DpsError) {
        *self.normal.lock() = Some((err.code, err.message.clone()));
    }

    /// Records a failure on the TTL channel.
    pub fn set_ttl(&self, err: &DpsError) {
        *self.ttl.lock() = Some((err.code, err.message.clone()));
    }

    /// Returns the last `(code, message)` recorded on the normal channel.
    pub fn last_normal(&self) -> Option<(ErrorCode, String)> {
        self.normal.lock().clone()
    }

    /// Returns the last `(code, message)` recorded on the TTL channel.
    pub fn last_ttl(&self) -> Option<(ErrorCode, String)> {
        self.ttl.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_numeric_values_are_stable() {
        assert_eq!(ErrorCode::StoreNotFound.as_i32(), 200);
        assert_eq!(ErrorCode::DlGetLockTimeout.as_i32(), 301);
        assert_eq!(ErrorCode::TtlNotSupported.as_i32(), 700);
    }

    #[test]
    fn http_error_carries_status_but_same_family_code() {
        assert_eq!(ErrorCode::HttpError(503).as_i32(), 500);
        assert_eq!(ErrorCode::HttpError(404).as_i32(), 500);
    }

    #[test]
    fn dps_error_display_includes_message() {
        let err = DpsError::with_context(ErrorCode::KeyNotFound, "store 3, key 'alpha'");
        assert!(err.to_string().contains("key 'alpha'"));
    }

    #[test]
    fn error_state_resets_independently() {
        let state = ErrorState::new();
        state.set_normal(&DpsError::new(ErrorCode::StoreExists));
        state.set_ttl(&DpsError::new(ErrorCode::TtlNotSupported));
        assert!(state.last_normal().is_some());
        assert!(state.last_ttl().is_some());

        state.reset_normal();
        assert!(state.last_normal().is_none());
        assert!(state.last_ttl().is_some());
    }

    #[test]
    fn error_state_default_channels_are_empty() {
        let state = ErrorState::new();
        assert!(state.last_normal().is_none());
        assert!(state.last_ttl().is_none());
    }
}
