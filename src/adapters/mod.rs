//! Backend adapters: one [`crate::db::DbLayer`] implementation per
//! supported NoSQL store, plus the shared mechanics (`common`) they build
//! on and the in-memory reference implementation (`memory`) used by the
//! crate's own tests.
//!
//! Each network-backed adapter lives behind a Cargo feature of the same
//! name (`redis-backend`, `cassandra-backend`, ...), so a deployment only
//! pulls in the client library for the backend(s) it actually uses.

pub mod common;
pub mod memory;

#[cfg(feature = "redis-backend")]
pub mod redis;

#[cfg(feature = "redis-cluster-backend")]
pub mod redis_cluster;

#[cfg(feature = "memcached-backend")]
pub mod memcached;

#[cfg(feature = "cassandra-backend")]
pub mod cassandra;

#[cfg(feature = "mongo-backend")]
pub mod mongo;

#[cfg(feature = "cloudant-backend")]
pub mod cloudant;

#[cfg(feature = "hbase-backend")]
pub mod hbase;

#[cfg(feature = "couchbase-backend")]
pub mod couchbase;

use std::sync::Arc;

use crate::config::Config;
use crate::db::DbLayer;
use crate::error::{DpsError, ErrorCode};

/// The set of backends `dps` knows how to drive, matching the `backend=`
/// value in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Redis,
    RedisCluster,
    Memcached,
    Cassandra,
    Mongo,
    Cloudant,
    Hbase,
    Couchbase,
}

impl BackendKind {
    /// Parses the `backend=` config value. Unknown names are
    /// `InvalidConfig`, not a panic: a bad config file is an operational
    /// error, never a programmer error.
    pub fn parse(name: &str) -> Result<Self, DpsError> {
        match name {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "redis-cluster" | "rediscluster" | "redis-cluster-plus-plus" => {
                Ok(Self::RedisCluster)
            }
            "memcached" => Ok(Self::Memcached),
            "cassandra" => Ok(Self::Cassandra),
            "mongo" | "mongodb" => Ok(Self::Mongo),
            "cloudant" => Ok(Self::Cloudant),
            "hbase" => Ok(Self::Hbase),
            "couchbase" => Ok(Self::Couchbase),
            other => Err(DpsError::with_context(
                ErrorCode::InvalidConfig,
                format!("unsupported backend '{other}'"),
            )),
        }
    }
}

/// Builds a fresh, unconnected adapter for `kind`. Callers must still call
/// [`DbLayer::connect`] before use. Returns `BackendDriver` if the crate
/// was built without the feature the requested backend needs.
pub fn from_backend_kind(kind: BackendKind) -> Result<Arc<dyn DbLayer>, DpsError> {
    match kind {
        BackendKind::Memory => Ok(Arc::new(memory::MemoryBackend::new())),

        #[cfg(feature = "redis-backend")]
        BackendKind::Redis => Ok(Arc::new(redis::RedisBackend::new())),
        #[cfg(not(feature = "redis-backend"))]
        BackendKind::Redis => Err(feature_disabled("redis-backend")),

        #[cfg(feature = "redis-cluster-backend")]
        BackendKind::RedisCluster => Ok(Arc::new(redis_cluster::RedisClusterBackend::new())),
        #[cfg(not(feature = "redis-cluster-backend"))]
        BackendKind::RedisCluster => Err(feature_disabled("redis-cluster-backend")),

        #[cfg(feature = "memcached-backend")]
        BackendKind::Memcached => Ok(Arc::new(memcached::MemcachedBackend::new())),
        #[cfg(not(feature = "memcached-backend"))]
        BackendKind::Memcached => Err(feature_disabled("memcached-backend")),

        #[cfg(feature = "cassandra-backend")]
        BackendKind::Cassandra => Ok(Arc::new(cassandra::CassandraBackend::new())),
        #[cfg(not(feature = "cassandra-backend"))]
        BackendKind::Cassandra => Err(feature_disabled("cassandra-backend")),

        #[cfg(feature = "mongo-backend")]
        BackendKind::Mongo => Ok(Arc::new(mongo::MongoBackend::new())),
        #[cfg(not(feature = "mongo-backend"))]
        BackendKind::Mongo => Err(feature_disabled("mongo-backend")),

        #[cfg(feature = "cloudant-backend")]
        BackendKind::Cloudant => Ok(Arc::new(cloudant::CloudantBackend::new())),
        #[cfg(not(feature = "cloudant-backend"))]
        BackendKind::Cloudant => Err(feature_disabled("cloudant-backend")),

        #[cfg(feature = "hbase-backend")]
        BackendKind::Hbase => Ok(Arc::new(hbase::HbaseBackend::new())),
        #[cfg(not(feature = "hbase-backend"))]
        BackendKind::Hbase => Err(feature_disabled("hbase-backend")),

        #[cfg(feature = "couchbase-backend")]
        BackendKind::Couchbase => Ok(Arc::new(couchbase::CouchbaseBackend::new())),
        #[cfg(not(feature = "couchbase-backend"))]
        BackendKind::Couchbase => Err(feature_disabled("couchbase-backend")),
    }
}

/// Builds and connects the [`DbLayer`] named by `config`'s `backend=`
/// value, used by [`crate::facade::Dps::initialize`].
pub async fn from_config(config: &Config) -> Result<Arc<dyn DbLayer>, DpsError> {
    let kind = BackendKind::parse(&config.backend)?;
    let backend = from_backend_kind(kind)?;
    backend.connect(&config.servers, &config.credentials).await?;
    Ok(backend)
}

#[allow(dead_code)]
fn feature_disabled(feature: &str) -> DpsError {
    DpsError::with_context(
        ErrorCode::BackendDriver,
        format!("this build was compiled without the '{feature}' feature"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_known_backends() {
        assert_eq!(BackendKind::parse("redis").unwrap(), BackendKind::Redis);
        assert_eq!(BackendKind::parse("memory").unwrap(), BackendKind::Memory);
        assert_eq!(BackendKind::parse("mongodb").unwrap(), BackendKind::Mongo);
    }

    #[test]
    fn parse_rejects_unknown_backend() {
        let err = BackendKind::parse("made-up").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfig);
    }

    #[test]
    fn memory_backend_always_available() {
        assert!(from_backend_kind(BackendKind::Memory).is_ok());
    }

    #[tokio::test]
    async fn from_config_connects_memory_backend() {
        let config = Config::parse("backend=memory\n").unwrap();
        let backend = from_config(&config).await.unwrap();
        assert!(backend.is_connected());
    }
}
