//! Configuration file parsing: a line-oriented `key=value` format naming
//! the backend and its server endpoints, parsed by hand rather than with a
//! layered figment-style config crate, since the shape here really is this
//! simple.

use std::fs;
use std::path::{Path, PathBuf};

use crate::db::{Credentials, ServerEndpoint};
use crate::error::{DpsError, ErrorCode};

/// Default path searched when [`Config::from_file`] is called with `None`.
pub const DEFAULT_CONFIG_PATH: &str = "etc/no-sql-kv-store-servers.cfg";

/// A parsed configuration file: which backend to talk to, its server
/// endpoints, and optional credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The backend name exactly as it appeared in the file (e.g. `"redis"`).
    pub backend: String,
    /// One or more `server=` lines, in file order.
    pub servers: Vec<ServerEndpoint>,
    /// Optional `user=`/`password=` pair.
    pub credentials: Credentials,
}

impl Config {
    /// Parses the config file at `path`, or [`DEFAULT_CONFIG_PATH`] if
    /// `path` is `None`. Missing file is [`ErrorCode::ConfigNotFound`];
    /// an unsupported `backend` value or missing `backend=` line is
    /// [`ErrorCode::InvalidConfig`].
    pub fn from_file(path: Option<&Path>) -> Result<Self, DpsError> {
        let resolved: PathBuf = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let contents = fs::read_to_string(&resolved).map_err(|e| {
            DpsError::with_context(
                ErrorCode::ConfigNotFound,
                format!("{}: {e}", resolved.display()),
            )
        })?;

        Self::parse(&contents)
    }

    /// Parses already-loaded config text. Exposed separately from
    /// [`from_file`](Self::from_file) so tests don't need a real file on
    /// disk.
    pub fn parse(contents: &str) -> Result<Self, DpsError> {
        let mut backend: Option<String> = None;
        let mut servers = Vec::new();
        let mut username = None;
        let mut password = None;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(DpsError::with_context(
                    ErrorCode::InvalidConfig,
                    format!("malformed line: {line}"),
                ));
            };
            match key.trim() {
                "backend" => backend = Some(value.trim().to_string()),
                "server" => servers.push(ServerEndpoint(value.trim().to_string())),
                "user" => username = Some(value.trim().to_string()),
                "password" => password = Some(value.trim().to_string()),
                other => {
                    return Err(DpsError::with_context(
                        ErrorCode::InvalidConfig,
                        format!("unknown config key: {other}"),
                    ))
                }
            }
        }

        let backend = backend.ok_or_else(|| {
            DpsError::with_context(ErrorCode::InvalidConfig, "missing backend= line")
        })?;

        if !KNOWN_BACKENDS.contains(&backend.as_str()) {
            return Err(DpsError::with_context(
                ErrorCode::InvalidConfig,
                format!("unsupported backend: {backend}"),
            ));
        }

        Ok(Config {
            backend,
            servers,
            credentials: Credentials {
                username,
                password,
            },
        })
    }
}

/// Backend names accepted in a `backend=` line.
const KNOWN_BACKENDS: &[&str] = &[
    "memory",
    "redis",
    "redis-cluster",
    "redis-cluster-plus-plus",
    "memcached",
    "cassandra",
    "cloudant",
    "hbase",
    "mongo",
    "couchbase",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_and_servers() {
        let cfg = Config::parse(
            "backend=redis\nserver=10.0.0.1:6379\nserver=10.0.0.2:6379\nuser=dpsuser\npassword=hunter2\n",
        )
        .unwrap();
        assert_eq!(cfg.backend, "redis");
        assert_eq!(
            cfg.servers,
            vec![
                ServerEndpoint("10.0.0.1:6379".to_string()),
                ServerEndpoint("10.0.0.2:6379".to_string()),
            ]
        );
        assert_eq!(cfg.credentials.username.as_deref(), Some("dpsuser"));
        assert_eq!(cfg.credentials.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn ignores_blank_lines_and_comments() {
        let cfg = Config::parse("# comment\nbackend=memory\n\nserver=localhost:1\n").unwrap();
        assert_eq!(cfg.backend, "memory");
        assert_eq!(cfg.servers.len(), 1);
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = Config::parse("backend=not-a-real-backend\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfig);
    }

    #[test]
    fn rejects_missing_backend_line() {
        let err = Config::parse("server=localhost:1\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfig);
    }

    #[test]
    fn rejects_malformed_line() {
        let err = Config::parse("backend redis\n").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidConfig);
    }

    #[test]
    fn missing_file_is_config_not_found() {
        let err = Config::from_file(Some(Path::new("/nonexistent/path/dps.cfg"))).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigNotFound);
    }
}
