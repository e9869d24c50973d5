//! `dps`: a typed, named key/value abstraction over pluggable NoSQL
//! backends.
//!
//! The crate is layered bottom-up:
//!
//! - [`codec`] -- the self-describing binary encoding shared by every typed
//!   value.
//! - [`db`] -- the [`db::DbLayer`] contract each backend adapter
//!   implements, and [`adapters`] for the adapters themselves.
//! - [`store`], [`lock`], [`ttl`] -- the backend-agnostic layers built on
//!   top of any [`db::DbLayer`]: named stores, distributed locks, and the
//!   global TTL namespace.
//! - [`facade`] -- [`facade::Dps`], the single entry point an application
//!   actually calls.
//!
//! [`config`] parses the `backend=`/`server=` config file that chooses and
//! connects the backend, and [`error`] defines the closed error-code
//! taxonomy every layer reports through.

pub mod adapters;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod facade;
pub mod lock;
pub mod store;
pub mod ttl;

pub use config::Config;
pub use db::{DbLayer, LockId, StoreId};
pub use error::{DpsError, ErrorCode};
pub use facade::Dps;
