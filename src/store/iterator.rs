//! The iteration cursor returned by [`super::StoreManager::begin_iteration`].
//!
//! An [`Iterator`] is a snapshot of a store's key set taken at
//! `beginIteration` time: once created it is
//! lock-free, so iteration never blocks a concurrent writer, and keys
//! removed after the snapshot was taken are simply skipped on `get_next`
//! rather than surfaced as an error.

use crate::db::StoreId;

/// A point-in-time cursor over one store's keys. Holds no connection state
/// of its own; every step re-reads the current value for the next
/// snapshotted key through the owning [`super::StoreManager`].
#[derive(Debug)]
pub struct Iterator {
    pub(super) store_id: StoreId,
    pub(super) keys: Vec<Vec<u8>>,
    pub(super) pos: usize,
}

impl Iterator {
    /// The store this iterator was created against.
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    /// Number of keys remaining in the snapshot, including the current one.
    pub fn remaining(&self) -> usize {
        self.keys.len().saturating_sub(self.pos)
    }
}
