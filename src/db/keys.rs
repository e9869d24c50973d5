//! Reserved, backend-visible tokens. Bit-exact; must never
//! collide with user data and must never be renumbered/renamed once a
//! deployment has data written with them.

/// Key holding the monotonically increasing store/lock id counter.
pub const GUID_KEY: &str = "dps_and_dl_guid";
/// Prefix for a store's structural mutex key: `dps_lock:<store_id>`.
pub const STORE_LOCK_PREFIX: &str = "dps_lock";
/// Prefix for a user-created distributed lock's key: `dl_lock:<lock_id>`.
pub const DISTRIBUTED_LOCK_PREFIX: &str = "dl_lock";
/// Prefix reserved for general-purpose locks outside the named-lock API.
pub const GENERIC_LOCK_PREFIX: &str = "generic_lock";
/// Key under which the global TTL namespace's entries live.
pub const TTL_NAMESPACE_KEY: &str = "dps_ttl_kv_global_store";
/// Logical database/keyspace name used by document/wide-column backends.
pub const META_DATA_DB_NAME: &str = "dps_dl_meta_data";
/// Key tracking the highest store id allocated (adapter-local bookkeeping).
pub const STORE_ID_TRACKER_KEY: &str = "dps_store_id_tracker";
/// Prefix for the store name → id index: `dps_name_of_this_store:<name>`.
pub const STORE_NAME_INDEX_PREFIX: &str = "dps_name_of_this_store";
/// Header field name for the stored key-type tag.
pub const KEY_TYPE_FIELD: &str = "dps_spl_type_name_of_key";
/// Header field name for the stored value-type tag.
pub const VALUE_TYPE_FIELD: &str = "dps_spl_type_name_of_value";

/// Store header type-token suffixes.
pub mod token {
    /// Name-of-store field.
    pub const NAME: &str = "0";
    /// Size/contents field.
    pub const SIZE: &str = "1";
    /// Declared key-type tag field.
    pub const KEY_TYPE: &str = "2";
    /// Declared value-type tag field.
    pub const VALUE_TYPE: &str = "3";
    /// Store-lock field.
    pub const STORE_LOCK: &str = "4";
    /// Lock field: holder pid.
    pub const LOCK_HOLDER: &str = "5";
    /// Lock field: lease deadline.
    pub const LOCK_LEASE: &str = "6";
    /// Lock field: usage count.
    pub const LOCK_USAGE: &str = "7";
    /// Redis-only ordered-keys auxiliary set.
    pub const ORDERED_KEYS: &str = "101";
    /// General-purpose lock field.
    pub const GENERIC: &str = "501";
}

/// Builds the store name → id index key: `dps_name_of_this_store:<name>`.
pub fn name_index_key(name: &str) -> String {
    format!("{STORE_NAME_INDEX_PREFIX}:{name}")
}

/// Builds a store's structural-mutex key: `dps_lock:<store_id>`.
pub fn store_lock_key(store_id: u64) -> String {
    format!("{STORE_LOCK_PREFIX}:{store_id}")
}

/// Builds a header field key for store `store_id`, field token `token`.
pub fn header_key(store_id: u64, token: &str) -> String {
    format!("dps_header:{store_id}:{token}")
}

/// Builds a user-created distributed lock's key: `dl_lock:<lock_id>`.
pub fn distributed_lock_key(lock_id: u64) -> String {
    format!("{DISTRIBUTED_LOCK_PREFIX}:{lock_id}")
}

/// Builds the name index key for a user-created lock.
pub fn lock_name_index_key(name: &str) -> String {
    format!("dps_name_of_this_lock:{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_index_key_embeds_name() {
        assert_eq!(name_index_key("T1"), "dps_name_of_this_store:T1");
    }

    #[test]
    fn store_lock_key_embeds_id() {
        assert_eq!(store_lock_key(42), "dps_lock:42");
    }

    #[test]
    fn header_key_embeds_id_and_token() {
        assert_eq!(header_key(7, token::NAME), "dps_header:7:0");
    }
}
