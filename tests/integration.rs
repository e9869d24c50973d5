//! End-to-end scenarios against the in-memory reference backend, exercising
//! the facade the way an application would: through [`dps::Dps`], not the
//! adapter directly.

use std::sync::Arc;
use std::time::Duration;

use dps::db::Credentials;
use dps::error::ErrorCode;
use dps::facade::Dps;
use dps::{adapters, codec, db, store};

/// Builds a fresh, unshared `Dps` instance so tests don't collide on the
/// process-wide singleton.
async fn dps() -> Dps {
    let backend = adapters::from_backend_kind(adapters::BackendKind::Memory).unwrap();
    backend.connect(&[], &Credentials::default()).await.unwrap();
    Dps::for_backend(backend)
}

#[tokio::test]
async fn store_round_trip_and_name_uniqueness() {
    let dps = dps().await;

    let id = dps.create_store("users", "rstring", "rstring").await.unwrap();
    assert!(!id.is_none());
    assert_eq!(dps.find_store("users").await.unwrap(), id);

    let err = dps
        .create_store("users", "rstring", "rstring")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::StoreExists);

    let same = dps
        .create_or_get_store("users", "rstring", "rstring")
        .await
        .unwrap();
    assert_eq!(same, id);

    let mismatch = dps
        .create_or_get_store("users", "rstring", "int64")
        .await
        .unwrap_err();
    assert_eq!(mismatch.code, ErrorCode::StoreExistsWithDifferentTypes);
}

#[tokio::test]
async fn put_get_remove_idempotence() {
    let dps = dps().await;
    let id = dps.create_store("kv", "rstring", "rstring").await.unwrap();

    assert!(dps.put(id, b"a", b"1").await.unwrap());
    assert_eq!(dps.get(id, b"a").await.unwrap(), Some(b"1".to_vec()));
    assert!(dps.has(id, b"a").await.unwrap());

    assert!(dps.remove(id, b"a").await.unwrap());
    assert!(!dps.remove(id, b"a").await.unwrap());
    assert_eq!(dps.get(id, b"a").await.unwrap(), None);
}

#[tokio::test]
async fn put_safe_rejects_type_drift() {
    let dps = dps().await;
    let id = dps.create_store("kv", "rstring", "rstring").await.unwrap();

    let key = codec::encode(&codec::TypedValue::Rstring("k".into()), "rstring").unwrap();
    let v1 = codec::encode(&codec::TypedValue::Rstring("one".into()), "rstring").unwrap();
    assert!(dps.put_safe(id, &key, &v1, "rstring").await.unwrap());

    let v2 = codec::encode(&codec::TypedValue::Int64(2), "int64").unwrap();
    let err = dps.put_safe(id, &key, &v2, "int64").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TypeMismatch);
}

#[tokio::test]
async fn iteration_visits_every_surviving_entry() {
    let dps = dps().await;
    let id = dps.create_store("kv", "rstring", "rstring").await.unwrap();
    for (k, v) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3")] {
        dps.put(id, k, v).await.unwrap();
    }

    let mut iter = dps.begin_iteration(id).await.unwrap();
    dps.remove(id, b"b").await.unwrap();

    let mut seen = Vec::new();
    while let Some(pair) = dps.get_next(&mut iter).await.unwrap() {
        seen.push(pair);
    }
    dps.end_iteration(iter);

    assert_eq!(seen.len(), 2);
    assert!(seen.iter().any(|(k, _)| k == b"a"));
    assert!(seen.iter().any(|(k, _)| k == b"c"));
}

#[tokio::test]
async fn serialize_deserialize_round_trip_across_stores() {
    let dps = dps().await;
    let source = dps.create_store("src", "int64", "rstring").await.unwrap();
    let dest = dps.create_store("dst", "int64", "rstring").await.unwrap();

    let k = codec::encode(&codec::TypedValue::Int64(7), "int64").unwrap();
    let v = codec::encode(&codec::TypedValue::Rstring("seven".into()), "rstring").unwrap();
    dps.put(source, &k, &v).await.unwrap();

    let blob = dps.serialize(source).await.unwrap();
    let pairs = dps.deserialize(dest, &blob).await.unwrap();
    assert_eq!(pairs, 1);
    assert_eq!(dps.get(dest, &k).await.unwrap(), Some(v));
}

#[tokio::test]
async fn ttl_namespace_put_get_remove() {
    let dps = dps().await;
    let key = codec::TypedValue::Rstring("session".into());
    let value = codec::TypedValue::Int64(99);

    assert!(dps
        .ttl()
        .put_ttl(&key, "rstring", &value, "int64", 0, true, true)
        .await
        .unwrap());
    assert!(dps.ttl().has_ttl(&key, "rstring", true).await.unwrap());
    assert_eq!(
        dps.ttl()
            .get_ttl(&key, "rstring", "int64", true, true)
            .await
            .unwrap(),
        Some(value)
    );
    assert!(dps.ttl().remove_ttl(&key, "rstring", true).await.unwrap());
    assert!(!dps.ttl().has_ttl(&key, "rstring", true).await.unwrap());
}

#[tokio::test]
async fn lock_excludes_a_second_concurrent_holder() {
    let dps = dps().await;
    let id = dps.create_or_get_lock("job").await.unwrap();

    assert!(dps
        .acquire_lock(id, Duration::from_secs(5), Duration::from_millis(50))
        .await
        .unwrap());

    let err = dps
        .acquire_lock(id, Duration::from_secs(5), Duration::from_millis(20))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DlGetLockTimeout);

    dps.release_lock(id).await.unwrap();
    assert!(dps
        .acquire_lock(id, Duration::from_secs(5), Duration::from_millis(50))
        .await
        .unwrap());
}

#[tokio::test]
async fn lock_is_stolen_once_the_lease_expires() {
    let dps = dps().await;
    let id = dps.create_or_get_lock("job").await.unwrap();

    assert!(dps
        .acquire_lock(id, Duration::from_millis(5), Duration::from_millis(50))
        .await
        .unwrap());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(dps
        .acquire_lock(id, Duration::from_secs(5), Duration::from_millis(200))
        .await
        .unwrap());
}

#[tokio::test]
async fn last_error_tracks_the_normal_channel_independently_of_ttl() {
    let dps = dps().await;
    dps.create_store("dup", "rstring", "rstring").await.unwrap();
    dps.create_store("dup", "rstring", "rstring")
        .await
        .unwrap_err();
    assert!(dps.last_error().is_some());
    assert!(dps.last_error_ttl().is_none());

    dps.find_store("dup").await.unwrap();
    assert!(dps.last_error().is_none());
}

#[tokio::test]
async fn two_handles_over_the_same_backend_see_each_others_writes() {
    // Simulates two cooperating processes sharing one backend by building
    // two independent `Dps` facades over the same `Arc<dyn DbLayer>`.
    let backend: Arc<dyn db::DbLayer> =
        adapters::from_backend_kind(adapters::BackendKind::Memory).unwrap();
    backend.connect(&[], &Credentials::default()).await.unwrap();

    let writer = Dps::for_backend(backend.clone());
    let reader = Dps::for_backend(backend);

    let id = writer.create_store("shared", "rstring", "rstring").await.unwrap();
    writer.put(id, b"k", b"v").await.unwrap();

    let seen_id = reader.find_store("shared").await.unwrap();
    assert_eq!(seen_id, id);
    assert_eq!(reader.get(id, b"k").await.unwrap(), Some(b"v".to_vec()));
}

#[tokio::test]
async fn store_manager_is_usable_directly_over_any_backend() {
    let backend = adapters::from_backend_kind(adapters::BackendKind::Memory).unwrap();
    backend.connect(&[], &Credentials::default()).await.unwrap();
    let mgr = store::StoreManager::new(backend);

    let id = mgr.create_store("direct", "rstring", "rstring").await.unwrap();
    assert!(mgr.put(id, b"x", b"y").await.unwrap());
    assert_eq!(mgr.get(id, b"x").await.unwrap(), Some(b"y".to_vec()));
}
