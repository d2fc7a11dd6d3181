use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use persisted_state::{
    AsyncPersistOptions, AsyncPersistedState, IndexedDbConfig, JsonSerializer, Origin,
    OriginConfig, PersistError, Readiness, StructuredValue, Tab,
};
use tokio::sync::{mpsc, watch};

async fn next_change<T: Clone>(rx: &mut watch::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(1), rx.changed())
        .await
        .expect("timed out waiting for change")
        .expect("sender dropped");
    let value = rx.borrow_and_update().clone();
    value
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

async fn stored(tab: &Tab, config: &IndexedDbConfig, key: &str) -> Option<StructuredValue> {
    let lease = tab.connections().acquire(config).await.unwrap();
    lease.get(&config.store_name, key).await.unwrap()
}

async fn store(tab: &Tab, config: &IndexedDbConfig, key: &str, value: StructuredValue) {
    let lease = tab.connections().acquire(config).await.unwrap();
    lease.put(&config.store_name, key, value).await.unwrap();
}

#[tokio::test]
async fn test_missing_value_hydrates_to_initial() {
    let origin = Origin::new("https://app.example");
    let tab = origin.open_tab();
    let hydrated = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hydrated);

    let state = AsyncPersistedState::new(
        &tab,
        "filters",
        vec![String::from("all")],
        AsyncPersistOptions::native().on_hydrated(move |v: &Vec<String>| {
            assert_eq!(v, &vec!["all".to_string()]);
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert!(state.is_loading());
    assert_eq!(state.ready().await.unwrap(), vec!["all".to_string()]);
    assert_eq!(hydrated.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stored_value_is_hydrated() {
    let origin = Origin::new("https://app.example");
    let tab = origin.open_tab();
    let config = IndexedDbConfig::default();
    store(&tab, &config, "count", StructuredValue::Number(12.0)).await;

    let state = AsyncPersistedState::new(&tab, "count", 0u32, AsyncPersistOptions::native());
    let mut rx = state.subscribe();
    assert_eq!(state.get(), 0);

    assert_eq!(state.ready().await.unwrap(), 12);
    assert_eq!(*rx.borrow_and_update(), 12);
    assert!(matches!(state.readiness(), Readiness::Ready(12)));
}

#[tokio::test]
async fn test_structured_values_round_trip() {
    let origin = Origin::new("https://app.example");
    let tab = origin.open_tab();

    let mut fields = BTreeMap::new();
    fields.insert(
        "at".to_string(),
        StructuredValue::Date(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()),
    );
    fields.insert(
        "pattern".to_string(),
        StructuredValue::RegExp {
            source: "^a+$".into(),
            flags: "i".into(),
        },
    );
    fields.insert(
        "tags".to_string(),
        StructuredValue::Set(vec![
            StructuredValue::String("x".into()),
            StructuredValue::String("y".into()),
        ]),
    );
    fields.insert(
        "lookup".to_string(),
        StructuredValue::Map(vec![(
            StructuredValue::Number(1.0),
            StructuredValue::String("one".into()),
        )]),
    );
    fields.insert(
        "blob".to_string(),
        StructuredValue::Bytes(Bytes::from_static(&[0, 159, 255])),
    );
    fields.insert("big".to_string(), StructuredValue::BigInt(1 << 90));
    let value = StructuredValue::Object(fields);

    let writer = AsyncPersistedState::new(&tab, "doc", StructuredValue::Null, AsyncPersistOptions::native());
    writer.ready().await.unwrap();
    writer.set(value.clone());
    writer.flush().await;

    let reader = AsyncPersistedState::new(&tab, "doc", StructuredValue::Null, AsyncPersistOptions::native());
    assert_eq!(reader.ready().await.unwrap(), value);
}

#[tokio::test]
async fn test_typed_values_round_trip() {
    let origin = Origin::new("https://app.example");
    let tab = origin.open_tab();
    let ids: BTreeSet<u32> = [3, 1, 2].into_iter().collect();

    let writer = AsyncPersistedState::new(&tab, "ids", BTreeSet::new(), AsyncPersistOptions::native());
    writer.ready().await.unwrap();
    writer.set(ids.clone());
    writer.flush().await;

    assert!(matches!(
        stored(&tab, &IndexedDbConfig::default(), "ids").await,
        Some(StructuredValue::Set(_))
    ));

    let reader = AsyncPersistedState::new(&tab, "ids", BTreeSet::new(), AsyncPersistOptions::native());
    assert_eq!(reader.ready().await.unwrap(), ids);
}

#[tokio::test]
async fn test_serializer_stores_text() {
    let origin = Origin::new("https://app.example");
    let tab = origin.open_tab();

    let state = AsyncPersistedState::new(
        &tab,
        "ids",
        Vec::<u32>::new(),
        AsyncPersistOptions::with_serializer(JsonSerializer),
    );
    state.ready().await.unwrap();
    state.set(vec![1, 2]);
    state.flush().await;

    assert_eq!(
        stored(&tab, &IndexedDbConfig::default(), "ids").await,
        Some(StructuredValue::String("[1,2]".into()))
    );
}

#[tokio::test]
async fn test_reset_twice_persists_initial() {
    let origin = Origin::new("https://app.example");
    let tab = origin.open_tab();
    let state = AsyncPersistedState::new(&tab, "n", 4u32, AsyncPersistOptions::native());
    state.ready().await.unwrap();

    state.set(9);
    state.reset();
    state.reset();
    state.flush().await;

    assert_eq!(state.get(), 4);
    assert_eq!(
        stored(&tab, &IndexedDbConfig::default(), "n").await,
        Some(StructuredValue::Number(4.0))
    );
}

#[tokio::test]
async fn test_changes_reach_other_containers() {
    init_tracing();
    let origin = Origin::new("https://app.example");
    let a = origin.open_tab();
    let b = origin.open_tab();

    let left = AsyncPersistedState::new(&a, "n", 0u32, AsyncPersistOptions::native());
    let right = AsyncPersistedState::new(&b, "n", 0u32, AsyncPersistOptions::native());
    left.ready().await.unwrap();
    right.ready().await.unwrap();
    let mut right_rx = right.subscribe();

    left.set(5);
    assert_eq!(next_change(&mut right_rx).await, 5);

    let mut left_rx = left.subscribe();
    right.update(|n| *n += 1);
    assert_eq!(next_change(&mut left_rx).await, 6);

    // Discard the right container's own update before waiting on the removal.
    right_rx.borrow_and_update();
    left.remove();
    assert_eq!(next_change(&mut right_rx).await, 0);
    left.flush().await;
    assert_eq!(stored(&a, &IndexedDbConfig::default(), "n").await, None);
}

#[tokio::test]
async fn test_applied_changes_are_not_rebroadcast() {
    let origin = Origin::new("https://app.example");
    let a = origin.open_tab();
    let b = origin.open_tab();
    let config = IndexedDbConfig::default();
    let mut observer = origin.broadcast_hub().open(&config.channel_name());

    let left = AsyncPersistedState::new(&a, "n", 0u32, AsyncPersistOptions::native());
    let right = AsyncPersistedState::new(&b, "n", 0u32, AsyncPersistOptions::native());
    left.ready().await.unwrap();
    right.ready().await.unwrap();
    let mut right_rx = right.subscribe();

    left.set(1);
    assert_eq!(next_change(&mut right_rx).await, 1);
    right.flush().await;

    let first = observer.recv().await.unwrap().unwrap();
    assert_eq!(first.value, Some(StructuredValue::Number(1.0)));
    let echo = tokio::time::timeout(Duration::from_millis(50), observer.recv()).await;
    assert!(echo.is_err(), "unexpected message: {echo:?}");
}

#[tokio::test]
async fn test_lagging_container_catches_up() {
    init_tracing();
    let origin = Origin::with_config(
        "https://app.example",
        OriginConfig {
            broadcast_capacity: 2,
            ..OriginConfig::default()
        },
    );
    let a = origin.open_tab();
    let b = origin.open_tab();
    let config = IndexedDbConfig::default();

    let left = AsyncPersistedState::new(&a, "n", 0u32, AsyncPersistOptions::native());
    let right = AsyncPersistedState::new(&b, "n", 0u32, AsyncPersistOptions::native());
    left.ready().await.unwrap();
    right.ready().await.unwrap();
    let mut right_rx = right.subscribe();

    // Store 5, then announce it followed by enough traffic to overflow.
    store(&a, &config, "n", StructuredValue::Number(5.0)).await;
    let poster = origin.broadcast_hub().open(&config.channel_name());
    poster.post("n", Some(StructuredValue::Number(5.0))).unwrap();
    for key in ["x", "y", "z"] {
        poster.post(key, Some(StructuredValue::Null)).unwrap();
    }

    assert_eq!(next_change(&mut right_rx).await, 5);
    settle().await;
    assert_eq!(left.get(), 5);
}

#[tokio::test]
async fn test_lag_keeps_queued_local_write() {
    let origin = Origin::with_config(
        "https://app.example",
        OriginConfig {
            broadcast_capacity: 2,
            ..OriginConfig::default()
        },
    );
    let a = origin.open_tab();
    let config = IndexedDbConfig::default();

    let state = AsyncPersistedState::new(&a, "n", 0u32, AsyncPersistOptions::native());
    state.ready().await.unwrap();

    store(&a, &config, "n", StructuredValue::Number(5.0)).await;
    let poster = origin.broadcast_hub().open(&config.channel_name());
    for key in ["w", "x", "y", "z"] {
        poster.post(key, Some(StructuredValue::Null)).unwrap();
    }
    state.set(9);

    state.flush().await;
    settle().await;
    assert_eq!(state.get(), 9);
    assert_eq!(stored(&a, &config, "n").await, Some(StructuredValue::Number(9.0)));
}

#[tokio::test]
async fn test_sync_disabled_ignores_other_containers() {
    let origin = Origin::new("https://app.example");
    let a = origin.open_tab();
    let b = origin.open_tab();

    let left = AsyncPersistedState::new(&a, "n", 0u32, AsyncPersistOptions::native());
    let right = AsyncPersistedState::new(&b, "n", 0u32, AsyncPersistOptions::native().sync_tabs(false));
    left.ready().await.unwrap();
    right.ready().await.unwrap();

    left.set(8);
    left.flush().await;
    settle().await;
    assert_eq!(right.get(), 0);
}

#[tokio::test]
async fn test_other_databases_are_isolated() {
    let origin = Origin::new("https://app.example");
    let a = origin.open_tab();
    let b = origin.open_tab();
    let other = IndexedDbConfig::new("settings", "kv", 1);

    let left = AsyncPersistedState::new(&a, "n", 0u32, AsyncPersistOptions::native());
    let right = AsyncPersistedState::new(&b, "n", 0u32, AsyncPersistOptions::native().indexed_db(other.clone()));
    left.ready().await.unwrap();
    right.ready().await.unwrap();

    left.set(3);
    left.flush().await;
    settle().await;
    assert_eq!(right.get(), 0);
    assert_eq!(stored(&b, &other, "n").await, None);
}

#[tokio::test]
async fn test_before_read_transforms_hydrated_value() {
    let origin = Origin::new("https://app.example");
    let tab = origin.open_tab();
    store(&tab, &IndexedDbConfig::default(), "count", StructuredValue::Number(5.0)).await;

    let state = AsyncPersistedState::new(
        &tab,
        "count",
        0i32,
        AsyncPersistOptions::native().before_read(|n: i32| n * 2),
    );
    assert_eq!(state.ready().await.unwrap(), 10);
}

#[tokio::test]
async fn test_before_write_transforms_stored_value() {
    let origin = Origin::new("https://app.example");
    let tab = origin.open_tab();
    let state = AsyncPersistedState::new(
        &tab,
        "count",
        0i32,
        AsyncPersistOptions::native().before_write(|n: i32| n * 2),
    );
    state.ready().await.unwrap();

    state.set(5);
    state.flush().await;
    assert_eq!(state.get(), 5);
    assert_eq!(
        stored(&tab, &IndexedDbConfig::default(), "count").await,
        Some(StructuredValue::Number(10.0))
    );
}

#[tokio::test]
async fn test_unreadable_stored_value_falls_back() {
    let origin = Origin::new("https://app.example");
    let tab = origin.open_tab();
    store(&tab, &IndexedDbConfig::default(), "n", StructuredValue::String("nope".into())).await;
    let errors = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&errors);

    let state = AsyncPersistedState::new(
        &tab,
        "n",
        7u32,
        AsyncPersistOptions::native().on_parse_error(move |e| {
            assert!(e.is_parse_error());
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert_eq!(state.ready().await.unwrap(), 7);
    assert!(!state.is_loading());
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_malformed_broadcast_leaves_value() {
    let origin = Origin::new("https://app.example");
    let a = origin.open_tab();
    let b = origin.open_tab();
    let (tx, mut errors) = mpsc::unbounded_channel();

    let numbers = AsyncPersistedState::new(
        &a,
        "shared",
        7u32,
        AsyncPersistOptions::native().on_parse_error(move |e| {
            let _ = tx.send(e.clone());
        }),
    );
    let text = AsyncPersistedState::new(&b, "shared", String::new(), AsyncPersistOptions::native());
    numbers.ready().await.unwrap();
    text.ready().await.unwrap();

    text.set("not a number".into());
    let error = tokio::time::timeout(Duration::from_secs(1), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(error.is_parse_error());
    assert_eq!(numbers.get(), 7);
}

#[tokio::test]
async fn test_write_failures_are_isolated() {
    let origin = Origin::new("https://app.example");
    let tab = origin.open_tab();
    let failures = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&failures);

    let state = AsyncPersistedState::new(
        &tab,
        "n",
        0u32,
        AsyncPersistOptions::native().on_write_error(move |e| {
            assert!(e.is_connection_error());
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );
    state.ready().await.unwrap();

    origin.databases().fail_writes(Some("disk full".into()));
    state.set(3);
    state.flush().await;
    assert_eq!(state.get(), 3);
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    origin.databases().fail_writes(None);
    state.set(4);
    state.flush().await;
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(
        stored(&tab, &IndexedDbConfig::default(), "n").await,
        Some(StructuredValue::Number(4.0))
    );
}

#[tokio::test]
async fn test_unavailable_database_fails_hydration() {
    init_tracing();
    let origin = Origin::new("https://app.example");
    origin.databases().set_available(false);
    let tab = origin.open_tab();
    let (tx, mut failures) = mpsc::unbounded_channel();

    let state = AsyncPersistedState::new(
        &tab,
        "n",
        1u32,
        AsyncPersistOptions::native().on_hydration_error(move |e| {
            let _ = tx.send(e.clone());
        }),
    );

    assert!(matches!(state.ready().await, Err(PersistError::Connection(_))));
    assert!(!state.is_loading());
    assert!(failures.recv().await.is_some());

    // Still usable in memory.
    state.set(2);
    state.flush().await;
    assert_eq!(state.get(), 2);
}

#[tokio::test]
async fn test_older_version_fails_hydration() {
    let origin = Origin::new("https://app.example");
    let tab = origin.open_tab();
    let current = IndexedDbConfig::new("app", "kv", 3);
    let stale = IndexedDbConfig::new("app", "kv", 2);

    let upgraded = AsyncPersistedState::new(&tab, "n", 0u32, AsyncPersistOptions::native().indexed_db(current));
    upgraded.ready().await.unwrap();

    let other = origin.open_tab();
    let state = AsyncPersistedState::new(&other, "n", 0u32, AsyncPersistOptions::native().indexed_db(stale));
    assert!(matches!(
        state.ready().await,
        Err(PersistError::VersionError { requested: 2, current: 3 })
    ));
}

#[tokio::test]
async fn test_containers_share_connection() {
    let origin = Origin::new("https://app.example");
    let tab = origin.open_tab();
    let config = IndexedDbConfig::default();

    let first = AsyncPersistedState::new(&tab, "a", 0u32, AsyncPersistOptions::native());
    let second = AsyncPersistedState::new(&tab, "b", 0u32, AsyncPersistOptions::native());
    first.ready().await.unwrap();
    second.ready().await.unwrap();

    assert_eq!(tab.connections().len(), 1);
    assert_eq!(tab.connections().ref_count(&config), 2);

    first.close().await;
    assert_eq!(tab.connections().ref_count(&config), 1);
    second.close().await;
    assert!(tab.connections().is_empty());
}

#[tokio::test]
async fn test_closed_tab_rejects_writes() {
    init_tracing();
    let origin = Origin::new("https://app.example");
    let tab = origin.open_tab();
    let (tx, mut failures) = mpsc::unbounded_channel();

    let state = AsyncPersistedState::new(
        &tab,
        "n",
        0u32,
        AsyncPersistOptions::native().on_write_error(move |e| {
            let _ = tx.send(e.clone());
        }),
    );
    state.ready().await.unwrap();

    tab.close();
    state.set(1);
    state.flush().await;

    let error = failures.recv().await.unwrap();
    assert!(matches!(error, PersistError::Closed(_)));
    assert_eq!(state.get(), 1);
}
