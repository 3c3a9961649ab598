use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use pacer::{
    cache::{CacheEntry, CacheStore, cache_key},
    clock::ManualClock,
    error::StoreError,
    store::{FileStore, KeyValueStore, MemoryStore},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: u32,
    name: String,
}

fn alice() -> User {
    User {
        id: 1,
        name: "alice".into(),
    }
}

#[test]
fn key_is_prefix_and_json_params() {
    assert_eq!(cache_key("user", &(1, "a")).as_deref(), Some(r#"user-[1,"a"]"#));
    assert_eq!(cache_key("list", &()).as_deref(), Some("list-null"));
    assert_eq!(
        cache_key("user", &alice()).as_deref(),
        Some(r#"user-{"id":1,"name":"alice"}"#)
    );
}

#[test]
fn entry_round_trips_within_ttl() {
    let clock = Arc::new(ManualClock::starting_at_millis(5_000));
    let store = Arc::new(MemoryStore::new());
    let cache = CacheStore::new(store.clone(), clock.clone());

    cache.set("user-1", &alice());
    let raw = store.get("user-1").unwrap();
    let entry: CacheEntry<User> = serde_json::from_str(&raw).unwrap();
    assert_eq!(
        entry,
        CacheEntry {
            data: alice(),
            timestamp: 5_000
        }
    );

    clock.advance(Duration::from_millis(999));
    assert_eq!(cache.get::<User>("user-1", Duration::from_secs(1)), Some(alice()));
}

#[test]
fn expired_entry_is_removed() {
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(MemoryStore::new());
    let cache = CacheStore::new(store.clone(), clock.clone());

    cache.set("k", &42);
    clock.advance(Duration::from_secs(1));

    assert_eq!(cache.get::<i32>("k", Duration::from_secs(1)), None);
    assert!(store.is_empty(), "Expired entry must be evicted");
}

#[test]
fn corrupt_entry_is_a_miss_and_removed() {
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(MemoryStore::new());
    store.set("garbage", "{not json".into()).unwrap();
    store
        .set("wrong-shape", r#"{"data":"text","timestamp":0}"#.into())
        .unwrap();
    let cache = CacheStore::new(store.clone(), clock);

    assert_eq!(cache.get::<i32>("garbage", Duration::from_secs(60)), None);
    assert_eq!(cache.get::<i32>("wrong-shape", Duration::from_secs(60)), None);
    assert!(store.is_empty());
}

#[test]
fn missing_key_is_a_miss() {
    let cache = CacheStore::new(Arc::new(MemoryStore::new()), Arc::new(ManualClock::new()));
    assert_eq!(cache.get::<String>("absent", Duration::from_secs(60)), None);
}

#[test]
fn write_failures_are_swallowed() {
    let store = Arc::new(MemoryStore::with_capacity(1));
    let cache = CacheStore::new(store.clone(), Arc::new(ManualClock::new()));

    cache.set("first", &1);
    cache.set("second", &2);
    cache.set("first", &3);

    assert_eq!(store.len(), 1);
    assert_eq!(cache.get::<i32>("first", Duration::from_secs(1)), Some(3));
    assert_eq!(cache.get::<i32>("second", Duration::from_secs(1)), None);
}

#[test]
fn bounded_store_rejects_new_keys() {
    let store = MemoryStore::with_capacity(1);
    store.set("a", "1".into()).unwrap();

    let err = store.set("b", "2".into()).unwrap_err();
    assert!(matches!(err, StoreError::CapacityExceeded { capacity: 1 }));
    assert_eq!(err.to_string(), "store capacity of 1 entries exceeded");
}

#[test]
fn file_store_persists_entries() {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("pacer-store-{}-{nanos}", std::process::id()));

    let store = FileStore::open(&dir).unwrap();
    assert_eq!(store.dir(), dir.as_path());
    let key = r#"user-{"id":1}"#;
    store.set(key, "payload".into()).unwrap();
    assert_eq!(store.get(key).as_deref(), Some("payload"));

    let reopened = FileStore::open(&dir).unwrap();
    assert_eq!(reopened.get(key).as_deref(), Some("payload"));
    reopened.remove(key);
    assert_eq!(store.get(key), None);
    // Removing twice is harmless.
    reopened.remove(key);

    let cache = CacheStore::new(Arc::new(reopened), Arc::new(ManualClock::new()));
    cache.set("users", &vec![alice()]);
    assert_eq!(
        cache.get::<Vec<User>>("users", Duration::from_secs(1)),
        Some(vec![alice()])
    );

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn file_store_accepts_long_keys() {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("pacer-long-{}-{nanos}", std::process::id()));
    let store = Arc::new(FileStore::open(&dir).unwrap());

    let query = "q".repeat(200);
    let key = cache_key("search", &(query.as_str(), 1)).unwrap();
    assert!(key.len() > 200);
    store.set(&key, "hit".into()).unwrap();
    assert_eq!(store.get(&key).as_deref(), Some("hit"));
    assert_eq!(store.get(&format!("{key}x")), None, "Distinct keys stay distinct");

    let cache = CacheStore::new(store.clone(), Arc::new(ManualClock::new()));
    cache.set(&key, &vec![1, 2, 3]);
    assert_eq!(
        cache.get::<Vec<i32>>(&key, Duration::from_secs(1)),
        Some(vec![1, 2, 3])
    );

    std::fs::remove_dir_all(&dir).unwrap();
}
