use gapfill::{Channel, ChannelStore, Entry, Granularity, StoreError, Timestamp, Value};
use tempfile::TempDir;

fn day(raw: &str) -> Timestamp {
    Timestamp::new(raw, Granularity::Day).expect("test timestamp should parse")
}

fn store_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("nested").join("channels.sqlite")
}

#[test]
fn create_refuses_existing_store() {
    let dir = TempDir::new().expect("tempdir should be created");
    let path = store_path(&dir);

    ChannelStore::create(&path, None, Granularity::Day).expect("first create should succeed");
    let err = ChannelStore::create(&path, None, Granularity::Day)
        .err()
        .expect("second create should fail");
    assert!(matches!(err, StoreError::AlreadyExists { .. }));
}

#[test]
fn reopen_keeps_entries_and_rejects_other_granularity() {
    let dir = TempDir::new().expect("tempdir should be created");
    let path = store_path(&dir);

    {
        let mut store =
            ChannelStore::create(&path, None, Granularity::Day).expect("create should succeed");
        store
            .ensure_channel(&Channel::numeric("Gold::USD", "Gold course"))
            .expect("registration should succeed");
        store
            .add(
                "Gold::USD",
                &[
                    Entry::new(day("2017-01-02"), 1151.0),
                    Entry::new(day("2017-01-03 17:45"), 1162.5),
                ],
            )
            .expect("add should succeed");
        store.commit().expect("commit should succeed");
    }

    let store = ChannelStore::open(&path, None, Granularity::Day).expect("reopen should succeed");
    let entries = store.get("Gold::USD").expect("channel should exist");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].timestamp, day("2017-01-03"));
    assert_eq!(entries[1].value, Value::Numeric(1162.5));
    drop(store);

    let err = ChannelStore::open(&path, None, Granularity::Hour)
        .err()
        .expect("granularity change should be rejected");
    assert!(matches!(
        err,
        StoreError::GranularityMismatch {
            requested: Granularity::Hour,
            ..
        }
    ));
}

#[test]
fn wrong_password_is_a_decryption_error_not_garbage() {
    let dir = TempDir::new().expect("tempdir should be created");
    let path = store_path(&dir);

    {
        let mut store = ChannelStore::create(&path, Some("correct horse"), Granularity::Day)
            .expect("create should succeed");
        store
            .ensure_channel(&Channel::text("Twitter::BTC", "Tweets", true))
            .expect("registration should succeed");
        store
            .add("Twitter::BTC", &[Entry::new(day("2017-08-12"), "to the moon")])
            .expect("add should succeed");
        store
            .add_credential("twitter.oauth", "token")
            .expect("credential should be stored");
    }

    let store = ChannelStore::open(&path, Some("battery staple"), Granularity::Day)
        .expect("open should succeed");
    assert!(matches!(
        store.get("Twitter::BTC"),
        Err(StoreError::Decryption { .. })
    ));
    assert!(matches!(
        store.get_credential("twitter.oauth"),
        Err(StoreError::Decryption { .. })
    ));
    assert_eq!(
        store
            .timestamps("Twitter::BTC")
            .expect("timestamps need no password")
            .len(),
        1
    );
    drop(store);

    let store = ChannelStore::open(&path, Some("correct horse"), Granularity::Day)
        .expect("open should succeed");
    assert_eq!(
        store.get("Twitter::BTC").expect("decryption should succeed")[0].value,
        Value::from("to the moon")
    );
    assert_eq!(
        store
            .get_credential("twitter.oauth")
            .expect("credential lookup should succeed")
            .as_deref(),
        Some("token")
    );
}

#[test]
fn repeated_adds_are_idempotent() {
    let mut store =
        ChannelStore::open_in_memory(None, Granularity::Day).expect("store should open");
    store
        .ensure_channel(&Channel::numeric("Index::DAX", "DAX"))
        .expect("registration should succeed");

    let entries = vec![
        Entry::new(day("2017-03-01"), 12_000.0),
        Entry::new(day("2017-03-02"), 12_050.0),
    ];
    store.add("Index::DAX", &entries).expect("add should succeed");
    let once = store.get("Index::DAX").expect("get should succeed");
    store.add("Index::DAX", &entries).expect("add should succeed");
    let twice = store.get("Index::DAX").expect("get should succeed");

    assert_eq!(once, twice);
    assert_eq!(once, entries);
}

#[test]
fn open_existing_uses_the_recorded_granularity() {
    let dir = TempDir::new().expect("tempdir should be created");
    let path = store_path(&dir);

    let missing = ChannelStore::open_existing(&path, None, None)
        .err()
        .expect("missing store should not be created");
    assert!(matches!(missing, StoreError::NotFound { .. }));
    assert!(!path.exists());

    ChannelStore::create(&path, Some("hunter22"), Granularity::Hour)
        .expect("create should succeed");

    let mut store = ChannelStore::open_existing(&path, Some("hunter22"), None)
        .expect("open without a granularity should succeed");
    assert_eq!(store.granularity(), Granularity::Hour);
    store
        .add_credential("api.key", "s3cret")
        .expect("credential should be stored");
    drop(store);

    let store = ChannelStore::open_existing(&path, Some("hunter22"), Some(Granularity::Hour))
        .expect("matching granularity should open");
    assert_eq!(store.granularity(), Granularity::Hour);
    drop(store);

    let err = ChannelStore::open_existing(&path, None, Some(Granularity::Day))
        .err()
        .expect("explicit other granularity should be rejected");
    assert!(matches!(
        err,
        StoreError::GranularityMismatch {
            requested: Granularity::Day,
            ..
        }
    ));
}
