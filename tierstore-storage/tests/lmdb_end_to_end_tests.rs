//! End-to-end tests over the LMDB-backed tiers
//!
//! Tests verify:
//! - Entity store operations behave the same over LMDB as in memory
//! - Expiring KV rows are swept from the LMDB index
//! - Sequences persist across handles

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tierstore_core::{RetryConfig, StoreConfig, SweepConfig};
use tierstore_storage::{
    CacheTier, EntityStore, GarbageCollector, KvRow, KvTable, LmdbCacheTier, LmdbDurableStore,
    ReadSource, Sequence,
};
use tierstore_test_utils::assertions::assert_not_found;
use tierstore_test_utils::fixtures::{Counter, Profile};
use tierstore_test_utils::ManualClock;

type Store = EntityStore<LmdbDurableStore, LmdbCacheTier>;

struct Harness {
    store: Store,
    clock: Arc<ManualClock>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().expect("TempDir creation should succeed");
    let clock = Arc::new(ManualClock::default());
    let durable = LmdbDurableStore::open(dir.path().join("rows"), 16)
        .expect("durable store opens")
        .with_retry(RetryConfig::immediate(50));
    let cache = LmdbCacheTier::open(dir.path().join("cache"), 16)
        .expect("cache tier opens")
        .with_clock(clock.clone());
    let store = EntityStore::new(Arc::new(durable), Arc::new(cache), StoreConfig::default())
        .with_clock(clock.clone());
    Harness {
        store,
        clock,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_entity_lifecycle() {
    let h = harness();
    let mut profile = Profile::new("p1", "Alan Mathison Turing", "Alan@Bletchley.uk");
    h.store.write(&mut profile).await.expect("write");

    let mut read = Profile::shell("p1");
    assert_eq!(h.store.read(&mut read).await.expect("read"), ReadSource::Durable);
    assert_eq!(read.email, "alan@bletchley.uk");
    assert_eq!(read.initials, "AMT");

    let mut cached = Profile::shell("p1");
    assert_eq!(h.store.read(&mut cached).await.expect("read"), ReadSource::Cache);
    assert_eq!(cached, read);

    let report = h
        .store
        .modify(&mut Profile::shell("p1"), |p| {
            p.display_name = "A. M. Turing".to_string();
            Ok(())
        })
        .await
        .expect("modify");
    assert_eq!(report.attempts, 1);

    let mut after = Profile::shell("p1");
    assert_eq!(h.store.read(&mut after).await.expect("read"), ReadSource::Durable);
    assert_eq!(after.revision, 2);
    assert_eq!(after.initials, "AMT");

    h.store.delete(&after).await.expect("delete");
    assert_not_found(&h.store.read(&mut Profile::shell("p1")).await);
    assert_eq!(h.store.cache().get("profiles:p1").await.expect("get"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_modify_over_lmdb() {
    let h = harness();
    h.store.write(&mut Counter::new("c1", 0)).await.expect("write");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = h.store.clone();
        handles.push(tokio::spawn(async move {
            store
                .modify(&mut Counter::shell("c1"), |c| {
                    c.value += 1;
                    Ok(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("modify");
    }

    let mut shell = Counter::shell("c1");
    h.store.read(&mut shell).await.expect("read");
    assert_eq!(shell.value, 8);
}

#[tokio::test]
async fn test_kv_expiry_and_sweep_over_lmdb() {
    let h = harness();
    let kv = KvTable::new(h.store.clone());

    for i in 0..25 {
        let mut row = KvRow::new(format!("s{i}"), b"v".to_vec()).with_ttl(Duration::from_secs(60));
        kv.put(&mut row).await.expect("put");
    }
    let mut keep = KvRow::new("keep", b"v".to_vec());
    kv.put(&mut keep).await.expect("put");
    kv.find("s0").await.expect("live");

    h.clock.advance(Duration::from_secs(120));
    assert_not_found(&kv.find("s0").await);

    let gc = GarbageCollector::new(
        Arc::clone(h.store.durable()),
        SweepConfig {
            batch_size: 10,
            leeway: Duration::from_secs(30),
            ..Default::default()
        },
    )
    .with_clock(h.clock.clone());
    let report = gc.sweep().await.expect("sweep");
    assert_eq!(report.deleted, 25);
    assert_eq!(report.batches, 3);

    assert_eq!(gc.sweep().await.expect("second sweep").deleted, 0);
    kv.find("keep").await.expect("kept");
}

#[tokio::test]
async fn test_compressed_json_values() {
    let h = harness();
    let kv = KvTable::new(h.store.clone());

    let payload: Vec<String> = (0..50).map(|i| format!("entry-{}", i % 5)).collect();
    let mut row = KvRow::new("blob", Vec::new());
    row.encode_value(&payload).expect("encode");
    row.compress().expect("compress");
    kv.put(&mut row).await.expect("put");

    let mut found = kv.find("blob").await.expect("find");
    found.decompress().expect("decompress");
    let decoded: Vec<String> = found.decode_value().expect("decode");
    assert_eq!(decoded, payload);
}

#[tokio::test]
async fn test_sequence_survives_reopen() {
    let dir = TempDir::new().expect("TempDir creation should succeed");
    let path = dir.path().join("rows");
    let seq = Sequence::ascending("invoices");
    {
        let durable = LmdbDurableStore::open(&path, 16).expect("open");
        for expected in 1..=3 {
            assert_eq!(seq.next_value(&durable).await.expect("next"), expected);
        }
    }
    let durable = LmdbDurableStore::open(&path, 16).expect("reopen");
    assert_eq!(seq.current(&durable).await.expect("current"), 3);
    assert_eq!(seq.next_value(&durable).await.expect("next"), 4);
}
