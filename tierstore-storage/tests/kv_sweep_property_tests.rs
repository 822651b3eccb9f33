//! Integration and property tests for the expiring KV table and its sweep
//!
//! Tests verify:
//! - Expired rows are invisible before they are swept
//! - A sweep deletes exactly the rows past their leeway, in any batch size
//! - Rows without an expiration are never swept

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tierstore_core::{Clock, StoreConfig, SweepConfig};
use tierstore_storage::{
    DurableStore, EntityStore, GarbageCollector, InMemoryCacheTier, InMemoryDurableStore, KvRow,
    KvTable, SweepOutcome,
};
use tierstore_test_utils::assertions::assert_not_found;
use tierstore_test_utils::generators::arb_kv_row;
use tierstore_test_utils::ManualClock;

type Table = KvTable<InMemoryDurableStore, InMemoryCacheTier>;

fn table(clock: &Arc<ManualClock>) -> (Table, Arc<InMemoryDurableStore>) {
    let durable = Arc::new(InMemoryDurableStore::new());
    let store = EntityStore::new(
        Arc::clone(&durable),
        Arc::new(InMemoryCacheTier::with_clock(clock.clone())),
        StoreConfig::default(),
    )
    .with_clock(clock.clone());
    (KvTable::new(store), durable)
}

fn collector(
    durable: Arc<InMemoryDurableStore>,
    clock: &Arc<ManualClock>,
    batch_size: usize,
    leeway: Duration,
) -> GarbageCollector<InMemoryDurableStore> {
    GarbageCollector::new(
        durable,
        SweepConfig {
            batch_size,
            leeway,
            ..Default::default()
        },
    )
    .with_clock(clock.clone())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_expired_row_is_hidden_then_swept() {
    let clock = Arc::new(ManualClock::default());
    let (kv, durable) = table(&clock);

    let mut session = KvRow::new("session:1", b"token".to_vec()).with_ttl(Duration::from_secs(60));
    kv.put(&mut session).await.expect("put");
    let mut forever = KvRow::new("config", b"{}".to_vec());
    kv.put(&mut forever).await.expect("put");

    // Served once so the cache holds it too.
    assert_eq!(kv.find("session:1").await.expect("live").value, b"token".to_vec());

    clock.advance(Duration::from_secs(61));
    assert_not_found(&kv.find("session:1").await);
    assert_eq!(durable.len(), 2);

    let gc = collector(Arc::clone(&durable), &clock, 10, Duration::ZERO);
    let report = gc.sweep().await.expect("sweep");
    assert_eq!(report.deleted, 1);
    assert_eq!(report.outcome, SweepOutcome::Exhausted);
    assert_eq!(durable.len(), 1);

    assert_not_found(&kv.find("session:1").await);
    kv.find("config").await.expect("never expires");
}

#[tokio::test]
async fn test_leeway_keeps_recently_expired_rows() {
    let clock = Arc::new(ManualClock::default());
    let (kv, durable) = table(&clock);
    let mut row = KvRow::new("k", b"v".to_vec()).with_ttl(Duration::from_secs(10));
    kv.put(&mut row).await.expect("put");

    clock.advance(Duration::from_secs(3600));
    let gc = collector(Arc::clone(&durable), &clock, 10, Duration::from_secs(24 * 3600));
    assert_eq!(gc.sweep().await.expect("sweep").deleted, 0);

    clock.advance(Duration::from_secs(24 * 3600));
    assert_eq!(gc.sweep().await.expect("sweep").deleted, 1);
    assert!(durable.is_empty());
}

#[tokio::test]
async fn test_rewriting_without_expiration_protects_row() {
    let clock = Arc::new(ManualClock::default());
    let (kv, durable) = table(&clock);
    let mut row = KvRow::new("k", b"v1".to_vec()).with_ttl(Duration::from_secs(1));
    kv.put(&mut row).await.expect("put");

    let mut replacement = KvRow::new("k", b"v2".to_vec());
    kv.put(&mut replacement).await.expect("overwrite");

    clock.advance(Duration::from_secs(10));
    let gc = collector(Arc::clone(&durable), &clock, 10, Duration::ZERO);
    assert_eq!(gc.sweep().await.expect("sweep").deleted, 0);
    assert_eq!(kv.find("k").await.expect("find").value, b"v2".to_vec());
}

#[tokio::test]
async fn test_cached_row_is_not_served_past_expiry() {
    let clock = Arc::new(ManualClock::default());
    let (kv, _durable) = table(&clock);
    let mut row = KvRow::new("k", b"v".to_vec()).with_ttl(Duration::from_secs(30));
    kv.put(&mut row).await.expect("put");
    kv.find("k").await.expect("populate");
    assert!(kv.store().cache().contains("kvs:k"));

    clock.advance(Duration::from_secs(30));
    assert!(!kv.store().cache().contains("kvs:k"));
    assert_not_found(&kv.find("k").await);
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// With `expired` rows past the leeway and `live` rows that are not, a
    /// sweep deletes exactly the expired ones whatever the batch size.
    #[test]
    fn prop_sweep_deletes_exactly_expired(
        expired in 0usize..40,
        live in 0usize..40,
        forever in 0usize..5,
        batch_size in 1usize..16,
    ) {
        let rt = runtime();
        let (deleted, remaining) = rt.block_on(async {
            let clock = Arc::new(ManualClock::default());
            let (kv, durable) = table(&clock);
            let now = clock.now();

            for i in 0..expired {
                let at = now - chrono::Duration::seconds(1 + i as i64);
                kv.put(&mut KvRow::new(format!("old{i}"), b"x".to_vec()).with_expires(at))
                    .await
                    .expect("put");
            }
            for i in 0..live {
                let at = now + chrono::Duration::seconds(1 + i as i64);
                kv.put(&mut KvRow::new(format!("live{i}"), b"x".to_vec()).with_expires(at))
                    .await
                    .expect("put");
            }
            for i in 0..forever {
                kv.put(&mut KvRow::new(format!("forever{i}"), b"x".to_vec()))
                    .await
                    .expect("put");
            }

            let gc = collector(Arc::clone(&durable), &clock, batch_size, Duration::ZERO);
            let report = gc.sweep().await.expect("sweep");
            (report.deleted, durable.len())
        });

        prop_assert_eq!(deleted, expired as u64);
        prop_assert_eq!(remaining, live + forever);
    }

    /// Whatever is stored, a live row stays findable and only rows already
    /// past their expiration are swept.
    #[test]
    fn prop_sweep_never_removes_live_rows(row in arb_kv_row()) {
        let rt = runtime();
        let (found, swept) = rt.block_on(async {
            let clock = Arc::new(ManualClock::default());
            let (kv, durable) = table(&clock);
            let mut stored = row.clone();
            kv.put(&mut stored).await.expect("put");

            let found = kv.find(&row.key).await.is_ok();
            let gc = collector(Arc::clone(&durable), &clock, 4, Duration::ZERO);
            let swept = gc.sweep().await.expect("sweep").deleted;
            (found, swept)
        });

        let now = ManualClock::default().now();
        prop_assert_eq!(found, !row.is_expired(now));
        // The sweep cutoff is exclusive, so a row expiring exactly now stays.
        let strictly_past = row.expires.is_some_and(|at| at < now);
        prop_assert_eq!(swept, u64::from(strictly_past));
    }
}

#[tokio::test]
async fn test_durable_rows_are_visible_through_trait_object() {
    let clock = Arc::new(ManualClock::default());
    let durable: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());
    let store = EntityStore::new(
        Arc::clone(&durable),
        Arc::new(InMemoryCacheTier::with_clock(clock.clone())),
        StoreConfig::default(),
    )
    .with_clock(clock.clone());
    let kv = KvTable::new(store);

    let mut row = KvRow::new("k", b"v".to_vec()).with_ttl(Duration::from_secs(1));
    kv.put(&mut row).await.expect("put");
    clock.advance(Duration::from_secs(5));

    let gc = GarbageCollector::new(
        Arc::clone(&durable),
        SweepConfig {
            leeway: Duration::ZERO,
            ..Default::default()
        },
    )
    .with_clock(clock);
    assert_eq!(gc.sweep().await.expect("sweep").deleted, 1);
}
