use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pmr_adapters::{
    AdapterError, FixtureSourceAdapter, NotificationEvent, Notifier, ReferencePriceSource,
    SourceAdapter, StoreReferencePrices,
};
use pmr_core::{
    Confidence, ListingRecord, ListingType, PropertyEntity, ReferencePrices, ReferenceQuery,
    SourceKey,
};
use pmr_storage::{MemoryStore, PropertyStore};
use pmr_sync::fingerprint::fingerprint_for;
use pmr_sync::{
    CrawlConfig, CrawlDriver, Ingestor, MarketGapConfig, MarketGapDetector, MatchEngine,
    MatcherConfig, RunStatus,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap()
}

fn record(source: &str, external_id: &str) -> ListingRecord {
    ListingRecord {
        source: source.into(),
        external_id: external_id.into(),
        title: "2 izbový byt, Petržalka".into(),
        price: 120_000.0,
        area_m2: 65.0,
        city: "Bratislava".into(),
        district: "Petržalka".into(),
        street: None,
        rooms: Some(2),
        floor: None,
        condition: "original".into(),
        listing_type: ListingType::Sale,
        source_url: format!("https://{source}.example/{external_id}"),
        description: None,
    }
}

fn setup() -> (Arc<MemoryStore>, Ingestor, MatchEngine) {
    let store = Arc::new(MemoryStore::new());
    let matcher = MatchEngine::new(store.clone(), MatcherConfig::default());
    let ingestor = Ingestor::new(store.clone(), matcher.clone());
    (store, ingestor, matcher)
}

#[tokio::test]
async fn ingesting_the_same_listing_twice_keeps_one_property() {
    let (store, ingestor, _) = setup();
    let rec = record("reality", "r-1");

    let first = ingestor.ingest(&rec, t0()).await.unwrap();
    let second = ingestor.ingest(&rec, t0() + Duration::hours(2)).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.property_id, second.property_id);
    assert_eq!(store.list_active_properties().await.unwrap().len(), 1);
    assert_eq!(store.price_history(first.property_id).await.unwrap().len(), 1);
    let stored = store.get_property(first.property_id).await.unwrap().unwrap();
    assert_eq!(stored.last_seen_at, t0() + Duration::hours(2));
}

#[tokio::test]
async fn cross_source_flat_matches_with_medium_confidence() {
    let (store, ingestor, _) = setup();
    let a = record("reality", "a-1");
    let b = ListingRecord {
        title: "Predaj bytu v Petržalke".into(),
        price: 119_500.0,
        area_m2: 64.0,
        ..record("nehnutelnosti", "b-1")
    };

    let a_out = ingestor.ingest(&a, t0()).await.unwrap();
    let b_out = ingestor.ingest(&b, t0()).await.unwrap();
    assert_eq!(b_out.edges_written, 1);

    let edge = store
        .get_match_edge(b_out.property_id, a_out.property_id)
        .await
        .unwrap()
        .expect("edge");
    assert_eq!(edge.score, 80);
    assert_eq!(edge.confidence, Confidence::Medium);
    assert!(edge.primary_id < edge.matched_id);
    assert!(edge.reasons.iter().any(|r| r == "area within 2%"));
    assert!(edge.reasons.iter().any(|r| r == "price within 2%"));
}

#[tokio::test]
async fn same_source_duplicates_are_never_linked() {
    let (store, ingestor, _) = setup();
    ingestor.ingest(&record("reality", "x-1"), t0()).await.unwrap();
    ingestor.ingest(&record("reality", "x-2"), t0()).await.unwrap();
    assert!(store.list_match_edges().await.unwrap().is_empty());
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    // Seed without matching so reconciliation has work to do.
    let corpus = [
        record("reality", "a-1"),
        ListingRecord {
            price: 119_000.0,
            ..record("nehnutelnosti", "b-1")
        },
        ListingRecord {
            price: 121_000.0,
            area_m2: 66.0,
            ..record("topreality", "c-1")
        },
        ListingRecord {
            district: "Ružinov".into(),
            ..record("topreality", "d-1")
        },
    ];
    for rec in &corpus {
        store
            .upsert_property(&PropertyEntity::from_listing(rec, 0, t0()))
            .await
            .unwrap();
    }
    let matcher = MatchEngine::new(store.clone(), MatcherConfig::default());

    let first = matcher.reconcile(t0()).await.unwrap();
    assert_eq!(first.fingerprinted, 4);
    assert_eq!(first.edges_written, 3);
    let edges = store.list_match_edges().await.unwrap();
    assert!(edges.iter().all(|e| e.primary_id < e.matched_id));

    let second = matcher.reconcile(t0() + Duration::hours(1)).await.unwrap();
    assert_eq!(second.fingerprinted, 0);
    assert_eq!(second.edges_written, 0);
    assert_eq!(store.list_match_edges().await.unwrap(), edges);
}

#[derive(Default)]
struct RecordingNotifier {
    fail: bool,
    events: Mutex<Vec<NotificationEvent>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), AdapterError> {
        if self.fail {
            return Err(AdapterError::Message("webhook returned 503".into()));
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

async fn seed_street(store: &MemoryStore) -> PropertyEntity {
    for i in 0..6 {
        let rec = ListingRecord {
            street: Some("Budatínska".into()),
            price: 100_000.0,
            area_m2: 50.0,
            ..record("reality", &format!("s-{i}"))
        };
        store
            .upsert_property(&PropertyEntity::from_listing(&rec, 0, t0()))
            .await
            .unwrap();
    }
    let subject = PropertyEntity::from_listing(
        &ListingRecord {
            street: Some("budatínska ".into()),
            price: 112_000.0,
            area_m2: 70.0,
            ..record("nehnutelnosti", "cheap")
        },
        0,
        t0(),
    );
    store.upsert_property(&subject).await.unwrap();
    subject
}

fn detector(store: Arc<MemoryStore>, notifier: Arc<RecordingNotifier>) -> MarketGapDetector {
    MarketGapDetector::new(
        store.clone(),
        Arc::new(StoreReferencePrices::new(store)),
        notifier,
        MarketGapConfig::default(),
    )
}

#[tokio::test]
async fn underpriced_listing_is_flagged_and_notified_once() {
    let store = Arc::new(MemoryStore::new());
    let subject = seed_street(&store).await;
    let notifier = Arc::new(RecordingNotifier::default());
    let detector = detector(store.clone(), notifier.clone());

    let summary = detector.run_pass(t0()).await.unwrap();
    assert_eq!(summary.flagged, 1);
    let flag = store.get_market_gap_flag(subject.id).await.unwrap().expect("flag");
    assert_eq!(flag.gap_percentage, 20.0);
    assert_eq!(flag.potential_profit, 28_000.0);
    assert_eq!(flag.comparable_count, 6);
    assert_eq!(flag.confidence, Confidence::Medium);

    let sent = detector.notify_pending().await.unwrap();
    assert_eq!(sent.market_gaps_sent, 1);
    assert!(store.get_market_gap_flag(subject.id).await.unwrap().unwrap().notified);

    // Recomputing keeps the notified bit, so nothing is sent again.
    detector.run_pass(t0() + Duration::hours(1)).await.unwrap();
    let again = detector.notify_pending().await.unwrap();
    assert_eq!(again.market_gaps_sent, 0);
    assert_eq!(notifier.events.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_hand_off_leaves_flag_pending() {
    let store = Arc::new(MemoryStore::new());
    let subject = seed_street(&store).await;
    let notifier = Arc::new(RecordingNotifier {
        fail: true,
        ..Default::default()
    });
    let detector = detector(store.clone(), notifier);

    detector.run_pass(t0()).await.unwrap();
    let sent = detector.notify_pending().await.unwrap();
    assert_eq!(sent.failures, 1);
    assert!(!store.get_market_gap_flag(subject.id).await.unwrap().unwrap().notified);
}

async fn reprice(store: &MemoryStore, subject: &mut PropertyEntity, price: f64) {
    subject.price = price;
    subject.price_per_m2 = price / subject.area_m2;
    store.upsert_property(subject).await.unwrap();
}

#[tokio::test]
async fn flag_is_cleared_once_price_catches_up() {
    let store = Arc::new(MemoryStore::new());
    let mut subject = seed_street(&store).await;
    let detector = detector(store.clone(), Arc::new(RecordingNotifier::default()));
    detector.run_pass(t0()).await.unwrap();

    reprice(&store, &mut subject, 140_000.0).await;
    let summary = detector.run_pass(t0() + Duration::hours(1)).await.unwrap();
    assert_eq!(summary.cleared, 1);
    let cleared = store.get_market_gap_flag(subject.id).await.unwrap().unwrap();
    assert!(!cleared.is_active());

    let again = detector.run_pass(t0() + Duration::hours(2)).await.unwrap();
    assert_eq!(again.cleared, 0);
}

#[tokio::test]
async fn reopened_gap_is_not_notified_twice() {
    let store = Arc::new(MemoryStore::new());
    let mut subject = seed_street(&store).await;
    let notifier = Arc::new(RecordingNotifier::default());
    let detector = detector(store.clone(), notifier.clone());

    detector.run_pass(t0()).await.unwrap();
    assert_eq!(detector.notify_pending().await.unwrap().market_gaps_sent, 1);

    reprice(&store, &mut subject, 140_000.0).await;
    detector.run_pass(t0() + Duration::hours(1)).await.unwrap();
    reprice(&store, &mut subject, 112_000.0).await;
    let summary = detector.run_pass(t0() + Duration::hours(2)).await.unwrap();
    assert_eq!(summary.flagged, 1);

    let flag = store.get_market_gap_flag(subject.id).await.unwrap().unwrap();
    assert!(flag.is_active());
    assert!(flag.notified);
    assert_eq!(detector.notify_pending().await.unwrap().market_gaps_sent, 0);
    assert_eq!(notifier.events.lock().unwrap().len(), 1);
}

struct StalledReference;

#[async_trait]
impl ReferencePriceSource for StalledReference {
    async fn reference_prices(&self, _query: &ReferenceQuery) -> Result<ReferencePrices, AdapterError> {
        tokio::time::sleep(std::time::Duration::from_secs(3_600)).await;
        Ok(ReferencePrices::default())
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_reference_lookup_times_out_per_property() {
    let store = Arc::new(MemoryStore::new());
    let subject = seed_street(&store).await;
    let detector = MarketGapDetector::new(
        store.clone(),
        Arc::new(StalledReference),
        Arc::new(RecordingNotifier::default()),
        MarketGapConfig {
            lookup_timeout_secs: 2,
            ..MarketGapConfig::default()
        },
    );

    let started = tokio::time::Instant::now();
    let summary = detector.run_pass(t0()).await.unwrap();
    assert_eq!(summary.analyzed, 7);
    assert_eq!(summary.reference_errors, 7);
    assert_eq!(summary.flagged, 0);
    assert_eq!(summary.status, RunStatus::Partial);
    // Seven lookups, each cut off at two seconds.
    let elapsed = started.elapsed();
    assert!(elapsed >= std::time::Duration::from_secs(14));
    assert!(elapsed < std::time::Duration::from_secs(15));
    assert!(store.get_market_gap_flag(subject.id).await.unwrap().is_none());
}

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[tokio::test]
async fn crawl_covers_each_page_once_per_cycle_and_links_portals() {
    let (store, ingestor, _) = setup();
    let driver = CrawlDriver::new(store.clone(), ingestor, CrawlConfig { pages_per_run: 10 });
    let adapters: Vec<Box<dyn SourceAdapter>> = vec![
        Box::new(FixtureSourceAdapter::new(
            "reality",
            vec!["byty-predaj".into(), "byty-prenajom".into()],
            fixtures_root(),
        )),
        Box::new(FixtureSourceAdapter::new("nehnutelnosti", vec!["byty".into()], fixtures_root())),
    ];

    let first = driver.run(&adapters, t0()).await.unwrap();
    let reality = &first.sources[0];
    assert_eq!(reality.listings_seen, 6);
    assert_eq!(reality.properties_created, 6);
    assert!(reality.completed_cycle);
    assert_eq!(
        (reality.cursor.category_index, reality.cursor.page, reality.cursor.cycle_count),
        (0, 1, 1)
    );
    assert_eq!(store.list_active_properties().await.unwrap().len(), 9);

    let edges = store.list_match_edges().await.unwrap();
    assert_eq!(edges.len(), 2);
    assert!(edges.iter().any(|e| e.confidence == Confidence::High));

    let second = driver.run(&adapters, t0() + Duration::hours(2)).await.unwrap();
    assert_eq!(second.sources[0].properties_created, 0);
    assert_eq!(second.sources[0].cursor.cycle_count, 2);
    assert_eq!(store.list_active_properties().await.unwrap().len(), 9);
    assert_eq!(store.list_match_edges().await.unwrap().len(), 2);
}

#[tokio::test]
async fn crawl_resumes_where_the_previous_run_stopped() {
    let (store, ingestor, _) = setup();
    let driver = CrawlDriver::new(store.clone(), ingestor, CrawlConfig { pages_per_run: 1 });
    let adapters: Vec<Box<dyn SourceAdapter>> = vec![Box::new(FixtureSourceAdapter::new(
        "reality",
        vec!["byty-predaj".into(), "byty-prenajom".into()],
        fixtures_root(),
    ))];

    let first = driver.run(&adapters, t0()).await.unwrap();
    assert_eq!(first.sources[0].listings_seen, 3);
    assert_eq!(first.sources[0].cursor.page, 2);

    let second = driver.run(&adapters, t0()).await.unwrap();
    assert_eq!(second.sources[0].listings_seen, 2);
    let cursor = store.get_scan_cursor("reality").await.unwrap().unwrap();
    assert_eq!((cursor.category_index, cursor.page), (0, 3));
}

#[tokio::test]
async fn fingerprint_refresh_only_writes_on_change() {
    let (store, ingestor, matcher) = setup();
    let out = ingestor.ingest(&record("reality", "f-1"), t0()).await.unwrap();
    let stored = store.get_fingerprint(out.property_id).await.unwrap().unwrap();
    assert_eq!(stored.computed_at, t0());

    let entity = store.get_property(out.property_id).await.unwrap().unwrap();
    let same = matcher.ensure_fingerprint(&entity, t0() + Duration::days(1)).await.unwrap();
    assert_eq!(same.computed_at, t0());

    let key = SourceKey::new("reality", "f-1");
    let mut moved = store.find_active_by_source_key(&key).await.unwrap().unwrap();
    moved.area_m2 = 95.0;
    let fresh = matcher.ensure_fingerprint(&moved, t0() + Duration::days(1)).await.unwrap();
    assert_eq!(fresh.area_range, "90-120");
    assert!(fresh.same_signals(&fingerprint_for(&moved, t0())));
}
