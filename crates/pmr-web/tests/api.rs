use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::BodyExt;
use pmr_core::{Confidence, ListingRecord, ListingType, MarketGapFlag, ReferenceLevel, ScanCursor};
use pmr_storage::{MemoryStore, PropertyStore};
use pmr_sync::{Ingestor, MatchEngine, MatcherConfig};
use pmr_web::{app, AppState};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).single().unwrap()
}

fn listing(source: &str, id: &str, price: f64) -> ListingRecord {
    ListingRecord {
        source: source.into(),
        external_id: id.into(),
        title: "3-izbový byt Ružinov".into(),
        price,
        area_m2: 78.0,
        city: "Bratislava".into(),
        district: "Ružinov".into(),
        street: Some("Bajkalská".into()),
        rooms: Some(3),
        floor: Some(5),
        condition: "renovated".into(),
        listing_type: ListingType::Sale,
        source_url: format!("https://{source}.example/{id}"),
        description: None,
    }
}

async fn get(store: Arc<MemoryStore>, uri: &str) -> (StatusCode, Value) {
    let dir = tempfile::tempdir().unwrap();
    let resp = app(AppState::new(store, dir.path()))
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn property_endpoints_expose_history_and_matches() {
    let store = Arc::new(MemoryStore::new());
    let ingestor = Ingestor::new(
        store.clone(),
        MatchEngine::new(store.clone(), MatcherConfig::default()),
    );
    let a = ingestor.ingest(&listing("reality", "r-1", 189_000.0), t0()).await.unwrap();
    let b = ingestor
        .ingest(&listing("nehnutelnosti", "n-1", 187_000.0), t0())
        .await
        .unwrap();
    ingestor
        .ingest(&listing("reality", "r-1", 185_000.0), t0() + chrono::Duration::days(1))
        .await
        .unwrap();

    let (status, body) = get(store.clone(), &format!("/properties/{}", a.property_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["property"]["status"], "ACTIVE");
    assert_eq!(body["fingerprint"]["area_range"], "70-90");
    assert!(body["lifecycle"].is_null());

    let (_, history) = get(store.clone(), &format!("/properties/{}/history", a.property_id)).await;
    let prices: Vec<f64> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["price"].as_f64().unwrap())
        .collect();
    assert_eq!(prices, vec![189_000.0, 185_000.0]);

    let (_, matches) = get(store.clone(), &format!("/properties/{}/matches", a.property_id)).await;
    let matches = matches.as_array().unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["property_id"], b.property_id.to_string());
    assert_eq!(matches[0]["confidence"], "HIGH");
}

#[tokio::test]
async fn market_gaps_filter_by_confidence_and_notification() {
    let store = Arc::new(MemoryStore::new());
    for (n, confidence, notified, gap) in [
        (1u128, Confidence::High, false, 22.0),
        (2, Confidence::Medium, true, 31.0),
        (3, Confidence::Low, false, 17.5),
    ] {
        store
            .upsert_market_gap_flag(&MarketGapFlag {
                property_id: Uuid::from_u128(n),
                gap_percentage: gap,
                reference_price: 3_000.0,
                reference_level: ReferenceLevel::District,
                comparable_count: 12,
                confidence,
                potential_profit: 40_000.0,
                notified,
                computed_at: t0(),
                cleared_at: None,
            })
            .await
            .unwrap();
    }
    let closed = store.get_market_gap_flag(Uuid::from_u128(1)).await.unwrap().unwrap();
    store
        .upsert_market_gap_flag(&MarketGapFlag {
            property_id: Uuid::from_u128(4),
            gap_percentage: 40.0,
            ..closed
        })
        .await
        .unwrap();
    store.clear_market_gap_flag(Uuid::from_u128(4), t0()).await.unwrap();

    let (_, all) = get(store.clone(), "/market-gaps").await;
    let gaps: Vec<f64> = all
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["gap_percentage"].as_f64().unwrap())
        .collect();
    assert_eq!(gaps, vec![31.0, 22.0, 17.5]);

    let (_, medium_up) = get(store.clone(), "/market-gaps?min_confidence=MEDIUM").await;
    assert_eq!(medium_up.as_array().unwrap().len(), 2);

    let (_, pending) = get(store.clone(), "/market-gaps?min_confidence=MEDIUM&pending_only=true").await;
    let pending = pending.as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["property_id"], Uuid::from_u128(1).to_string());
}

#[tokio::test]
async fn scan_cursors_are_listed() {
    let store = Arc::new(MemoryStore::new());
    let mut cursor = ScanCursor::start("reality", t0());
    cursor = cursor.advance(2, false);
    store.save_scan_cursor(&cursor).await.unwrap();

    let (status, body) = get(store, "/ops/scan-cursors").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["source"], "reality");
    assert_eq!(body[0]["page"], 2);
    assert_eq!(body[0]["cycle_count"], 0);
}
