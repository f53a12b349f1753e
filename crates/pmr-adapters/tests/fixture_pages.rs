use std::path::PathBuf;

use chrono::Utc;
use pmr_adapters::{AdapterContext, FixtureSourceAdapter, SourceAdapter};
use pmr_core::ListingType;
use uuid::Uuid;

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn ctx() -> AdapterContext {
    AdapterContext {
        run_id: Uuid::new_v4(),
        fetched_at: Utc::now(),
    }
}

async fn drain(adapter: &FixtureSourceAdapter, category: &str) -> Vec<pmr_core::ListingRecord> {
    let mut out = Vec::new();
    for page in 1.. {
        let records = adapter.fetch_page(&ctx(), category, page).await.expect("fixture page");
        if records.is_empty() {
            break;
        }
        out.extend(records);
    }
    out
}

#[tokio::test]
async fn reality_fixture_pages_parse_until_exhausted() {
    let adapter = FixtureSourceAdapter::new(
        "reality",
        vec!["byty-predaj".into(), "byty-prenajom".into()],
        fixtures_root(),
    );

    let sale = drain(&adapter, "byty-predaj").await;
    assert_eq!(sale.len(), 5);
    assert!(sale.iter().all(|r| r.source == "reality"));
    assert!(sale.iter().all(|r| r.listing_type == ListingType::Sale));
    assert!(sale.iter().all(|r| r.area_m2 > 0.0));

    let rent = drain(&adapter, "byty-prenajom").await;
    assert_eq!(rent.len(), 1);
    assert_eq!(rent[0].listing_type, ListingType::Rent);
}

#[tokio::test]
async fn second_portal_carries_a_cross_listed_flat() {
    let adapter = FixtureSourceAdapter::new("nehnutelnosti", vec!["byty".into()], fixtures_root());
    let records = drain(&adapter, "byty").await;
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .any(|r| r.district == "Petržalka" && (r.area_m2 - 64.0).abs() < f64::EPSILON));
}
