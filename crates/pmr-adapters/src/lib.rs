//! Collaborator contracts (source adapters, health checks, reference prices,
//! notifiers) + fixture-first implementations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pmr_core::ListingRecord;
use pmr_storage::{FetchError, HttpFetcher, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

mod health;
mod notify;
mod reference;

pub use health::{classify_listing_page, parse_price_text, HealthChecker, HttpHealthChecker, PageRules};
pub use notify::{LogNotifier, NotificationEvent, Notifier, PropertySummary, WebhookNotifier};
pub use reference::{ReferencePriceSource, StoreReferencePrices};

pub const CRATE_NAME: &str = "pmr-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Pages captured on disk under `fixtures/<source>/<category>/page-<n>.json`.
    Fixture,
    /// Portal or partner endpoint already serving normalized listing JSON.
    JsonFeed,
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: SourceMode,
    #[serde(default)]
    pub categories: Vec<String>,
    /// URL template with `{category}` and `{page}` placeholders.
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub health: PageRules,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// Produces normalized listings for one `(category, page)`; an empty page ends the category.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    fn categories(&self) -> &[String];

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        category: &str,
        page: u32,
    ) -> Result<Vec<ListingRecord>, AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePage {
    pub source: String,
    pub category: String,
    pub page: u32,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub listings: Vec<ListingRecord>,
}

pub fn fixture_page_path(root: &Path, source: &str, category: &str, page: u32) -> PathBuf {
    root.join(source).join(category).join(format!("page-{page}.json"))
}

pub fn load_fixture_page(path: impl AsRef<Path>) -> anyhow::Result<FixturePage> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Drops records an adapter could not identify and stamps the adapter's source id.
fn normalize_records(source_id: &str, records: Vec<ListingRecord>) -> Vec<ListingRecord> {
    records
        .into_iter()
        .filter_map(|mut record| {
            if record.external_id.trim().is_empty() {
                warn!(source = source_id, title = %record.title, "skipping listing without external id");
                return None;
            }
            record.source = source_id.to_string();
            record.external_id = record.external_id.trim().to_string();
            Some(record)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct FixtureSourceAdapter {
    source_id: String,
    categories: Vec<String>,
    root: PathBuf,
}

impl FixtureSourceAdapter {
    pub fn new(source_id: impl Into<String>, categories: Vec<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            categories,
            root: root.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for FixtureSourceAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn categories(&self) -> &[String] {
        &self.categories
    }

    async fn fetch_page(
        &self,
        _ctx: &AdapterContext,
        category: &str,
        page: u32,
    ) -> Result<Vec<ListingRecord>, AdapterError> {
        let path = fixture_page_path(&self.root, &self.source_id, category, page);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let fixture = load_fixture_page(&path)?;
        if fixture.source != self.source_id {
            return Err(AdapterError::Message(format!(
                "fixture source={} does not match adapter source={}",
                fixture.source, self.source_id
            )));
        }
        Ok(normalize_records(&self.source_id, fixture.listings))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedBody {
    Wrapped { listings: Vec<ListingRecord> },
    Bare(Vec<ListingRecord>),
}

#[derive(Debug, Clone)]
pub struct JsonFeedSourceAdapter {
    source_id: String,
    categories: Vec<String>,
    url_template: String,
    http: Arc<HttpFetcher>,
}

impl JsonFeedSourceAdapter {
    pub fn new(
        source_id: impl Into<String>,
        categories: Vec<String>,
        url_template: impl Into<String>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            categories,
            url_template: url_template.into(),
            http,
        }
    }

    pub fn page_url(&self, category: &str, page: u32) -> String {
        self.url_template
            .replace("{category}", category)
            .replace("{page}", &page.to_string())
    }
}

#[async_trait]
impl SourceAdapter for JsonFeedSourceAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn categories(&self) -> &[String] {
        &self.categories
    }

    async fn fetch_page(
        &self,
        ctx: &AdapterContext,
        category: &str,
        page: u32,
    ) -> Result<Vec<ListingRecord>, AdapterError> {
        let url = self.page_url(category, page);
        let resp = match self.http.fetch_bytes(ctx.run_id, &self.source_id, &url).await {
            Ok(resp) => resp,
            // Paging past the end is reported as 404 by most feeds.
            Err(err) if err.status() == Some(404) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let body: FeedBody = serde_json::from_slice(&resp.body)
            .map_err(|e| AdapterError::Message(format!("invalid feed JSON from {url}: {e}")))?;
        let records = match body {
            FeedBody::Wrapped { listings } => listings,
            FeedBody::Bare(listings) => listings,
        };
        Ok(normalize_records(&self.source_id, records))
    }
}

pub fn adapter_for_source(
    config: &SourceConfig,
    fixtures_root: &Path,
    http: Arc<HttpFetcher>,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match config.mode {
        SourceMode::Fixture => Ok(Box::new(FixtureSourceAdapter::new(
            &config.source_id,
            config.categories.clone(),
            fixtures_root,
        ))),
        SourceMode::JsonFeed => {
            let template = config.feed_url.clone().ok_or_else(|| {
                AdapterError::Message(format!("source {} has no feed_url", config.source_id))
            })?;
            Ok(Box::new(JsonFeedSourceAdapter::new(
                &config.source_id,
                config.categories.clone(),
                template,
                http,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmr_core::ListingType;
    use tempfile::tempdir;

    fn record(external_id: &str) -> ListingRecord {
        ListingRecord {
            source: "somewhere-else".into(),
            external_id: external_id.into(),
            title: "3 izbový byt".into(),
            price: 189_000.0,
            area_m2: 78.0,
            city: "Bratislava".into(),
            district: "Ružinov".into(),
            street: Some("Bajkalská".into()),
            rooms: Some(3),
            floor: Some(5),
            condition: "renovated".into(),
            listing_type: ListingType::Sale,
            source_url: format!("https://example.test/{external_id}"),
            description: None,
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::nil(),
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fixture_adapter_reads_pages_and_ends_on_missing_file() {
        let dir = tempdir().expect("tempdir");
        let page = FixturePage {
            source: "reality".into(),
            category: "byty-predaj".into(),
            page: 1,
            captured_at: Utc::now(),
            listings: vec![record(" r-1 "), record("")],
        };
        let path = fixture_page_path(dir.path(), "reality", "byty-predaj", 1);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, serde_json::to_vec(&page).unwrap()).unwrap();

        let adapter = FixtureSourceAdapter::new("reality", vec!["byty-predaj".into()], dir.path());
        let records = adapter.fetch_page(&ctx(), "byty-predaj", 1).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, "reality");
        assert_eq!(records[0].external_id, "r-1");

        let past_end = adapter.fetch_page(&ctx(), "byty-predaj", 2).await.unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn fixture_adapter_rejects_foreign_source() {
        let dir = tempdir().expect("tempdir");
        let page = FixturePage {
            source: "topreality".into(),
            category: "byty".into(),
            page: 1,
            captured_at: Utc::now(),
            listings: vec![],
        };
        let path = fixture_page_path(dir.path(), "reality", "byty", 1);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, serde_json::to_vec(&page).unwrap()).unwrap();

        let adapter = FixtureSourceAdapter::new("reality", vec!["byty".into()], dir.path());
        assert!(adapter.fetch_page(&ctx(), "byty", 1).await.is_err());
    }

    #[test]
    fn feed_url_template_is_filled() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let adapter = JsonFeedSourceAdapter::new(
            "partner",
            vec!["flats".into()],
            "https://feed.example.test/{category}?page={page}",
            http,
        );
        assert_eq!(
            adapter.page_url("flats", 3),
            "https://feed.example.test/flats?page=3"
        );
    }

    #[test]
    fn json_feed_source_without_url_is_rejected() {
        let config = SourceConfig {
            source_id: "partner".into(),
            display_name: "Partner".into(),
            enabled: true,
            mode: SourceMode::JsonFeed,
            categories: vec![],
            feed_url: None,
            health: PageRules::default(),
            notes: None,
        };
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        assert!(adapter_for_source(&config, Path::new("."), http).is_err());
    }
}
