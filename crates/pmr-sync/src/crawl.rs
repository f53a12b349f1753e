//! Drives the resumable crawl over each source's categories and pages.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pmr_adapters::{AdapterContext, SourceAdapter};
use pmr_core::ScanCursor;
use pmr_storage::PropertyStore;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ingest::Ingestor;
use crate::RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub pages_per_run: u32,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self { pages_per_run: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceCrawlSummary {
    pub source: String,
    pub pages_fetched: u32,
    pub listings_seen: usize,
    pub properties_created: usize,
    pub errors: usize,
    pub cursor: ScanCursor,
    pub completed_cycle: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrawlRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub sources: Vec<SourceCrawlSummary>,
    pub status: RunStatus,
}

pub struct CrawlDriver {
    store: Arc<dyn PropertyStore>,
    ingestor: Ingestor,
    config: CrawlConfig,
}

impl CrawlDriver {
    pub fn new(store: Arc<dyn PropertyStore>, ingestor: Ingestor, config: CrawlConfig) -> Self {
        Self {
            store,
            ingestor,
            config,
        }
    }

    pub async fn run(
        &self,
        adapters: &[Box<dyn SourceAdapter>],
        now: DateTime<Utc>,
    ) -> Result<CrawlRunSummary> {
        let run_id = Uuid::new_v4();
        let ctx = AdapterContext {
            run_id,
            fetched_at: now,
        };
        let mut summary = CrawlRunSummary {
            run_id,
            started_at: now,
            sources: Vec::with_capacity(adapters.len()),
            status: RunStatus::Completed,
        };
        for adapter in adapters {
            let span = info_span!("crawl_source", %run_id, source = adapter.source_id());
            let source = self.crawl_source(adapter.as_ref(), &ctx, now).instrument(span).await?;
            if source.errors > 0 {
                summary.status = RunStatus::Partial;
            }
            summary.sources.push(source);
        }
        Ok(summary)
    }

    /// Fetches up to `pages_per_run` pages, saving the cursor after each page
    /// so a later run resumes at the first page not yet ingested.
    pub async fn crawl_source(
        &self,
        adapter: &dyn SourceAdapter,
        ctx: &AdapterContext,
        now: DateTime<Utc>,
    ) -> Result<SourceCrawlSummary> {
        let source = adapter.source_id().to_string();
        let categories = adapter.categories();
        let category_count = u32::try_from(categories.len()).unwrap_or(u32::MAX);
        let mut cursor = self
            .store
            .get_scan_cursor(&source)
            .await
            .with_context(|| format!("loading cursor for {source}"))?
            .unwrap_or_else(|| ScanCursor::start(&source, now));

        let mut summary = SourceCrawlSummary {
            source: source.clone(),
            pages_fetched: 0,
            listings_seen: 0,
            properties_created: 0,
            errors: 0,
            cursor: cursor.clone(),
            completed_cycle: false,
        };
        if categories.is_empty() {
            return Ok(summary);
        }

        for _ in 0..self.config.pages_per_run {
            let Some(category) = categories.get(cursor.category_index as usize) else {
                // Category list shrank since the cursor was saved.
                cursor = self.save_advanced(&cursor, category_count, true, now).await?;
                summary.completed_cycle = true;
                break;
            };

            let records = match adapter.fetch_page(ctx, category, cursor.page).await {
                Ok(records) => records,
                Err(err) => {
                    summary.errors += 1;
                    warn!(category = %category, page = cursor.page, error = %err, "page fetch failed");
                    break;
                }
            };
            summary.pages_fetched += 1;
            summary.listings_seen += records.len();

            for record in &records {
                match self.ingestor.ingest(record, now).await {
                    Ok(outcome) => summary.properties_created += usize::from(outcome.created),
                    Err(err) => {
                        summary.errors += 1;
                        warn!(listing = %record.external_id, error = %format!("{err:#}"), "ingest failed");
                    }
                }
            }

            let next = self
                .save_advanced(&cursor, category_count, records.is_empty(), now)
                .await?;
            let wrapped = next.cycle_count > cursor.cycle_count;
            cursor = next;
            if wrapped {
                summary.completed_cycle = true;
                break;
            }
        }

        info!(
            pages = summary.pages_fetched,
            listings = summary.listings_seen,
            created = summary.properties_created,
            category_index = cursor.category_index,
            page = cursor.page,
            cycle = cursor.cycle_count,
            "crawl source finished"
        );
        summary.cursor = cursor;
        Ok(summary)
    }

    async fn save_advanced(
        &self,
        cursor: &ScanCursor,
        category_count: u32,
        page_was_empty: bool,
        now: DateTime<Utc>,
    ) -> Result<ScanCursor> {
        let mut next = cursor.advance(category_count, page_was_empty);
        next.updated_at = now;
        self.store
            .save_scan_cursor(&next)
            .await
            .with_context(|| format!("saving cursor for {}", next.source))?;
        Ok(next)
    }
}
