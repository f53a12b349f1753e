//! PMR pipeline: ingestion, matching, re-check scheduling, lifecycle tracking
//! and market-gap detection, plus the entry points the CLI and cron jobs call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use pmr_adapters::{
    adapter_for_source, HealthChecker, HttpHealthChecker, LogNotifier, Notifier,
    ReferencePriceSource, SourceAdapter, StoreReferencePrices, WebhookNotifier,
};
use pmr_core::MarketGapFlag;
use pmr_storage::{HttpFetcher, MemoryStore, PgStore, PropertyStore};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

pub mod config;
pub mod crawl;
pub mod fingerprint;
pub mod ingest;
pub mod lifecycle;
pub mod market_gap;
pub mod matcher;
pub mod priority;
pub mod report;
pub mod scheduler;

pub use config::{HttpSettings, PipelineSettings, SourceRegistry, StoreBackend, SyncConfig};
pub use crawl::{CrawlConfig, CrawlDriver, CrawlRunSummary, SourceCrawlSummary};
pub use ingest::{IngestOutcome, Ingestor};
pub use lifecycle::{apply_health_check, CheckContext, FailurePolicy, LifecycleEffects, LifecycleError};
pub use market_gap::{MarketGapConfig, MarketGapDetector, MarketGapRunSummary, NotifySummary};
pub use matcher::{score_pair, Candidate, MatchEngine, MatcherConfig, PairScore, ReconcileSummary};
pub use priority::{compute_priority, should_check_now, PriorityConfig};
pub use scheduler::{RecheckRunSummary, RecheckScheduler, SchedulerConfig};

pub const CRATE_NAME: &str = "pmr-sync";

/// Outcome of a batch stage. Partial runs are not failures: the work left
/// over is picked up by the next trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Completed,
    Partial,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyResetSummary {
    pub date: chrono::NaiveDate,
    pub reset: bool,
}

/// Wires the store, collaborators and settings together for each stage.
pub struct Pipeline {
    config: SyncConfig,
    settings: PipelineSettings,
    store: Arc<dyn PropertyStore>,
    http: Arc<HttpFetcher>,
    checker: Option<Arc<dyn HealthChecker>>,
    notifier: Option<Arc<dyn Notifier>>,
    reference: Option<Arc<dyn ReferencePriceSource>>,
}

impl Pipeline {
    pub fn new(config: SyncConfig, settings: PipelineSettings, store: Arc<dyn PropertyStore>) -> Result<Self> {
        let http = HttpFetcher::new(settings.http.client_config(
            Duration::from_secs(config.http_timeout_secs),
            &config.user_agent,
        ))?;
        Ok(Self {
            config,
            settings,
            store,
            http: Arc::new(http),
            checker: None,
            notifier: None,
            reference: None,
        })
    }

    pub async fn from_env() -> Result<Self> {
        let config = SyncConfig::from_env()?;
        let settings = PipelineSettings::load(&config.pipeline_path())?;
        let store: Arc<dyn PropertyStore> = match config.store_backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Postgres => {
                let store = PgStore::connect(&config.database_url)
                    .await
                    .context("connecting to postgres")?;
                store.migrate().await.context("running migrations")?;
                Arc::new(store)
            }
        };
        Self::new(config, settings, store)
    }

    pub fn with_health_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_reference_prices(mut self, reference: Arc<dyn ReferencePriceSource>) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> Arc<dyn PropertyStore> {
        self.store.clone()
    }

    pub fn matcher(&self) -> MatchEngine {
        MatchEngine::new(self.store.clone(), self.settings.matcher)
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(self.store.clone(), self.matcher())
    }

    fn source_registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(&self.config.sources_path())
    }

    fn health_checker(&self) -> Result<Arc<dyn HealthChecker>> {
        if let Some(checker) = &self.checker {
            return Ok(checker.clone());
        }
        let rules: HashMap<_, _> = self
            .source_registry()?
            .sources
            .into_iter()
            .map(|s| (s.source_id, s.health))
            .collect();
        Ok(Arc::new(HttpHealthChecker::new(self.http.clone(), rules)))
    }

    fn notifier(&self, run_id: Uuid) -> Arc<dyn Notifier> {
        if let Some(notifier) = &self.notifier {
            return notifier.clone();
        }
        match &self.config.notify_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(self.http.clone(), url.clone(), run_id)),
            None => Arc::new(LogNotifier),
        }
    }

    fn market_gap_detector(&self, run_id: Uuid) -> MarketGapDetector {
        let reference = self
            .reference
            .clone()
            .unwrap_or_else(|| Arc::new(StoreReferencePrices::new(self.store.clone())));
        MarketGapDetector::new(
            self.store.clone(),
            reference,
            self.notifier(run_id),
            self.settings.market_gap,
        )
    }

    fn source_adapters(&self) -> Result<Vec<Box<dyn SourceAdapter>>> {
        let registry = self.source_registry()?;
        let fixtures = self.config.fixtures_root();
        registry
            .enabled()
            .map(|source| {
                adapter_for_source(source, &fixtures, self.http.clone())
                    .with_context(|| format!("building adapter for {}", source.source_id))
            })
            .collect()
    }

    pub async fn run_crawl(&self) -> Result<CrawlRunSummary> {
        let adapters = self.source_adapters()?;
        let driver = CrawlDriver::new(self.store.clone(), self.ingestor(), self.settings.crawl);
        let summary = driver.run(&adapters, Utc::now()).await?;
        report::write_run_summary(&self.config.reports_root(), summary.run_id, "crawl", &summary).await?;
        Ok(summary)
    }

    pub async fn run_recheck(&self) -> Result<RecheckRunSummary> {
        let scheduler = RecheckScheduler::new(
            self.store.clone(),
            self.health_checker()?,
            self.settings.scheduler,
            self.settings.priority,
            self.settings.failures,
        );
        let summary = scheduler.run().await?;
        report::write_run_summary(&self.config.reports_root(), summary.run_id, "recheck", &summary).await?;
        Ok(summary)
    }

    pub async fn run_reconcile(&self) -> Result<ReconcileSummary> {
        let run_id = Uuid::new_v4();
        let summary = self.matcher().reconcile(Utc::now()).await?;
        report::write_run_summary(&self.config.reports_root(), run_id, "reconcile", &summary).await?;
        Ok(summary)
    }

    /// Gap pass followed by a parquet snapshot of the active flags.
    pub async fn run_market_gap(&self) -> Result<MarketGapRunSummary> {
        let run_id = Uuid::new_v4();
        let summary = self.market_gap_detector(run_id).run_pass(Utc::now()).await?;
        let reports_root = self.config.reports_root();
        report::write_run_summary(&reports_root, run_id, "market_gap", &summary).await?;
        let mut flags = self.store.list_market_gap_flags().await?;
        flags.retain(MarketGapFlag::is_active);
        report::export_market_gap_snapshot(&report::run_dir(&reports_root, run_id), &flags).await?;
        Ok(summary)
    }

    pub async fn run_notify(&self) -> Result<NotifySummary> {
        let run_id = Uuid::new_v4();
        let summary = self.market_gap_detector(run_id).notify_pending().await?;
        info!(
            market_gaps = summary.market_gaps_sent,
            lifecycle = summary.lifecycle_sent,
            failures = summary.failures,
            "notifications delivered"
        );
        Ok(summary)
    }

    pub async fn run_daily_reset(&self) -> Result<DailyResetSummary> {
        let date = Utc::now().date_naive();
        let reset = self.store.reset_daily_counters(date).await?;
        info!(%date, reset, "daily counter reset");
        Ok(DailyResetSummary { date, reset })
    }

    pub async fn run_priority_refresh(&self) -> Result<usize> {
        let written = scheduler::refresh_priorities(
            self.store.as_ref(),
            Utc::now(),
            &self.settings.priority,
            &self.settings.failures,
        )
        .await?;
        info!(written, "priority refresh finished");
        Ok(written)
    }

    /// Cron jobs for every stage, or `None` when `PMR_SCHEDULER_ENABLED` is off.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let jobs = [
            (Stage::Crawl, self.config.crawl_cron.clone()),
            (Stage::Recheck, self.config.recheck_cron.clone()),
            (Stage::DailyReset, self.config.daily_reset_cron.clone()),
            (Stage::MarketGap, self.config.market_gap_cron.clone()),
            (Stage::Reconcile, self.config.reconcile_cron.clone()),
        ];
        for (stage, cron) in jobs {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    if let Err(err) = pipeline.run_stage(stage).await {
                        error!(stage = stage.as_str(), error = %format!("{err:#}"), "scheduled stage failed");
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }

    pub async fn run_stage(&self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Crawl => self.run_crawl().await.map(drop),
            Stage::Recheck => self.run_recheck().await.map(drop),
            Stage::DailyReset => self.run_daily_reset().await.map(drop),
            Stage::MarketGap => {
                self.run_market_gap().await?;
                self.run_notify().await.map(drop)
            }
            Stage::Reconcile => {
                self.run_reconcile().await?;
                self.run_priority_refresh().await.map(drop)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Crawl,
    Recheck,
    DailyReset,
    MarketGap,
    Reconcile,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crawl => "crawl",
            Self::Recheck => "recheck",
            Self::DailyReset => "daily_reset",
            Self::MarketGap => "market_gap",
            Self::Reconcile => "reconcile",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(config: SyncConfig) -> Arc<Pipeline> {
        let store: Arc<dyn PropertyStore> = Arc::new(MemoryStore::new());
        Arc::new(Pipeline::new(config, PipelineSettings::default(), store).unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduler_builds_only_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::local(dir.path());
        assert!(pipeline(config.clone()).maybe_build_scheduler().await.unwrap().is_none());

        config.scheduler_enabled = true;
        assert!(pipeline(config).maybe_build_scheduler().await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_cron_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::local(dir.path());
        config.scheduler_enabled = true;
        config.recheck_cron = "every ten minutes".into();
        match pipeline(config).maybe_build_scheduler().await {
            Ok(_) => panic!("invalid cron expression accepted"),
            Err(err) => assert!(format!("{err:#}").contains("every ten minutes")),
        }
    }

    #[tokio::test]
    async fn market_gap_stage_writes_summary_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(SyncConfig::local(dir.path()));
        let summary = pipeline.run_market_gap().await.unwrap();
        assert_eq!(summary.analyzed, 0);

        let runs: Vec<_> = std::fs::read_dir(dir.path().join("reports"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(runs.len(), 1);
        let run = runs[0].path();
        assert!(run.join("summary.json").exists());
        assert!(run.join("snapshots/market_gap_flags.parquet").exists());
        assert!(run.join("snapshots/manifest.json").exists());
    }

    #[tokio::test]
    async fn daily_reset_stage_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(SyncConfig::local(dir.path()));
        assert!(pipeline.run_daily_reset().await.unwrap().reset);
        assert!(!pipeline.run_daily_reset().await.unwrap().reset);
    }
}
