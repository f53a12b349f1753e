//! Budget-bounded re-check runs.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pmr_adapters::HealthChecker;
use pmr_core::{HealthCheckRequest, HealthCheckResponse, HealthOutcome, PropertyEntity};
use pmr_storage::{PropertyStore, StoreResult};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::lifecycle::{apply_health_check, CheckContext, FailurePolicy, LifecycleError};
use crate::priority::{
    compute_priority, should_check_now, should_persist, streak_bounded, PriorityConfig,
};
use crate::RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    pub overfetch_factor: usize,
    pub request_delay_ms: u64,
    pub check_timeout_secs: u64,
    pub run_budget_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            overfetch_factor: 2,
            request_delay_ms: 1_500,
            check_timeout_secs: 10,
            run_budget_secs: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn request_delay(&self) -> StdDuration {
        StdDuration::from_millis(self.request_delay_ms)
    }

    pub fn check_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.check_timeout_secs)
    }

    pub fn run_budget(&self) -> StdDuration {
        StdDuration::from_secs(self.run_budget_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecheckRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub daily_reset: bool,
    pub candidates_fetched: usize,
    pub due: usize,
    pub checked: usize,
    pub inactive: usize,
    pub price_changed: usize,
    pub check_errors: usize,
    pub unchanged: usize,
    pub duplicates: usize,
    pub invariant_violations: usize,
    pub store_errors: usize,
    pub priority_updates: usize,
    pub left_for_next_run: usize,
    pub status: RunStatus,
}

impl RecheckRunSummary {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            daily_reset: false,
            candidates_fetched: 0,
            due: 0,
            checked: 0,
            inactive: 0,
            price_changed: 0,
            check_errors: 0,
            unchanged: 0,
            duplicates: 0,
            invariant_violations: 0,
            store_errors: 0,
            priority_updates: 0,
            left_for_next_run: 0,
            status: RunStatus::Completed,
        }
    }

    fn count_outcome(&mut self, outcome: &HealthOutcome) {
        match outcome {
            HealthOutcome::Inactive { .. } => self.inactive += 1,
            HealthOutcome::PriceChanged { .. } => self.price_changed += 1,
            HealthOutcome::CheckError { .. } => self.check_errors += 1,
            HealthOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

enum CandidateResult {
    Applied { priority_written: bool },
    Duplicate,
    Gone,
}

pub struct RecheckScheduler {
    store: Arc<dyn PropertyStore>,
    checker: Arc<dyn HealthChecker>,
    config: SchedulerConfig,
    priority: PriorityConfig,
    failures: FailurePolicy,
}

impl RecheckScheduler {
    pub fn new(
        store: Arc<dyn PropertyStore>,
        checker: Arc<dyn HealthChecker>,
        config: SchedulerConfig,
        priority: PriorityConfig,
        failures: FailurePolicy,
    ) -> Self {
        Self {
            store,
            checker,
            config,
            priority,
            failures,
        }
    }

    pub async fn run(&self) -> Result<RecheckRunSummary> {
        self.run_at(Utc::now()).await
    }

    /// One run starting at wall-clock `started_at`. Elapsed time is measured on
    /// the tokio clock so the budget and delays follow paused test time.
    pub async fn run_at(&self, started_at: DateTime<Utc>) -> Result<RecheckRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("recheck_run", %run_id);
        self.run_inner(run_id, started_at).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<RecheckRunSummary> {
        let mut summary = RecheckRunSummary::new(run_id, started_at);
        let today = started_at.date_naive();

        summary.daily_reset = self
            .store
            .reset_daily_counters(today)
            .await
            .context("resetting daily counters")?;

        let superset = self
            .store
            .fetch_check_candidates(self.config.batch_size * self.config.overfetch_factor.max(1))
            .await
            .context("fetching check candidates")?;
        summary.candidates_fetched = superset.len();

        let due: Vec<PropertyEntity> = superset
            .into_iter()
            .filter(|c| {
                should_check_now(c.priority_score, c.checks_today(today), c.last_checked_at, started_at)
            })
            .take(self.config.batch_size)
            .collect();
        summary.due = due.len();

        let clock = Instant::now();
        let budget = self.config.run_budget();
        for (idx, candidate) in due.iter().enumerate() {
            if idx > 0 {
                if clock.elapsed() >= budget {
                    summary.left_for_next_run = due.len() - idx;
                    break;
                }
                tokio::time::sleep(self.config.request_delay()).await;
                if clock.elapsed() >= budget {
                    summary.left_for_next_run = due.len() - idx;
                    break;
                }
            }

            let now = started_at + chrono::Duration::from_std(clock.elapsed()).unwrap_or_default();
            let response = self.check_with_timeout(candidate).await;
            let outcome = HealthOutcome::from(response);
            summary.checked += 1;
            summary.count_outcome(&outcome);

            let ctx = CheckContext::new(now, started_at);
            match self.process_candidate(candidate.id, &outcome, &ctx).await {
                Ok(CandidateResult::Applied { priority_written }) => {
                    summary.priority_updates += usize::from(priority_written);
                }
                Ok(CandidateResult::Duplicate) => summary.duplicates += 1,
                Ok(CandidateResult::Gone) => {}
                Err(CandidateError::Lifecycle(err)) => {
                    summary.invariant_violations += 1;
                    error!(property_id = %candidate.id, error = %err, "health check applied to terminal property");
                }
                Err(CandidateError::Store(err)) => {
                    summary.store_errors += 1;
                    warn!(property_id = %candidate.id, error = %err, "persisting check result failed");
                }
            }
        }

        if summary.left_for_next_run > 0 {
            summary.status = RunStatus::Partial;
        }
        summary.finished_at =
            started_at + chrono::Duration::from_std(clock.elapsed()).unwrap_or_default();
        info!(
            due = summary.due,
            checked = summary.checked,
            errors = summary.check_errors,
            left = summary.left_for_next_run,
            status = ?summary.status,
            "recheck run finished"
        );
        Ok(summary)
    }

    async fn check_with_timeout(&self, candidate: &PropertyEntity) -> HealthCheckResponse {
        let request = HealthCheckRequest::for_property(candidate);
        let limit = self.config.check_timeout();
        match tokio::time::timeout(limit, self.checker.check(&request)).await {
            Ok(response) => response,
            Err(_) => HealthCheckResponse::failed(format!(
                "health check timed out after {}s",
                limit.as_secs()
            )),
        }
    }

    async fn process_candidate(
        &self,
        id: Uuid,
        outcome: &HealthOutcome,
        ctx: &CheckContext,
    ) -> Result<CandidateResult, CandidateError> {
        // Re-read: an overlapping run may have touched the entity since the candidate fetch.
        let Some(entity) = self.store.get_property(id).await? else {
            return Ok(CandidateResult::Gone);
        };
        let mut history = self.store.price_history(id).await?;
        let initial_price = history.first().map(|p| p.price);

        let effects =
            apply_health_check(&entity, outcome, initial_price, ctx, &self.failures)?;
        if effects.duplicate {
            return Ok(CandidateResult::Duplicate);
        }

        self.store.upsert_property(&effects.entity).await?;
        if let Some(point) = &effects.price_point {
            self.store.append_price_point(point).await?;
            history.push(point.clone());
        }
        if let Some(record) = &effects.lifecycle_record {
            self.store.upsert_lifecycle_record(record).await?;
            info!(
                property_id = %record.property_id,
                status = %record.final_status,
                days_on_market = record.days_on_market,
                "listing closed"
            );
        }
        if effects.entity.is_terminal() {
            return Ok(CandidateResult::Applied {
                priority_written: false,
            });
        }

        let computed = compute_priority(&effects.entity, &history, ctx.now, &self.priority, &self.failures);
        let next = streak_bounded(&effects.entity, computed, effects.crossed_failure_threshold);
        let write = should_persist(
            entity.priority_score,
            next,
            effects.crossed_failure_threshold,
            &self.priority,
        );
        if write {
            self.store.update_priority_score(id, next, ctx.now).await?;
        }
        Ok(CandidateResult::Applied {
            priority_written: write,
        })
    }
}

#[derive(Debug)]
enum CandidateError {
    Lifecycle(LifecycleError),
    Store(pmr_storage::StoreError),
}

impl From<LifecycleError> for CandidateError {
    fn from(err: LifecycleError) -> Self {
        Self::Lifecycle(err)
    }
}

impl From<pmr_storage::StoreError> for CandidateError {
    fn from(err: pmr_storage::StoreError) -> Self {
        Self::Store(err)
    }
}

/// Recomputes every active property's priority, writing back only material
/// changes. Properties in a failure streak are never raised.
pub async fn refresh_priorities(
    store: &dyn PropertyStore,
    now: DateTime<Utc>,
    config: &PriorityConfig,
    failures: &FailurePolicy,
) -> StoreResult<usize> {
    let mut written = 0;
    for entity in store.list_active_properties().await? {
        let history = store.price_history(entity.id).await?;
        let computed = compute_priority(&entity, &history, now, config, failures);
        let next = streak_bounded(&entity, computed, false);
        if should_persist(entity.priority_score, next, false, config) {
            store.update_priority_score(entity.id, next, now).await?;
            written += 1;
        }
    }
    Ok(written)
}
