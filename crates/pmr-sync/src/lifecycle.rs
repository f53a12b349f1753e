//! Applies classified health-check outcomes to a property.
//!
//! The transition is pure: it returns the updated entity together with the
//! records the caller must persist, so a duplicate trigger can be detected
//! before anything is written.

use chrono::{DateTime, NaiveDate, Utc};
use pmr_core::{
    price_per_m2, removal_reason_indicates_sale, HealthOutcome, LifecycleRecord,
    PriceHistoryPoint, PropertyEntity, PropertyStatus,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("property {id} is already {status}; terminal properties accept no further checks")]
    TerminalEntity { id: Uuid, status: PropertyStatus },
}

/// Consecutive check failures tolerated before a property is deprioritized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    pub threshold: u32,
    pub penalty: f64,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            penalty: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckContext {
    pub now: DateTime<Utc>,
    pub run_started_at: DateTime<Utc>,
}

impl CheckContext {
    pub fn new(now: DateTime<Utc>, run_started_at: DateTime<Utc>) -> Self {
        Self {
            now,
            run_started_at,
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEffects {
    pub entity: PropertyEntity,
    pub price_point: Option<PriceHistoryPoint>,
    pub lifecycle_record: Option<LifecycleRecord>,
    /// The failure counter reached the threshold on this check.
    pub crossed_failure_threshold: bool,
    /// The entity was already checked during this run; nothing to persist.
    pub duplicate: bool,
}

impl LifecycleEffects {
    fn duplicate(entity: &PropertyEntity) -> Self {
        Self {
            entity: entity.clone(),
            price_point: None,
            lifecycle_record: None,
            crossed_failure_threshold: false,
            duplicate: true,
        }
    }
}

/// Transition for one health check.
///
/// `initial_price` is the earliest recorded price and only matters when the
/// listing turns out to be gone.
pub fn apply_health_check(
    entity: &PropertyEntity,
    outcome: &HealthOutcome,
    initial_price: Option<f64>,
    ctx: &CheckContext,
    policy: &FailurePolicy,
) -> Result<LifecycleEffects, LifecycleError> {
    if entity.is_terminal() {
        return Err(LifecycleError::TerminalEntity {
            id: entity.id,
            status: entity.status,
        });
    }
    if matches!(entity.last_checked_at, Some(at) if at >= ctx.run_started_at) {
        return Ok(LifecycleEffects::duplicate(entity));
    }

    let now = ctx.now;
    let mut next = entity.clone();
    next.check_count_today = entity.checks_today(ctx.today()) + 1;
    next.check_count_day = Some(ctx.today());
    next.last_checked_at = Some(now);
    next.days_on_market = entity.days_listed(now);
    next.updated_at = now;

    let mut effects = LifecycleEffects {
        entity: next,
        price_point: None,
        lifecycle_record: None,
        crossed_failure_threshold: false,
        duplicate: false,
    };
    let next = &mut effects.entity;

    match outcome {
        HealthOutcome::Inactive { removal_reason } => {
            next.status = match removal_reason.as_deref() {
                Some(reason) if removal_reason_indicates_sale(reason) => PropertyStatus::Sold,
                _ => PropertyStatus::Removed,
            };
            effects.lifecycle_record = Some(LifecycleRecord {
                source: next.source.clone(),
                external_id: next.external_id.clone(),
                generation: next.generation,
                property_id: next.id,
                initial_price: initial_price.unwrap_or(entity.price),
                final_price: entity.price,
                days_on_market: next.days_on_market,
                removal_reason: removal_reason.clone(),
                final_status: next.status,
                closed_at: now,
                notified: false,
            });
        }
        HealthOutcome::PriceChanged { new_price } => {
            next.consecutive_failures = 0;
            next.last_seen_at = now;
            if (new_price - entity.price).abs() >= 0.01 {
                next.price = *new_price;
                next.price_per_m2 = price_per_m2(*new_price, next.area_m2);
                effects.price_point = Some(PriceHistoryPoint::for_property(next, now));
            }
        }
        HealthOutcome::CheckError { .. } => {
            next.consecutive_failures = entity.consecutive_failures.saturating_add(1);
            if next.consecutive_failures == policy.threshold {
                next.priority_score = (next.priority_score - policy.penalty).max(0.0);
                effects.crossed_failure_threshold = true;
            }
        }
        HealthOutcome::Unchanged => {
            next.consecutive_failures = 0;
            next.last_seen_at = now;
        }
    }

    Ok(effects)
}
