//! Flags listings priced below their locality's reference unit price.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use pmr_adapters::{NotificationEvent, Notifier, PropertySummary, ReferencePriceSource};
use pmr_core::{
    Confidence, MarketGapFlag, PropertyEntity, PropertyStatus, ReferenceLevel, ReferencePrices,
    ReferenceQuery,
};
use pmr_storage::PropertyStore;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use crate::RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketGapConfig {
    pub min_gap_pct: f64,
    pub street_min_comparables: u32,
    pub district_min_comparables: u32,
    pub high_confidence_comparables: u32,
    pub medium_confidence_comparables: u32,
    pub notify_min_confidence: Confidence,
    pub lookup_timeout_secs: u64,
}

impl MarketGapConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }
}

impl Default for MarketGapConfig {
    fn default() -> Self {
        Self {
            min_gap_pct: 15.0,
            street_min_comparables: 5,
            district_min_comparables: 3,
            high_confidence_comparables: 10,
            medium_confidence_comparables: 5,
            notify_min_confidence: Confidence::Medium,
            lookup_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedReference {
    pub price: f64,
    pub level: ReferenceLevel,
    pub comparables: u32,
}

/// Street average when enough comparables exist there, otherwise the district average.
pub fn resolve_reference(
    prices: &ReferencePrices,
    config: &MarketGapConfig,
) -> Option<ResolvedReference> {
    if let Some(avg) = prices.street_avg.filter(|a| *a > 0.0) {
        if prices.street_count >= config.street_min_comparables {
            return Some(ResolvedReference {
                price: avg,
                level: ReferenceLevel::Street,
                comparables: prices.street_count,
            });
        }
    }
    let avg = prices.district_avg.filter(|a| *a > 0.0)?;
    (prices.district_count >= config.district_min_comparables).then_some(ResolvedReference {
        price: avg,
        level: ReferenceLevel::District,
        comparables: prices.district_count,
    })
}

pub fn gap_confidence(reference: &ResolvedReference, config: &MarketGapConfig) -> Confidence {
    if reference.level == ReferenceLevel::Street
        && reference.comparables >= config.high_confidence_comparables
    {
        Confidence::High
    } else if reference.comparables >= config.medium_confidence_comparables {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Flag for `entity` if its unit price sits at least `min_gap_pct` below the reference.
pub fn evaluate_gap(
    entity: &PropertyEntity,
    prices: &ReferencePrices,
    config: &MarketGapConfig,
    now: DateTime<Utc>,
) -> Option<MarketGapFlag> {
    if entity.price_per_m2 <= 0.0 || entity.area_m2 <= 0.0 {
        return None;
    }
    let reference = resolve_reference(prices, config)?;
    let difference = reference.price - entity.price_per_m2;
    let gap_percentage = difference / reference.price * 100.0;
    if gap_percentage < config.min_gap_pct {
        return None;
    }
    Some(MarketGapFlag {
        property_id: entity.id,
        gap_percentage: round2(gap_percentage),
        reference_price: round2(reference.price),
        reference_level: reference.level,
        comparable_count: reference.comparables,
        confidence: gap_confidence(&reference, config),
        potential_profit: round2(difference * entity.area_m2),
        notified: false,
        computed_at: now,
        cleared_at: None,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum GapDecision {
    Flagged(MarketGapFlag),
    /// A previously active flag no longer qualifies and was cleared.
    Cleared,
    NotFlagged,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketGapRunSummary {
    pub analyzed: usize,
    pub flagged: usize,
    pub cleared: usize,
    pub reference_errors: usize,
    pub store_errors: usize,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotifySummary {
    pub market_gaps_sent: usize,
    pub lifecycle_sent: usize,
    pub below_confidence: usize,
    pub failures: usize,
}

#[derive(Clone)]
pub struct MarketGapDetector {
    store: Arc<dyn PropertyStore>,
    reference: Arc<dyn ReferencePriceSource>,
    notifier: Arc<dyn Notifier>,
    config: MarketGapConfig,
}

impl MarketGapDetector {
    pub fn new(
        store: Arc<dyn PropertyStore>,
        reference: Arc<dyn ReferencePriceSource>,
        notifier: Arc<dyn Notifier>,
        config: MarketGapConfig,
    ) -> Self {
        Self {
            store,
            reference,
            notifier,
            config,
        }
    }

    pub async fn analyze_property(
        &self,
        entity: &PropertyEntity,
        now: DateTime<Utc>,
    ) -> Result<GapDecision> {
        let query = ReferenceQuery::for_property(entity);
        let limit = self.config.lookup_timeout();
        let prices = tokio::time::timeout(limit, self.reference.reference_prices(&query))
            .await
            .map_err(|_| anyhow!("lookup timed out after {}s", limit.as_secs()))
            .and_then(|res| res.map_err(anyhow::Error::from))
            .with_context(|| format!("reference prices for {}", entity.id))?;
        match evaluate_gap(entity, &prices, &self.config, now) {
            Some(flag) => {
                let stored = self.store.upsert_market_gap_flag(&flag).await?;
                Ok(GapDecision::Flagged(stored))
            }
            None if self.store.clear_market_gap_flag(entity.id, now).await? => {
                Ok(GapDecision::Cleared)
            }
            None => Ok(GapDecision::NotFlagged),
        }
    }

    /// Analyzes every active property and clears flags of properties that closed.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<MarketGapRunSummary> {
        let span = info_span!("market_gap_pass");
        async move {
            let mut summary = MarketGapRunSummary::default();
            let active = self
                .store
                .list_active_properties()
                .await
                .context("listing active properties")?;

            for entity in &active {
                summary.analyzed += 1;
                match self.analyze_property(entity, now).await {
                    Ok(GapDecision::Flagged(_)) => summary.flagged += 1,
                    Ok(GapDecision::Cleared) => summary.cleared += 1,
                    Ok(GapDecision::NotFlagged) => {}
                    Err(err) => {
                        summary.reference_errors += 1;
                        warn!(property_id = %entity.id, error = %format!("{err:#}"), "gap analysis failed");
                    }
                }
            }

            for flag in self.store.list_market_gap_flags().await? {
                if !flag.is_active() {
                    continue;
                }
                let closed = match self.store.get_property(flag.property_id).await {
                    Ok(Some(p)) => p.status != PropertyStatus::Active,
                    Ok(None) => true,
                    Err(err) => {
                        summary.store_errors += 1;
                        warn!(property_id = %flag.property_id, error = %err, "flag lookup failed");
                        continue;
                    }
                };
                if closed && self.store.clear_market_gap_flag(flag.property_id, now).await? {
                    summary.cleared += 1;
                }
            }

            if summary.reference_errors + summary.store_errors > 0 {
                summary.status = RunStatus::Partial;
            }
            info!(
                analyzed = summary.analyzed,
                flagged = summary.flagged,
                cleared = summary.cleared,
                errors = summary.reference_errors + summary.store_errors,
                "market gap pass finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Hands unnotified flags and lifecycle records to the notifier; each is
    /// marked notified only after the notifier accepted it.
    pub async fn notify_pending(&self) -> Result<NotifySummary> {
        let mut summary = NotifySummary::default();

        for flag in self.store.list_market_gap_flags().await? {
            if flag.notified || !flag.is_active() {
                continue;
            }
            if flag.confidence < self.config.notify_min_confidence {
                summary.below_confidence += 1;
                continue;
            }
            let Some(property) = self.store.get_property(flag.property_id).await? else {
                continue;
            };
            let event = NotificationEvent::MarketGap {
                property: PropertySummary::from(&property),
                flag: flag.clone(),
            };
            match self.notifier.notify(&event).await {
                Ok(()) => {
                    self.store.mark_flag_notified(flag.property_id).await?;
                    summary.market_gaps_sent += 1;
                }
                Err(err) => {
                    summary.failures += 1;
                    warn!(property_id = %flag.property_id, error = %err, "market gap notification failed");
                }
            }
        }

        for record in self.store.lifecycle_records_pending_notification().await? {
            let key = record.source_key();
            let generation = record.generation;
            match self.notifier.notify(&NotificationEvent::Lifecycle { record }).await {
                Ok(()) => {
                    self.store.mark_lifecycle_notified(&key, generation).await?;
                    summary.lifecycle_sent += 1;
                }
                Err(err) => {
                    summary.failures += 1;
                    warn!(listing = %key, error = %err, "lifecycle notification failed");
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pmr_core::{ListingRecord, ListingType};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 5, 7, 0, 0).single().unwrap()
    }

    fn listing(price: f64, area: f64) -> PropertyEntity {
        let record = ListingRecord {
            source: "reality".into(),
            external_id: "r-5".into(),
            title: "2 izbový byt".into(),
            price,
            area_m2: area,
            city: "Bratislava".into(),
            district: "Petržalka".into(),
            street: Some("Budatínska".into()),
            rooms: Some(2),
            floor: Some(3),
            condition: "original".into(),
            listing_type: ListingType::Sale,
            source_url: "https://example.test/r-5".into(),
            description: None,
        };
        PropertyEntity::from_listing(&record, 0, now())
    }

    fn street_prices(avg: f64, count: u32) -> ReferencePrices {
        ReferencePrices {
            street_avg: Some(avg),
            street_count: count,
            district_avg: Some(2_500.0),
            district_count: 40,
        }
    }

    #[test]
    fn twenty_percent_gap_is_flagged_with_profit() {
        let entity = listing(112_000.0, 70.0);
        let flag = evaluate_gap(&entity, &street_prices(2_000.0, 6), &MarketGapConfig::default(), now())
            .unwrap();
        assert_eq!(flag.gap_percentage, 20.0);
        assert_eq!(flag.potential_profit, 28_000.0);
        assert_eq!(flag.reference_level, ReferenceLevel::Street);
        assert_eq!(flag.confidence, Confidence::Medium);
    }

    #[test]
    fn thin_street_sample_falls_back_to_district() {
        let prices = street_prices(3_000.0, 4);
        let reference = resolve_reference(&prices, &MarketGapConfig::default()).unwrap();
        assert_eq!(reference.level, ReferenceLevel::District);
        assert_eq!(reference.price, 2_500.0);
        assert_eq!(gap_confidence(&reference, &MarketGapConfig::default()), Confidence::Medium);

        let sparse = ReferencePrices {
            street_avg: None,
            street_count: 0,
            district_avg: Some(2_500.0),
            district_count: 2,
        };
        assert_eq!(resolve_reference(&sparse, &MarketGapConfig::default()), None);
    }

    #[test]
    fn confidence_tiers() {
        let config = MarketGapConfig::default();
        let high = ResolvedReference {
            price: 2_000.0,
            level: ReferenceLevel::Street,
            comparables: 10,
        };
        assert_eq!(gap_confidence(&high, &config), Confidence::High);
        let district = ResolvedReference {
            level: ReferenceLevel::District,
            comparables: 30,
            ..high
        };
        assert_eq!(gap_confidence(&district, &config), Confidence::Medium);
        let thin = ResolvedReference {
            level: ReferenceLevel::District,
            comparables: 3,
            ..high
        };
        assert_eq!(gap_confidence(&thin, &config), Confidence::Low);
    }

    #[test]
    fn small_gap_or_unknown_price_is_not_flagged() {
        let config = MarketGapConfig::default();
        let near = listing(126_000.0, 70.0);
        assert!(evaluate_gap(&near, &street_prices(2_000.0, 6), &config, now()).is_none());
        let on_request = listing(0.0, 70.0);
        assert!(evaluate_gap(&on_request, &street_prices(2_000.0, 6), &config, now()).is_none());
    }
}
