use chrono::{DateTime, Duration, Utc};
use pmr_core::{PriceHistoryPoint, PropertyEntity};
use serde::{Deserialize, Serialize};

use crate::lifecycle::FailurePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    /// Smallest absolute change worth writing back.
    pub persist_delta: f64,
    pub per_failure_penalty: f64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            persist_delta: 5.0,
            per_failure_penalty: 3.0,
        }
    }
}

fn recency_points(days_listed: u32) -> f64 {
    match days_listed {
        0..=1 => 30.0,
        2..=3 => 25.0,
        4..=7 => 20.0,
        8..=14 => 12.0,
        15..=30 => 6.0,
        _ => 2.0,
    }
}

/// Price movements recorded during the last seven days. `history` is oldest first.
fn recent_price_changes(history: &[PriceHistoryPoint], now: DateTime<Utc>) -> usize {
    let window_start = now - Duration::days(7);
    history
        .windows(2)
        .filter(|w| w[1].recorded_at >= window_start && (w[1].price - w[0].price).abs() >= 0.01)
        .count()
}

fn staleness_points(last_checked_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    match last_checked_at {
        None => 25.0,
        Some(at) => {
            let hours = (now - at).num_minutes().max(0) as f64 / 60.0;
            hours.min(25.0)
        }
    }
}

/// Re-check urgency in `[0, 100]`.
pub fn compute_priority(
    entity: &PropertyEntity,
    history: &[PriceHistoryPoint],
    now: DateTime<Utc>,
    config: &PriorityConfig,
    failures: &FailurePolicy,
) -> f64 {
    let recency = recency_points(entity.days_listed(now));
    let volatility = (recent_price_changes(history, now) as f64 * 10.0).min(25.0);
    let interest = (f64::from(entity.watcher_count) * 5.0).min(20.0);
    let staleness = staleness_points(entity.last_checked_at, now);

    let mut penalty = f64::from(entity.consecutive_failures) * config.per_failure_penalty;
    if entity.consecutive_failures >= failures.threshold {
        penalty += failures.penalty;
    }

    (recency + volatility + interest + staleness - penalty).clamp(0.0, 100.0)
}

/// Score to keep after a recompute. During a failure streak the score never
/// rises, and the threshold crossing keeps the score the lifecycle step already
/// lowered by the fixed penalty.
pub fn streak_bounded(entity: &PropertyEntity, computed: f64, crossed_failure_threshold: bool) -> f64 {
    if crossed_failure_threshold {
        entity.priority_score
    } else if entity.consecutive_failures > 0 {
        computed.min(entity.priority_score)
    } else {
        computed
    }
}

/// A recomputed score is written back when it moved far enough, or
/// unconditionally when the failure threshold was just crossed.
pub fn should_persist(
    stored: f64,
    computed: f64,
    crossed_failure_threshold: bool,
    config: &PriorityConfig,
) -> bool {
    crossed_failure_threshold || (computed - stored).abs() >= config.persist_delta
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckTier {
    pub max_checks_per_day: u32,
    pub min_interval: Duration,
}

pub fn check_tier(score: f64) -> CheckTier {
    let (max_checks_per_day, hours) = match score {
        s if s >= 80.0 => (12, 1),
        s if s >= 60.0 => (6, 2),
        s if s >= 40.0 => (4, 4),
        s if s >= 20.0 => (2, 8),
        _ => (1, 24),
    };
    CheckTier {
        max_checks_per_day,
        min_interval: Duration::hours(hours),
    }
}

pub fn should_check_now(
    score: f64,
    checks_today: u32,
    last_checked_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let tier = check_tier(score);
    if checks_today >= tier.max_checks_per_day {
        return false;
    }
    match last_checked_at {
        None => true,
        Some(at) => now - at >= tier.min_interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pmr_core::{ListingRecord, ListingType};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap()
    }

    fn entity(listed_days_ago: i64) -> PropertyEntity {
        let record = ListingRecord {
            source: "reality".into(),
            external_id: "r-1".into(),
            title: "byt".into(),
            price: 100_000.0,
            area_m2: 50.0,
            city: "Bratislava".into(),
            district: "Nové Mesto".into(),
            street: None,
            rooms: None,
            floor: None,
            condition: String::new(),
            listing_type: ListingType::Sale,
            source_url: "https://example.test/r-1".into(),
            description: None,
        };
        PropertyEntity::from_listing(&record, 0, now() - Duration::days(listed_days_ago))
    }

    fn point(price: f64, days_ago: i64) -> PriceHistoryPoint {
        PriceHistoryPoint {
            property_id: uuid::Uuid::nil(),
            price,
            price_per_m2: price / 50.0,
            recorded_at: now() - Duration::days(days_ago),
        }
    }

    #[test]
    fn new_unchecked_listing_scores_recency_plus_staleness() {
        let score = compute_priority(
            &entity(0),
            &[],
            now(),
            &PriorityConfig::default(),
            &FailurePolicy::default(),
        );
        assert_eq!(score, 55.0);
    }

    #[test]
    fn composite_sums_every_component() {
        let mut e = entity(5);
        e.watcher_count = 2;
        e.last_checked_at = Some(now() - Duration::hours(6));
        let history = vec![point(110_000.0, 20), point(105_000.0, 6), point(100_000.0, 2)];
        let score = compute_priority(&e, &history, now(), &PriorityConfig::default(), &FailurePolicy::default());
        // 20 recency + 20 volatility + 10 interest + 6 staleness
        assert_eq!(score, 56.0);
    }

    #[test]
    fn volatility_is_capped_and_windowed() {
        let history: Vec<_> = (0..6).map(|i| point(100_000.0 - i as f64 * 1_000.0, 6 - i)).collect();
        assert_eq!(recent_price_changes(&history, now()), 5);
        let old = vec![point(100_000.0, 30), point(90_000.0, 20)];
        assert_eq!(recent_price_changes(&old, now()), 0);
    }

    #[test]
    fn score_stays_in_bounds_and_falls_with_failures() {
        let config = PriorityConfig::default();
        let policy = FailurePolicy::default();
        let mut e = entity(0);
        e.watcher_count = 50;
        let history: Vec<_> = (0..10).map(|i| point(200_000.0 - i as f64 * 5_000.0, 1)).collect();
        assert_eq!(compute_priority(&e, &history, now(), &config, &policy), 100.0);

        let mut previous = f64::MAX;
        for failures in 0..12 {
            e.consecutive_failures = failures;
            e.last_checked_at = Some(now());
            let score = compute_priority(&e, &[], now(), &config, &policy);
            assert!((0.0..=100.0).contains(&score));
            assert!(score <= previous);
            previous = score;
        }
        assert_eq!(previous, 0.0);
    }

    #[test]
    fn failure_streak_caps_recomputed_score() {
        let mut e = entity(3);
        e.priority_score = 22.0;
        assert_eq!(streak_bounded(&e, 31.0, false), 31.0);

        e.consecutive_failures = 2;
        assert_eq!(streak_bounded(&e, 31.0, false), 22.0);
        assert_eq!(streak_bounded(&e, 12.0, false), 12.0);

        e.consecutive_failures = 5;
        e.priority_score = 2.0;
        assert_eq!(streak_bounded(&e, 0.0, true), 2.0);
    }

    #[test]
    fn persistence_needs_five_points_or_threshold_crossing() {
        let config = PriorityConfig::default();
        assert!(!should_persist(50.0, 54.9, false, &config));
        assert!(should_persist(50.0, 45.0, false, &config));
        assert!(should_persist(50.0, 48.0, true, &config));
    }

    #[test]
    fn tiers_gate_frequency_and_interval() {
        let last = Some(now() - Duration::minutes(90));
        assert!(should_check_now(85.0, 3, last, now()));
        assert!(!should_check_now(85.0, 12, last, now()));
        assert!(!should_check_now(65.0, 1, last, now()));
        assert!(should_check_now(65.0, 1, Some(now() - Duration::hours(2)), now()));
        assert!(!should_check_now(10.0, 1, None, now()));
        assert!(should_check_now(10.0, 0, None, now()));
    }
}
