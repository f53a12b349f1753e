//! Cross-source candidate matching within fingerprint buckets.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pmr_core::{canonical_pair, Confidence, Fingerprint, MatchEdge, PropertyEntity};
use pmr_storage::{PropertyStore, StoreResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::fingerprint::{fingerprint_for, normalize_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub min_score: u8,
    pub high_score: u8,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            min_score: 70,
            high_score: 80,
        }
    }
}

/// One side of a scored pair.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub entity: &'a PropertyEntity,
    pub fingerprint: &'a Fingerprint,
}

/// A named comparison contributing `(points, reason)` when it fires.
pub struct ScoringRule {
    pub name: &'static str,
    /// Firing counts as address-level corroboration for HIGH confidence.
    pub address_signal: bool,
    pub eval: fn(&Candidate<'_>, &Candidate<'_>) -> Option<(f64, String)>,
}

pub const CITY_DISTRICT_POINTS: f64 = 20.0;

/// Evaluated in order after the same-source and locality gates.
pub const SCORING_RULES: &[ScoringRule] = &[
    ScoringRule {
        name: "area",
        address_signal: false,
        eval: area_rule,
    },
    ScoringRule {
        name: "price",
        address_signal: false,
        eval: price_rule,
    },
    ScoringRule {
        name: "rooms",
        address_signal: false,
        eval: rooms_rule,
    },
    ScoringRule {
        name: "floor",
        address_signal: false,
        eval: floor_rule,
    },
    ScoringRule {
        name: "street",
        address_signal: true,
        eval: street_rule,
    },
    ScoringRule {
        name: "address_similarity",
        address_signal: true,
        eval: address_similarity_rule,
    },
    ScoringRule {
        name: "title_similarity",
        address_signal: false,
        eval: title_similarity_rule,
    },
    ScoringRule {
        name: "description_hash",
        address_signal: true,
        eval: description_hash_rule,
    },
];

fn relative_difference(a: f64, b: f64) -> Option<f64> {
    let larger = a.max(b);
    if a <= 0.0 || b <= 0.0 || larger <= 0.0 {
        return None;
    }
    Some((a - b).abs() / larger)
}

fn tolerance_tier(diff: f64) -> Option<(f64, u8)> {
    if diff <= 0.02 {
        Some((25.0, 2))
    } else if diff <= 0.05 {
        Some((18.0, 5))
    } else if diff <= 0.10 {
        Some((10.0, 10))
    } else {
        None
    }
}

fn area_rule(a: &Candidate<'_>, b: &Candidate<'_>) -> Option<(f64, String)> {
    let diff = relative_difference(a.entity.area_m2, b.entity.area_m2)?;
    let (points, pct) = tolerance_tier(diff)?;
    Some((points, format!("area within {pct}%")))
}

/// Skipped entirely when either side is priced on request.
fn price_rule(a: &Candidate<'_>, b: &Candidate<'_>) -> Option<(f64, String)> {
    let diff = relative_difference(a.entity.price, b.entity.price)?;
    let (points, pct) = tolerance_tier(diff)?;
    Some((points, format!("price within {pct}%")))
}

fn rooms_rule(a: &Candidate<'_>, b: &Candidate<'_>) -> Option<(f64, String)> {
    match (a.entity.rooms, b.entity.rooms) {
        (Some(x), Some(y)) if x == y => Some((10.0, "same room count".into())),
        _ => None,
    }
}

fn floor_rule(a: &Candidate<'_>, b: &Candidate<'_>) -> Option<(f64, String)> {
    match (a.entity.floor, b.entity.floor) {
        (Some(x), Some(y)) if x == y => Some((5.0, "same floor".into())),
        _ => None,
    }
}

fn street_rule(a: &Candidate<'_>, b: &Candidate<'_>) -> Option<(f64, String)> {
    let x = normalize_text(a.entity.street.as_deref()?);
    let y = normalize_text(b.entity.street.as_deref()?);
    if x.is_empty() || y.is_empty() {
        return None;
    }
    if x == y {
        Some((10.0, "same street".into()))
    } else if x.contains(&y) || y.contains(&x) {
        Some((6.0, "street substring".into()))
    } else {
        None
    }
}

/// Token-set Jaccard similarity; two empty sets are not similar.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let left: BTreeSet<&str> = a.split_whitespace().collect();
    let right: BTreeSet<&str> = b.split_whitespace().collect();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(&right).count() as f64;
    let union = left.union(&right).count() as f64;
    intersection / union
}

fn similarity_points(j: f64, high_weight: f64, low_weight: f64) -> Option<f64> {
    if j > 0.8 {
        Some(high_weight * j)
    } else if j > 0.6 {
        Some(low_weight * j)
    } else {
        None
    }
}

fn address_similarity_rule(a: &Candidate<'_>, b: &Candidate<'_>) -> Option<(f64, String)> {
    let j = jaccard(&a.fingerprint.normalized_address, &b.fingerprint.normalized_address);
    let points = similarity_points(j, 12.0, 6.0)?;
    Some((points, format!("address similarity {j:.2}")))
}

fn title_similarity_rule(a: &Candidate<'_>, b: &Candidate<'_>) -> Option<(f64, String)> {
    let j = jaccard(&a.fingerprint.normalized_title, &b.fingerprint.normalized_title);
    let points = similarity_points(j, 10.0, 5.0)?;
    Some((points, format!("title similarity {j:.2}")))
}

fn description_hash_rule(a: &Candidate<'_>, b: &Candidate<'_>) -> Option<(f64, String)> {
    match (&a.fingerprint.description_hash, &b.fingerprint.description_hash) {
        (Some(x), Some(y)) if x == y => Some((30.0, "identical description".into())),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairScore {
    pub score: u8,
    pub reasons: Vec<String>,
    pub address_corroborated: bool,
}

impl PairScore {
    fn rejected(reason: &str) -> Self {
        Self {
            score: 0,
            reasons: vec![reason.to_string()],
            address_corroborated: false,
        }
    }
}

pub fn score_pair(a: &Candidate<'_>, b: &Candidate<'_>) -> PairScore {
    if a.entity.source == b.entity.source {
        return PairScore::rejected("same source");
    }
    if a.fingerprint.city_district != b.fingerprint.city_district {
        return PairScore::rejected("different locality");
    }

    let mut total = CITY_DISTRICT_POINTS;
    let mut reasons = vec!["same city and district".to_string()];
    let mut address_corroborated = false;
    for rule in SCORING_RULES {
        if let Some((points, reason)) = (rule.eval)(a, b) {
            total += points;
            reasons.push(reason);
            address_corroborated |= rule.address_signal;
        }
    }

    PairScore {
        score: total.round().clamp(0.0, 100.0) as u8,
        reasons,
        address_corroborated,
    }
}

pub fn confidence_for(score: &PairScore, config: &MatcherConfig) -> Option<Confidence> {
    if score.score >= config.high_score && score.address_corroborated {
        Some(Confidence::High)
    } else if score.score >= config.min_score {
        Some(Confidence::Medium)
    } else {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MatchOutcome {
    pub compared: usize,
    pub edges_written: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub fingerprinted: usize,
    pub entities_scored: usize,
    pub pairs_scored: usize,
    pub edges_written: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct MatchEngine {
    store: Arc<dyn PropertyStore>,
    config: MatcherConfig,
}

impl MatchEngine {
    pub fn new(store: Arc<dyn PropertyStore>, config: MatcherConfig) -> Self {
        Self { store, config }
    }

    /// Stored fingerprint for `entity`, recomputed and written when its signals changed.
    pub async fn ensure_fingerprint(
        &self,
        entity: &PropertyEntity,
        now: DateTime<Utc>,
    ) -> StoreResult<Fingerprint> {
        let fresh = fingerprint_for(entity, now);
        match self.store.get_fingerprint(entity.id).await? {
            Some(existing) if existing.same_signals(&fresh) => Ok(existing),
            _ => {
                self.store.upsert_fingerprint(&fresh).await?;
                Ok(fresh)
            }
        }
    }

    pub async fn match_entity(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<MatchOutcome> {
        let mut seen = HashSet::new();
        self.match_entity_tracked(id, now, &mut seen).await
    }

    async fn match_entity_tracked(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        seen: &mut HashSet<(Uuid, Uuid)>,
    ) -> StoreResult<MatchOutcome> {
        let mut outcome = MatchOutcome::default();
        let Some(entity) = self.store.get_property(id).await? else {
            return Ok(outcome);
        };
        if entity.is_terminal() {
            return Ok(outcome);
        }
        let fingerprint = self.ensure_fingerprint(&entity, now).await?;
        let subject = Candidate {
            entity: &entity,
            fingerprint: &fingerprint,
        };

        for (other, other_fp) in self.store.bucket_members(&fingerprint.bucket_key()).await? {
            if other.id == entity.id || !seen.insert(canonical_pair(entity.id, other.id)) {
                continue;
            }
            outcome.compared += 1;
            let candidate = Candidate {
                entity: &other,
                fingerprint: &other_fp,
            };
            let score = score_pair(&subject, &candidate);
            let Some(confidence) = confidence_for(&score, &self.config) else {
                continue;
            };
            if self.write_edge(entity.id, other.id, score, confidence, now).await? {
                outcome.edges_written += 1;
            }
        }
        Ok(outcome)
    }

    /// Returns false when an identical edge already exists.
    async fn write_edge(
        &self,
        a: Uuid,
        b: Uuid,
        score: PairScore,
        confidence: Confidence,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let edge = MatchEdge::new(a, b, score.score, confidence, score.reasons, now)?;
        if let Some(existing) = self.store.get_match_edge(a, b).await? {
            if existing.score == edge.score
                && existing.confidence == edge.confidence
                && existing.reasons == edge.reasons
            {
                return Ok(false);
            }
        }
        debug!(primary = %edge.primary_id, matched = %edge.matched_id, score = edge.score, "match edge");
        self.store.upsert_match_edge(&edge).await?;
        Ok(true)
    }

    /// Full-corpus pass: fingerprint what lacks one, then score every active
    /// property without edges against its bucket.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileSummary> {
        let span = info_span!("reconcile");
        async move {
            let mut summary = ReconcileSummary::default();

            let missing = self
                .store
                .properties_without_fingerprint()
                .await
                .context("listing properties without fingerprint")?;
            for entity in &missing {
                match self.store.upsert_fingerprint(&fingerprint_for(entity, now)).await {
                    Ok(()) => summary.fingerprinted += 1,
                    Err(err) => {
                        summary.errors += 1;
                        warn!(property_id = %entity.id, error = %err, "fingerprint failed");
                    }
                }
            }

            let unmatched = self
                .store
                .active_properties_without_edges()
                .await
                .context("listing properties without edges")?;
            let mut seen = HashSet::new();
            for entity in &unmatched {
                match self.match_entity_tracked(entity.id, now, &mut seen).await {
                    Ok(outcome) => {
                        summary.entities_scored += 1;
                        summary.pairs_scored += outcome.compared;
                        summary.edges_written += outcome.edges_written;
                    }
                    Err(err) => {
                        summary.errors += 1;
                        warn!(property_id = %entity.id, error = %err, "matching failed");
                    }
                }
            }

            info!(
                fingerprinted = summary.fingerprinted,
                scored = summary.entities_scored,
                edges = summary.edges_written,
                errors = summary.errors,
                "reconcile finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}
