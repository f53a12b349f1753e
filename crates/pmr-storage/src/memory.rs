use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pmr_core::{
    canonical_pair, BucketKey, Fingerprint, LifecycleRecord, MarketGapFlag, MatchEdge,
    PriceHistoryPoint, PropertyEntity, PropertyStatus, ReferencePrices, ReferenceQuery,
    ScanCursor, SourceKey,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{PropertyStore, StoreError, StoreResult};

#[derive(Debug, Default)]
struct MemoryState {
    properties: HashMap<Uuid, PropertyEntity>,
    fingerprints: HashMap<Uuid, Fingerprint>,
    edges: BTreeMap<(Uuid, Uuid), MatchEdge>,
    history: HashMap<Uuid, Vec<PriceHistoryPoint>>,
    lifecycle: BTreeMap<(SourceKey, u32), LifecycleRecord>,
    flags: HashMap<Uuid, MarketGapFlag>,
    cursors: BTreeMap<String, ScanCursor>,
    reset_marker: Option<NaiveDate>,
}

/// In-process store for tests and single-binary dev runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn same_text(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn candidate_order(a: &PropertyEntity, b: &PropertyEntity) -> Ordering {
    b.priority_score
        .partial_cmp(&a.priority_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| match (a.last_checked_at, b.last_checked_at) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        })
        .then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl PropertyStore for MemoryStore {
    async fn get_property(&self, id: Uuid) -> StoreResult<Option<PropertyEntity>> {
        Ok(self.state.lock().await.properties.get(&id).cloned())
    }

    async fn find_active_by_source_key(
        &self,
        key: &SourceKey,
    ) -> StoreResult<Option<PropertyEntity>> {
        let state = self.state.lock().await;
        Ok(state
            .properties
            .values()
            .filter(|p| p.status == PropertyStatus::Active)
            .find(|p| p.source == key.source && p.external_id == key.external_id)
            .cloned())
    }

    async fn latest_generation(&self, key: &SourceKey) -> StoreResult<Option<u32>> {
        let state = self.state.lock().await;
        Ok(state
            .properties
            .values()
            .filter(|p| p.source == key.source && p.external_id == key.external_id)
            .map(|p| p.generation)
            .max())
    }

    async fn upsert_property(&self, entity: &PropertyEntity) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.properties.get(&entity.id) {
            if existing.status.is_terminal() && !entity.status.is_terminal() {
                return Err(StoreError::TerminalReactivation {
                    id: entity.id,
                    status: existing.status,
                });
            }
        }
        state.properties.insert(entity.id, entity.clone());
        Ok(())
    }

    async fn list_active_properties(&self) -> StoreResult<Vec<PropertyEntity>> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .properties
            .values()
            .filter(|p| p.status == PropertyStatus::Active)
            .cloned()
            .collect();
        out.sort_by_key(|p| (p.created_at, p.id));
        Ok(out)
    }

    async fn fetch_check_candidates(&self, limit: usize) -> StoreResult<Vec<PropertyEntity>> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .properties
            .values()
            .filter(|p| p.status == PropertyStatus::Active)
            .cloned()
            .collect();
        out.sort_by(candidate_order);
        out.truncate(limit);
        Ok(out)
    }

    async fn update_priority_score(
        &self,
        id: Uuid,
        score: f64,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(entity) = state.properties.get_mut(&id) {
            entity.priority_score = score;
            entity.updated_at = at;
        }
        Ok(())
    }

    async fn reset_daily_counters(&self, today: NaiveDate) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if matches!(state.reset_marker, Some(marker) if marker >= today) {
            return Ok(false);
        }
        for entity in state.properties.values_mut() {
            entity.check_count_today = 0;
            entity.check_count_day = Some(today);
        }
        state.reset_marker = Some(today);
        Ok(true)
    }

    async fn daily_reset_marker(&self) -> StoreResult<Option<NaiveDate>> {
        Ok(self.state.lock().await.reset_marker)
    }

    async fn upsert_fingerprint(&self, fingerprint: &Fingerprint) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .fingerprints
            .insert(fingerprint.property_id, fingerprint.clone());
        Ok(())
    }

    async fn get_fingerprint(&self, property_id: Uuid) -> StoreResult<Option<Fingerprint>> {
        Ok(self.state.lock().await.fingerprints.get(&property_id).cloned())
    }

    async fn properties_without_fingerprint(&self) -> StoreResult<Vec<PropertyEntity>> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .properties
            .values()
            .filter(|p| !state.fingerprints.contains_key(&p.id))
            .cloned()
            .collect();
        out.sort_by_key(|p| (p.created_at, p.id));
        Ok(out)
    }

    async fn bucket_members(
        &self,
        key: &BucketKey,
    ) -> StoreResult<Vec<(PropertyEntity, Fingerprint)>> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .fingerprints
            .values()
            .filter(|fp| fp.city_district == key.city_district && fp.area_range == key.area_range)
            .filter_map(|fp| {
                state
                    .properties
                    .get(&fp.property_id)
                    .filter(|p| p.status == PropertyStatus::Active)
                    .map(|p| (p.clone(), fp.clone()))
            })
            .collect();
        out.sort_by_key(|(p, _)| p.id);
        Ok(out)
    }

    async fn upsert_match_edge(&self, edge: &MatchEdge) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let pair = canonical_pair(edge.primary_id, edge.matched_id);
        let mut stored = edge.clone();
        stored.primary_id = pair.0;
        stored.matched_id = pair.1;
        if let Some(existing) = state.edges.get(&pair) {
            stored.created_at = existing.created_at;
        }
        state.edges.insert(pair, stored);
        Ok(())
    }

    async fn get_match_edge(&self, a: Uuid, b: Uuid) -> StoreResult<Option<MatchEdge>> {
        Ok(self
            .state
            .lock()
            .await
            .edges
            .get(&canonical_pair(a, b))
            .cloned())
    }

    async fn match_edges_for(&self, property_id: Uuid) -> StoreResult<Vec<MatchEdge>> {
        let state = self.state.lock().await;
        Ok(state
            .edges
            .values()
            .filter(|e| e.involves(property_id))
            .cloned()
            .collect())
    }

    async fn list_match_edges(&self) -> StoreResult<Vec<MatchEdge>> {
        Ok(self.state.lock().await.edges.values().cloned().collect())
    }

    async fn active_properties_without_edges(&self) -> StoreResult<Vec<PropertyEntity>> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state
            .properties
            .values()
            .filter(|p| p.status == PropertyStatus::Active)
            .filter(|p| !state.edges.values().any(|e| e.involves(p.id)))
            .cloned()
            .collect();
        out.sort_by_key(|p| (p.created_at, p.id));
        Ok(out)
    }

    async fn append_price_point(&self, point: &PriceHistoryPoint) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let points = state.history.entry(point.property_id).or_default();
        points.push(point.clone());
        points.sort_by_key(|p| p.recorded_at);
        Ok(())
    }

    async fn price_history(&self, property_id: Uuid) -> StoreResult<Vec<PriceHistoryPoint>> {
        Ok(self
            .state
            .lock()
            .await
            .history
            .get(&property_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_lifecycle_record(&self, record: &LifecycleRecord) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let key = (record.source_key(), record.generation);
        let mut stored = record.clone();
        if let Some(existing) = state.lifecycle.get(&key) {
            stored.notified = existing.notified;
        }
        state.lifecycle.insert(key, stored);
        Ok(())
    }

    async fn get_lifecycle_record(
        &self,
        key: &SourceKey,
        generation: u32,
    ) -> StoreResult<Option<LifecycleRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .lifecycle
            .get(&(key.clone(), generation))
            .cloned())
    }

    async fn lifecycle_records_pending_notification(&self) -> StoreResult<Vec<LifecycleRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .lifecycle
            .values()
            .filter(|r| !r.notified)
            .cloned()
            .collect())
    }

    async fn mark_lifecycle_notified(&self, key: &SourceKey, generation: u32) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.lifecycle.get_mut(&(key.clone(), generation)) {
            record.notified = true;
        }
        Ok(())
    }

    async fn upsert_market_gap_flag(&self, flag: &MarketGapFlag) -> StoreResult<MarketGapFlag> {
        let mut state = self.state.lock().await;
        let mut stored = flag.clone();
        if let Some(existing) = state.flags.get(&flag.property_id) {
            stored.notified = existing.notified;
        }
        state.flags.insert(flag.property_id, stored.clone());
        Ok(stored)
    }

    async fn clear_market_gap_flag(&self, property_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.flags.get_mut(&property_id) {
            Some(flag) if flag.is_active() => {
                flag.cleared_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_market_gap_flag(&self, property_id: Uuid) -> StoreResult<Option<MarketGapFlag>> {
        Ok(self.state.lock().await.flags.get(&property_id).cloned())
    }

    async fn list_market_gap_flags(&self) -> StoreResult<Vec<MarketGapFlag>> {
        let state = self.state.lock().await;
        let mut out: Vec<_> = state.flags.values().cloned().collect();
        out.sort_by(|a, b| {
            b.gap_percentage
                .partial_cmp(&a.gap_percentage)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.property_id.cmp(&b.property_id))
        });
        Ok(out)
    }

    async fn mark_flag_notified(&self, property_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(flag) = state.flags.get_mut(&property_id) {
            flag.notified = true;
        }
        Ok(())
    }

    async fn locality_reference(&self, query: &ReferenceQuery) -> StoreResult<ReferencePrices> {
        let state = self.state.lock().await;
        let comparables: Vec<&PropertyEntity> = state
            .properties
            .values()
            .filter(|p| p.status == PropertyStatus::Active)
            .filter(|p| p.listing_type == query.listing_type && p.price_per_m2 > 0.0)
            .filter(|p| Some(p.id) != query.exclude_property_id)
            .filter(|p| same_text(&p.city, &query.city) && same_text(&p.district, &query.district))
            .collect();

        let district: Vec<f64> = comparables.iter().map(|p| p.price_per_m2).collect();
        let street: Vec<f64> = match &query.street {
            Some(street) => comparables
                .iter()
                .filter(|p| p.street.as_deref().is_some_and(|s| same_text(s, street)))
                .map(|p| p.price_per_m2)
                .collect(),
            None => Vec::new(),
        };

        Ok(ReferencePrices {
            street_avg: average(&street),
            street_count: street.len() as u32,
            district_avg: average(&district),
            district_count: district.len() as u32,
        })
    }

    async fn get_scan_cursor(&self, source: &str) -> StoreResult<Option<ScanCursor>> {
        Ok(self.state.lock().await.cursors.get(source).cloned())
    }

    async fn save_scan_cursor(&self, cursor: &ScanCursor) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.cursors.insert(cursor.source.clone(), cursor.clone());
        Ok(())
    }

    async fn list_scan_cursors(&self) -> StoreResult<Vec<ScanCursor>> {
        Ok(self.state.lock().await.cursors.values().cloned().collect())
    }
}
