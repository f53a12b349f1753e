use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pmr_core::{price_per_m2, ListingRecord, PriceHistoryPoint, PropertyEntity, SourceKey};
use pmr_storage::PropertyStore;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::matcher::MatchEngine;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub property_id: Uuid,
    pub created: bool,
    pub generation: u32,
    pub price_recorded: bool,
    pub edges_written: usize,
}

/// Resolves scraped listings onto canonical properties.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn PropertyStore>,
    matcher: MatchEngine,
}

fn refresh_attributes(entity: &mut PropertyEntity, record: &ListingRecord) -> bool {
    let before = entity.clone();
    entity.source_url = record.source_url.clone();
    entity.title = record.title.clone();
    entity.description = record.description.clone();
    entity.price = record.price;
    entity.area_m2 = record.area_m2;
    entity.price_per_m2 = price_per_m2(record.price, record.area_m2);
    entity.city = record.city.clone();
    entity.district = record.district.clone();
    entity.street = record.street.clone();
    entity.rooms = record.rooms;
    entity.floor = record.floor;
    entity.condition = record.condition.clone();
    entity.listing_type = record.listing_type;
    *entity != before
}

impl Ingestor {
    pub fn new(store: Arc<dyn PropertyStore>, matcher: MatchEngine) -> Self {
        Self { store, matcher }
    }

    /// Idempotent: ingesting the same record twice leaves one property, one
    /// price point and the same edges.
    pub async fn ingest(&self, record: &ListingRecord, now: DateTime<Utc>) -> Result<IngestOutcome> {
        let key = SourceKey::new(&record.source, &record.external_id);
        let existing = self
            .store
            .find_active_by_source_key(&key)
            .await
            .with_context(|| format!("looking up {key}"))?;

        let (entity, created) = match existing {
            Some(mut entity) => {
                if refresh_attributes(&mut entity, record) {
                    entity.updated_at = now;
                }
                entity.last_seen_at = now;
                entity.days_on_market = entity.days_listed(now);
                (entity, false)
            }
            None => {
                // A closed listing that reappears starts a new generation.
                let generation = self
                    .store
                    .latest_generation(&key)
                    .await?
                    .map_or(0, |g| g + 1);
                (PropertyEntity::from_listing(record, generation, now), true)
            }
        };
        self.store
            .upsert_property(&entity)
            .await
            .with_context(|| format!("storing {key}"))?;

        let history = self.store.price_history(entity.id).await?;
        let price_recorded = match history.last() {
            Some(last) if (last.price - entity.price).abs() < 0.01 => false,
            _ => {
                self.store
                    .append_price_point(&PriceHistoryPoint::for_property(&entity, now))
                    .await?;
                true
            }
        };

        self.matcher.ensure_fingerprint(&entity, now).await?;
        let matched = self.matcher.match_entity(entity.id, now).await?;
        debug!(listing = %key, property_id = %entity.id, created, edges = matched.edges_written, "ingested");

        Ok(IngestOutcome {
            property_id: entity.id,
            created,
            generation: entity.generation,
            price_recorded,
            edges_written: matched.edges_written,
        })
    }
}
