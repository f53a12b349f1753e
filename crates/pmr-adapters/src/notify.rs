use std::sync::Arc;

use async_trait::async_trait;
use pmr_core::{LifecycleRecord, MarketGapFlag, PropertyEntity};
use pmr_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::AdapterError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySummary {
    pub id: Uuid,
    pub source: String,
    pub title: String,
    pub source_url: String,
    pub city: String,
    pub district: String,
    pub street: Option<String>,
    pub price: f64,
    pub price_per_m2: f64,
    pub area_m2: f64,
}

impl From<&PropertyEntity> for PropertySummary {
    fn from(entity: &PropertyEntity) -> Self {
        Self {
            id: entity.id,
            source: entity.source.clone(),
            title: entity.title.clone(),
            source_url: entity.source_url.clone(),
            city: entity.city.clone(),
            district: entity.district.clone(),
            street: entity.street.clone(),
            price: entity.price,
            price_per_m2: entity.price_per_m2,
            area_m2: entity.area_m2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationEvent {
    MarketGap {
        flag: MarketGapFlag,
        property: PropertySummary,
    },
    Lifecycle {
        record: LifecycleRecord,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MarketGap { .. } => "market_gap",
            Self::Lifecycle { .. } => "lifecycle",
        }
    }
}

/// Delivers pipeline events to users. Callers mark records notified only after `Ok`.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), AdapterError> {
        match event {
            NotificationEvent::MarketGap { flag, property } => info!(
                property_id = %property.id,
                gap_percentage = flag.gap_percentage,
                confidence = %flag.confidence,
                potential_profit = flag.potential_profit,
                url = %property.source_url,
                "market gap"
            ),
            NotificationEvent::Lifecycle { record } => info!(
                property_id = %record.property_id,
                status = %record.final_status,
                days_on_market = record.days_on_market,
                final_price = record.final_price,
                "listing closed"
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    http: Arc<HttpFetcher>,
    url: String,
    run_id: Uuid,
}

impl WebhookNotifier {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            http,
            url: url.into(),
            run_id,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), AdapterError> {
        let body = serde_json::to_value(event)
            .map_err(|e| AdapterError::Message(format!("encoding {} event: {e}", event.kind())))?;
        self.http
            .post_json(self.run_id, "webhook", &self.url, &body)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pmr_core::PropertyStatus;

    #[test]
    fn events_are_tagged_by_kind() {
        let record = LifecycleRecord {
            source: "reality".into(),
            external_id: "r-9".into(),
            generation: 0,
            property_id: Uuid::nil(),
            initial_price: 150_000.0,
            final_price: 142_000.0,
            days_on_market: 41,
            removal_reason: Some("sold: predané".into()),
            final_status: PropertyStatus::Sold,
            closed_at: Utc.with_ymd_and_hms(2026, 4, 2, 10, 0, 0).single().unwrap(),
            notified: false,
        };
        let event = NotificationEvent::Lifecycle { record };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "lifecycle");
        assert_eq!(json["record"]["final_status"], "SOLD");
        assert_eq!(event.kind(), "lifecycle");
    }
}
