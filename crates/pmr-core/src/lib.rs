//! Core domain model for PMR: scraped listings, canonical properties and the
//! records derived from them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pmr-core";

/// Namespace for deterministic property ids derived from `(source, external_id, generation)`.
const PROPERTY_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5f1d_2c7e_8a43_4b6f_9e0d_71c3_a2b4_e816);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown {kind} value `{value}`")]
    UnknownVariant { kind: &'static str, value: String },
    #[error("a match edge cannot link property {0} to itself")]
    SelfEdge(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingType {
    Sale,
    Rent,
}

impl ListingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sale => "sale",
            Self::Rent => "rent",
        }
    }
}

impl FromStr for ListingType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sale" => Ok(Self::Sale),
            "rent" => Ok(Self::Rent),
            other => Err(CoreError::UnknownVariant {
                kind: "listing type",
                value: other.to_string(),
            }),
        }
    }
}

/// Normalized handoff contract from source adapters into ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub source: String,
    pub external_id: String,
    pub title: String,
    /// Zero means "price on request".
    pub price: f64,
    pub area_m2: f64,
    pub city: String,
    pub district: String,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub rooms: Option<u32>,
    #[serde(default)]
    pub floor: Option<i32>,
    #[serde(default)]
    pub condition: String,
    pub listing_type: ListingType,
    pub source_url: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PropertyStatus {
    Active,
    Sold,
    Removed,
}

impl PropertyStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sold | Self::Removed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Sold => "SOLD",
            Self::Removed => "REMOVED",
        }
    }
}

impl fmt::Display for PropertyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "SOLD" => Ok(Self::Sold),
            "REMOVED" => Ok(Self::Removed),
            other => Err(CoreError::UnknownVariant {
                kind: "property status",
                value: other.to_string(),
            }),
        }
    }
}

/// Natural identity of a listing on its portal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub source: String,
    pub external_id: String,
}

impl SourceKey {
    pub fn new(source: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.external_id)
    }
}

/// Canonical, long-lived record of one physical property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyEntity {
    pub id: Uuid,
    pub source: String,
    pub external_id: String,
    /// Incremented each time a closed `(source, external_id)` reappears as a new listing.
    pub generation: u32,
    pub source_url: String,
    pub title: String,
    pub description: Option<String>,
    pub price: f64,
    pub price_per_m2: f64,
    pub area_m2: f64,
    pub city: String,
    pub district: String,
    pub street: Option<String>,
    pub rooms: Option<u32>,
    pub floor: Option<i32>,
    pub condition: String,
    pub listing_type: ListingType,
    pub status: PropertyStatus,
    pub priority_score: f64,
    pub check_count_today: u32,
    /// Day bucket `check_count_today` belongs to.
    pub check_count_day: Option<NaiveDate>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub days_on_market: u32,
    pub first_listed_at: DateTime<Utc>,
    /// Users tracking this property; maintained outside the pipeline.
    pub watcher_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PropertyEntity {
    pub fn deterministic_id(source: &str, external_id: &str, generation: u32) -> Uuid {
        let name = format!("{source}:{external_id}:{generation}");
        Uuid::new_v5(&PROPERTY_ID_NAMESPACE, name.as_bytes())
    }

    pub fn from_listing(record: &ListingRecord, generation: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Self::deterministic_id(&record.source, &record.external_id, generation),
            source: record.source.clone(),
            external_id: record.external_id.clone(),
            generation,
            source_url: record.source_url.clone(),
            title: record.title.clone(),
            description: record.description.clone(),
            price: record.price,
            price_per_m2: price_per_m2(record.price, record.area_m2),
            area_m2: record.area_m2,
            city: record.city.clone(),
            district: record.district.clone(),
            street: record.street.clone(),
            rooms: record.rooms,
            floor: record.floor,
            condition: record.condition.clone(),
            listing_type: record.listing_type,
            status: PropertyStatus::Active,
            priority_score: 50.0,
            check_count_today: 0,
            check_count_day: None,
            last_checked_at: None,
            last_seen_at: now,
            consecutive_failures: 0,
            days_on_market: 0,
            first_listed_at: now,
            watcher_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn source_key(&self) -> SourceKey {
        SourceKey::new(&self.source, &self.external_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Checks performed on `today`; a counter left over from an earlier day reads as zero.
    pub fn checks_today(&self, today: NaiveDate) -> u32 {
        match self.check_count_day {
            Some(day) if day == today => self.check_count_today,
            _ => 0,
        }
    }

    pub fn days_listed(&self, now: DateTime<Utc>) -> u32 {
        (now - self.first_listed_at).num_days().max(0) as u32
    }
}

/// Unit price rounded to cents, or 0 when either side is unknown.
pub fn price_per_m2(price: f64, area_m2: f64) -> f64 {
    if price > 0.0 && area_m2 > 0.0 {
        (price / area_m2 * 100.0).round() / 100.0
    } else {
        0.0
    }
}

/// Whether a removal reason reported by a portal means the property was sold.
pub fn removal_reason_indicates_sale(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    ["sold", "predan", "prodan", "sale_completed", "reserved_sold"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Normalized, bucketed summary of a property used for candidate retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub property_id: Uuid,
    pub normalized_address: String,
    pub city_district: String,
    pub area_range: String,
    pub price_range: Option<String>,
    pub rooms_range: Option<String>,
    pub floor_range: Option<String>,
    pub normalized_title: String,
    pub description_hash: Option<String>,
    pub computed_at: DateTime<Utc>,
}

impl Fingerprint {
    pub fn bucket_key(&self) -> BucketKey {
        BucketKey {
            city_district: self.city_district.clone(),
            area_range: self.area_range.clone(),
        }
    }

    /// Equality over every signal, ignoring when it was computed.
    pub fn same_signals(&self, other: &Fingerprint) -> bool {
        self.property_id == other.property_id
            && self.normalized_address == other.normalized_address
            && self.city_district == other.city_district
            && self.area_range == other.area_range
            && self.price_range == other.price_range
            && self.rooms_range == other.rooms_range
            && self.floor_range == other.floor_range
            && self.normalized_title == other.normalized_title
            && self.description_hash == other.description_hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub city_district: String,
    pub area_range: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Confidence {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => Err(CoreError::UnknownVariant {
                kind: "confidence",
                value: other.to_string(),
            }),
        }
    }
}

/// Orders a pair so the smaller id comes first.
pub fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Scored link between two canonical properties, stored with `primary_id < matched_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEdge {
    pub primary_id: Uuid,
    pub matched_id: Uuid,
    pub score: u8,
    pub confidence: Confidence,
    pub reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MatchEdge {
    pub fn new(
        a: Uuid,
        b: Uuid,
        score: u8,
        confidence: Confidence,
        reasons: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        if a == b {
            return Err(CoreError::SelfEdge(a));
        }
        let (primary_id, matched_id) = canonical_pair(a, b);
        Ok(Self {
            primary_id,
            matched_id,
            score: score.min(100),
            confidence,
            reasons,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn pair(&self) -> (Uuid, Uuid) {
        (self.primary_id, self.matched_id)
    }

    pub fn involves(&self, id: Uuid) -> bool {
        self.primary_id == id || self.matched_id == id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryPoint {
    pub property_id: Uuid,
    pub price: f64,
    pub price_per_m2: f64,
    pub recorded_at: DateTime<Utc>,
}

impl PriceHistoryPoint {
    pub fn for_property(entity: &PropertyEntity, recorded_at: DateTime<Utc>) -> Self {
        Self {
            property_id: entity.id,
            price: entity.price,
            price_per_m2: entity.price_per_m2,
            recorded_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceLevel {
    Street,
    District,
}

impl ReferenceLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Street => "STREET",
            Self::District => "DISTRICT",
        }
    }
}

impl FromStr for ReferenceLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STREET" => Ok(Self::Street),
            "DISTRICT" => Ok(Self::District),
            other => Err(CoreError::UnknownVariant {
                kind: "reference level",
                value: other.to_string(),
            }),
        }
    }
}

/// Listing priced below its locality reference; one per property.
///
/// A flag that stops qualifying is cleared, not deleted, so `notified`
/// survives the gap closing and reopening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketGapFlag {
    pub property_id: Uuid,
    pub gap_percentage: f64,
    pub reference_price: f64,
    pub reference_level: ReferenceLevel,
    pub comparable_count: u32,
    pub confidence: Confidence,
    pub potential_profit: f64,
    pub notified: bool,
    pub computed_at: DateTime<Utc>,
    #[serde(default)]
    pub cleared_at: Option<DateTime<Utc>>,
}

impl MarketGapFlag {
    pub fn is_active(&self) -> bool {
        self.cleared_at.is_none()
    }
}

/// Terminal summary of a listing, keyed by `(source, external_id, generation)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub source: String,
    pub external_id: String,
    pub generation: u32,
    pub property_id: Uuid,
    pub initial_price: f64,
    pub final_price: f64,
    pub days_on_market: u32,
    pub removal_reason: Option<String>,
    pub final_status: PropertyStatus,
    pub closed_at: DateTime<Utc>,
    pub notified: bool,
}

impl LifecycleRecord {
    pub fn source_key(&self) -> SourceKey {
        SourceKey::new(&self.source, &self.external_id)
    }
}

/// Resumable position of the exhaustive crawl over one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub source: String,
    pub category_index: u32,
    /// 1-based page within the current category.
    pub page: u32,
    pub cycle_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl ScanCursor {
    pub fn start(source: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            category_index: 0,
            page: 1,
            cycle_count: 0,
            updated_at: now,
        }
    }

    /// Next position after the current page was fetched.
    ///
    /// An empty page ends its category; leaving the last category wraps to the
    /// first one and completes a cycle. `updated_at` is left to the caller.
    pub fn advance(&self, category_count: u32, page_was_empty: bool) -> ScanCursor {
        let category_count = category_count.max(1);
        let mut next = self.clone();
        if self.category_index >= category_count {
            next.category_index = 0;
            next.page = 1;
            next.cycle_count += 1;
            return next;
        }
        if !page_was_empty {
            next.page += 1;
            return next;
        }
        next.page = 1;
        if self.category_index + 1 >= category_count {
            next.category_index = 0;
            next.cycle_count += 1;
        } else {
            next.category_index += 1;
        }
        next
    }
}

/// Input handed to the health-check collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckRequest {
    pub property_id: Uuid,
    pub source_url: String,
    pub source: String,
    pub price: f64,
}

impl HealthCheckRequest {
    pub fn for_property(entity: &PropertyEntity) -> Self {
        Self {
            property_id: entity.id,
            source_url: entity.source_url.clone(),
            source: entity.source.clone(),
            price: entity.price,
        }
    }
}

/// Raw answer of the health-check collaborator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub is_active: bool,
    pub removal_reason: Option<String>,
    pub price_changed: bool,
    pub new_price: Option<f64>,
    pub error: Option<String>,
}

impl HealthCheckResponse {
    pub fn unchanged() -> Self {
        Self {
            is_active: true,
            ..Default::default()
        }
    }

    pub fn inactive(reason: impl Into<String>) -> Self {
        Self {
            is_active: false,
            removal_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn price_changed(new_price: f64) -> Self {
        Self {
            is_active: true,
            price_changed: true,
            new_price: Some(new_price),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            is_active: true,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Classified health-check outcome driving the lifecycle state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthOutcome {
    Inactive { removal_reason: Option<String> },
    PriceChanged { new_price: f64 },
    CheckError { message: String },
    Unchanged,
}

impl From<HealthCheckResponse> for HealthOutcome {
    fn from(resp: HealthCheckResponse) -> Self {
        if let Some(message) = resp.error {
            return Self::CheckError { message };
        }
        if !resp.is_active {
            return Self::Inactive {
                removal_reason: resp.removal_reason,
            };
        }
        match resp.new_price {
            Some(new_price) if resp.price_changed && new_price > 0.0 => {
                Self::PriceChanged { new_price }
            }
            _ => Self::Unchanged,
        }
    }
}

impl HealthOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Inactive { .. } => "inactive",
            Self::PriceChanged { .. } => "price_changed",
            Self::CheckError { .. } => "check_error",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Locality lookup passed to the reference-price collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceQuery {
    pub city: String,
    pub district: String,
    pub street: Option<String>,
    pub listing_type: ListingType,
    /// Property whose own price must not count toward its reference.
    pub exclude_property_id: Option<Uuid>,
}

impl ReferenceQuery {
    pub fn for_property(entity: &PropertyEntity) -> Self {
        Self {
            city: entity.city.clone(),
            district: entity.district.clone(),
            street: entity.street.clone(),
            listing_type: entity.listing_type,
            exclude_property_id: Some(entity.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReferencePrices {
    pub street_avg: Option<f64>,
    pub street_count: u32,
    pub district_avg: Option<f64>,
    pub district_count: u32,
}
