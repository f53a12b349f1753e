use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pmr_core::{
    BucketKey, CoreError, Fingerprint, LifecycleRecord, MarketGapFlag, MatchEdge,
    PriceHistoryPoint, PropertyEntity, PropertyStatus, ReferencePrices, ReferenceQuery,
    ScanCursor, SourceKey,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt stored value: {0}")]
    Decode(#[from] CoreError),
    #[error("property {id} is {status}; terminal properties cannot be re-activated")]
    TerminalReactivation { id: Uuid, status: PropertyStatus },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The canonical property store shared by every pipeline stage.
///
/// Every mutation is an upsert keyed by a natural identifier, so a retried or
/// overlapping stage converges on the same end state.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    async fn get_property(&self, id: Uuid) -> StoreResult<Option<PropertyEntity>>;

    async fn find_active_by_source_key(&self, key: &SourceKey)
        -> StoreResult<Option<PropertyEntity>>;

    /// Highest generation ever stored for `key`, active or closed.
    async fn latest_generation(&self, key: &SourceKey) -> StoreResult<Option<u32>>;

    /// Upsert by id. Fails with [`StoreError::TerminalReactivation`] when the
    /// stored row is SOLD/REMOVED and `entity` is ACTIVE.
    async fn upsert_property(&self, entity: &PropertyEntity) -> StoreResult<()>;

    async fn list_active_properties(&self) -> StoreResult<Vec<PropertyEntity>>;

    /// Active properties ordered by `priority_score desc, last_checked_at asc`
    /// (never-checked first).
    async fn fetch_check_candidates(&self, limit: usize) -> StoreResult<Vec<PropertyEntity>>;

    async fn update_priority_score(
        &self,
        id: Uuid,
        score: f64,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Zeroes every daily check counter unless the persisted marker already
    /// equals or follows `today`. Returns whether a reset happened.
    async fn reset_daily_counters(&self, today: NaiveDate) -> StoreResult<bool>;

    async fn daily_reset_marker(&self) -> StoreResult<Option<NaiveDate>>;

    async fn upsert_fingerprint(&self, fingerprint: &Fingerprint) -> StoreResult<()>;

    async fn get_fingerprint(&self, property_id: Uuid) -> StoreResult<Option<Fingerprint>>;

    async fn properties_without_fingerprint(&self) -> StoreResult<Vec<PropertyEntity>>;

    /// Active properties whose fingerprint falls into `key`.
    async fn bucket_members(
        &self,
        key: &BucketKey,
    ) -> StoreResult<Vec<(PropertyEntity, Fingerprint)>>;

    /// Upsert by canonical pair, keeping the original `created_at`.
    async fn upsert_match_edge(&self, edge: &MatchEdge) -> StoreResult<()>;

    async fn get_match_edge(&self, a: Uuid, b: Uuid) -> StoreResult<Option<MatchEdge>>;

    async fn match_edges_for(&self, property_id: Uuid) -> StoreResult<Vec<MatchEdge>>;

    async fn list_match_edges(&self) -> StoreResult<Vec<MatchEdge>>;

    async fn active_properties_without_edges(&self) -> StoreResult<Vec<PropertyEntity>>;

    async fn append_price_point(&self, point: &PriceHistoryPoint) -> StoreResult<()>;

    /// Oldest first.
    async fn price_history(&self, property_id: Uuid) -> StoreResult<Vec<PriceHistoryPoint>>;

    /// Upsert by `(source, external_id, generation)`, keeping `notified`.
    async fn upsert_lifecycle_record(&self, record: &LifecycleRecord) -> StoreResult<()>;

    async fn get_lifecycle_record(
        &self,
        key: &SourceKey,
        generation: u32,
    ) -> StoreResult<Option<LifecycleRecord>>;

    async fn lifecycle_records_pending_notification(&self) -> StoreResult<Vec<LifecycleRecord>>;

    async fn mark_lifecycle_notified(&self, key: &SourceKey, generation: u32) -> StoreResult<()>;

    /// Upsert by property id, keeping `notified`. Returns the stored flag.
    async fn upsert_market_gap_flag(&self, flag: &MarketGapFlag) -> StoreResult<MarketGapFlag>;

    /// Marks an active flag as no longer qualifying. The row and its
    /// `notified` bit stay. Returns false when there was no active flag.
    async fn clear_market_gap_flag(&self, property_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool>;

    async fn get_market_gap_flag(&self, property_id: Uuid) -> StoreResult<Option<MarketGapFlag>>;

    async fn list_market_gap_flags(&self) -> StoreResult<Vec<MarketGapFlag>>;

    async fn mark_flag_notified(&self, property_id: Uuid) -> StoreResult<()>;

    /// Average unit prices of comparable active listings at street and
    /// district granularity.
    async fn locality_reference(&self, query: &ReferenceQuery) -> StoreResult<ReferencePrices>;

    async fn get_scan_cursor(&self, source: &str) -> StoreResult<Option<ScanCursor>>;

    async fn save_scan_cursor(&self, cursor: &ScanCursor) -> StoreResult<()>;

    async fn list_scan_cursors(&self) -> StoreResult<Vec<ScanCursor>>;
}
