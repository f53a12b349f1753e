use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pmr_core::{
    canonical_pair, BucketKey, Fingerprint, LifecycleRecord, MarketGapFlag, MatchEdge,
    PriceHistoryPoint, PropertyEntity, ReferencePrices, ReferenceQuery, ScanCursor, SourceKey,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::store::{PropertyStore, StoreError, StoreResult};

const DAILY_RESET_MARKER: &str = "daily_reset";

/// Postgres-backed store; every write is an `ON CONFLICT` upsert on a natural key.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn to_u32(value: i32) -> u32 {
    value.max(0) as u32
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn property_from_row(row: &PgRow) -> StoreResult<PropertyEntity> {
    let listing_type: String = row.try_get("listing_type")?;
    let status: String = row.try_get("status")?;
    Ok(PropertyEntity {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        external_id: row.try_get("external_id")?,
        generation: to_u32(row.try_get("generation")?),
        source_url: row.try_get("source_url")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        price: row.try_get("price")?,
        price_per_m2: row.try_get("price_per_m2")?,
        area_m2: row.try_get("area_m2")?,
        city: row.try_get("city")?,
        district: row.try_get("district")?,
        street: row.try_get("street")?,
        rooms: row.try_get::<Option<i32>, _>("rooms")?.map(to_u32),
        floor: row.try_get("floor")?,
        condition: row.try_get("condition")?,
        listing_type: listing_type.parse()?,
        status: status.parse()?,
        priority_score: row.try_get("priority_score")?,
        check_count_today: to_u32(row.try_get("check_count_today")?),
        check_count_day: row.try_get("check_count_day")?,
        last_checked_at: row.try_get("last_checked_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        consecutive_failures: to_u32(row.try_get("consecutive_failures")?),
        days_on_market: to_u32(row.try_get("days_on_market")?),
        first_listed_at: row.try_get("first_listed_at")?,
        watcher_count: to_u32(row.try_get("watcher_count")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn fingerprint_from_row(row: &PgRow) -> StoreResult<Fingerprint> {
    Ok(Fingerprint {
        property_id: row.try_get("property_id")?,
        normalized_address: row.try_get("normalized_address")?,
        city_district: row.try_get("city_district")?,
        area_range: row.try_get("area_range")?,
        price_range: row.try_get("price_range")?,
        rooms_range: row.try_get("rooms_range")?,
        floor_range: row.try_get("floor_range")?,
        normalized_title: row.try_get("normalized_title")?,
        description_hash: row.try_get("description_hash")?,
        computed_at: row.try_get("computed_at")?,
    })
}

fn edge_from_row(row: &PgRow) -> StoreResult<MatchEdge> {
    let confidence: String = row.try_get("confidence")?;
    let reasons: Json<Vec<String>> = row.try_get("reasons")?;
    let score: i16 = row.try_get("score")?;
    Ok(MatchEdge {
        primary_id: row.try_get("primary_id")?,
        matched_id: row.try_get("matched_id")?,
        score: score.clamp(0, 100) as u8,
        confidence: confidence.parse()?,
        reasons: reasons.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn lifecycle_from_row(row: &PgRow) -> StoreResult<LifecycleRecord> {
    let final_status: String = row.try_get("final_status")?;
    Ok(LifecycleRecord {
        source: row.try_get("source")?,
        external_id: row.try_get("external_id")?,
        generation: to_u32(row.try_get("generation")?),
        property_id: row.try_get("property_id")?,
        initial_price: row.try_get("initial_price")?,
        final_price: row.try_get("final_price")?,
        days_on_market: to_u32(row.try_get("days_on_market")?),
        removal_reason: row.try_get("removal_reason")?,
        final_status: final_status.parse()?,
        closed_at: row.try_get("closed_at")?,
        notified: row.try_get("notified")?,
    })
}

fn flag_from_row(row: &PgRow) -> StoreResult<MarketGapFlag> {
    let level: String = row.try_get("reference_level")?;
    let confidence: String = row.try_get("confidence")?;
    Ok(MarketGapFlag {
        property_id: row.try_get("property_id")?,
        gap_percentage: row.try_get("gap_percentage")?,
        reference_price: row.try_get("reference_price")?,
        reference_level: level.parse()?,
        comparable_count: to_u32(row.try_get("comparable_count")?),
        confidence: confidence.parse()?,
        potential_profit: row.try_get("potential_profit")?,
        notified: row.try_get("notified")?,
        computed_at: row.try_get("computed_at")?,
        cleared_at: row.try_get("cleared_at")?,
    })
}

fn cursor_from_row(row: &PgRow) -> StoreResult<ScanCursor> {
    Ok(ScanCursor {
        source: row.try_get("source")?,
        category_index: to_u32(row.try_get("category_index")?),
        page: to_u32(row.try_get("page")?),
        cycle_count: to_u32(row.try_get("cycle_count")?),
        updated_at: row.try_get("updated_at")?,
    })
}

fn collect<T>(rows: &[PgRow], map: fn(&PgRow) -> StoreResult<T>) -> StoreResult<Vec<T>> {
    rows.iter().map(map).collect()
}

#[async_trait]
impl PropertyStore for PgStore {
    async fn get_property(&self, id: Uuid) -> StoreResult<Option<PropertyEntity>> {
        let row = sqlx::query("SELECT * FROM properties WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(property_from_row).transpose()
    }

    async fn find_active_by_source_key(
        &self,
        key: &SourceKey,
    ) -> StoreResult<Option<PropertyEntity>> {
        let row = sqlx::query(
            "SELECT * FROM properties WHERE source = $1 AND external_id = $2 AND status = 'ACTIVE'",
        )
        .bind(&key.source)
        .bind(&key.external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(property_from_row).transpose()
    }

    async fn latest_generation(&self, key: &SourceKey) -> StoreResult<Option<u32>> {
        let generation: Option<i32> = sqlx::query_scalar(
            "SELECT MAX(generation) FROM properties WHERE source = $1 AND external_id = $2",
        )
        .bind(&key.source)
        .bind(&key.external_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(generation.map(to_u32))
    }

    async fn upsert_property(&self, entity: &PropertyEntity) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO properties (
                id, source, external_id, generation, source_url, title, description,
                price, price_per_m2, area_m2, city, district, street, rooms, floor,
                condition, listing_type, status, priority_score, check_count_today,
                check_count_day, last_checked_at, last_seen_at, consecutive_failures,
                days_on_market, first_listed_at, watcher_count, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29
            )
            ON CONFLICT (id) DO UPDATE SET
                source_url = EXCLUDED.source_url,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                price = EXCLUDED.price,
                price_per_m2 = EXCLUDED.price_per_m2,
                area_m2 = EXCLUDED.area_m2,
                city = EXCLUDED.city,
                district = EXCLUDED.district,
                street = EXCLUDED.street,
                rooms = EXCLUDED.rooms,
                floor = EXCLUDED.floor,
                condition = EXCLUDED.condition,
                listing_type = EXCLUDED.listing_type,
                status = EXCLUDED.status,
                priority_score = EXCLUDED.priority_score,
                check_count_today = EXCLUDED.check_count_today,
                check_count_day = EXCLUDED.check_count_day,
                last_checked_at = EXCLUDED.last_checked_at,
                last_seen_at = EXCLUDED.last_seen_at,
                consecutive_failures = EXCLUDED.consecutive_failures,
                days_on_market = EXCLUDED.days_on_market,
                updated_at = EXCLUDED.updated_at
            WHERE properties.status = 'ACTIVE' OR EXCLUDED.status <> 'ACTIVE'
            "#,
        )
        .bind(entity.id)
        .bind(&entity.source)
        .bind(&entity.external_id)
        .bind(to_i32(entity.generation))
        .bind(&entity.source_url)
        .bind(&entity.title)
        .bind(&entity.description)
        .bind(entity.price)
        .bind(entity.price_per_m2)
        .bind(entity.area_m2)
        .bind(&entity.city)
        .bind(&entity.district)
        .bind(&entity.street)
        .bind(entity.rooms.map(to_i32))
        .bind(entity.floor)
        .bind(&entity.condition)
        .bind(entity.listing_type.as_str())
        .bind(entity.status.as_str())
        .bind(entity.priority_score)
        .bind(to_i32(entity.check_count_today))
        .bind(entity.check_count_day)
        .bind(entity.last_checked_at)
        .bind(entity.last_seen_at)
        .bind(to_i32(entity.consecutive_failures))
        .bind(to_i32(entity.days_on_market))
        .bind(entity.first_listed_at)
        .bind(to_i32(entity.watcher_count))
        .bind(entity.created_at)
        .bind(entity.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let status: String = sqlx::query_scalar("SELECT status FROM properties WHERE id = $1")
                .bind(entity.id)
                .fetch_one(&self.pool)
                .await?;
            return Err(StoreError::TerminalReactivation {
                id: entity.id,
                status: status.parse()?,
            });
        }
        Ok(())
    }

    async fn list_active_properties(&self) -> StoreResult<Vec<PropertyEntity>> {
        let rows = sqlx::query(
            "SELECT * FROM properties WHERE status = 'ACTIVE' ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, property_from_row)
    }

    async fn fetch_check_candidates(&self, limit: usize) -> StoreResult<Vec<PropertyEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM properties
             WHERE status = 'ACTIVE'
             ORDER BY priority_score DESC, last_checked_at ASC NULLS FIRST, id
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, property_from_row)
    }

    async fn update_priority_score(
        &self,
        id: Uuid,
        score: f64,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE properties SET priority_score = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(score)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_daily_counters(&self, today: NaiveDate) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        // The conditional upsert row-locks the marker, so a concurrent trigger
        // re-evaluates the WHERE clause after this commit and matches nothing.
        let claimed = sqlx::query(
            r#"
            INSERT INTO scheduler_markers (name, marker_date) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET marker_date = EXCLUDED.marker_date
             WHERE scheduler_markers.marker_date < EXCLUDED.marker_date
            "#,
        )
        .bind(DAILY_RESET_MARKER)
        .bind(today)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if claimed {
            sqlx::query("UPDATE properties SET check_count_today = 0, check_count_day = $1")
                .bind(today)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(claimed)
    }

    async fn daily_reset_marker(&self) -> StoreResult<Option<NaiveDate>> {
        let marker = sqlx::query_scalar("SELECT marker_date FROM scheduler_markers WHERE name = $1")
            .bind(DAILY_RESET_MARKER)
            .fetch_optional(&self.pool)
            .await?;
        Ok(marker)
    }

    async fn upsert_fingerprint(&self, fingerprint: &Fingerprint) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fingerprints (
                property_id, normalized_address, city_district, area_range, price_range,
                rooms_range, floor_range, normalized_title, description_hash, computed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (property_id) DO UPDATE SET
                normalized_address = EXCLUDED.normalized_address,
                city_district = EXCLUDED.city_district,
                area_range = EXCLUDED.area_range,
                price_range = EXCLUDED.price_range,
                rooms_range = EXCLUDED.rooms_range,
                floor_range = EXCLUDED.floor_range,
                normalized_title = EXCLUDED.normalized_title,
                description_hash = EXCLUDED.description_hash,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(fingerprint.property_id)
        .bind(&fingerprint.normalized_address)
        .bind(&fingerprint.city_district)
        .bind(&fingerprint.area_range)
        .bind(&fingerprint.price_range)
        .bind(&fingerprint.rooms_range)
        .bind(&fingerprint.floor_range)
        .bind(&fingerprint.normalized_title)
        .bind(&fingerprint.description_hash)
        .bind(fingerprint.computed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_fingerprint(&self, property_id: Uuid) -> StoreResult<Option<Fingerprint>> {
        let row = sqlx::query("SELECT * FROM fingerprints WHERE property_id = $1")
            .bind(property_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(fingerprint_from_row).transpose()
    }

    async fn properties_without_fingerprint(&self) -> StoreResult<Vec<PropertyEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT p.* FROM properties p
              LEFT JOIN fingerprints f ON f.property_id = p.id
             WHERE f.property_id IS NULL
             ORDER BY p.created_at, p.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, property_from_row)
    }

    async fn bucket_members(
        &self,
        key: &BucketKey,
    ) -> StoreResult<Vec<(PropertyEntity, Fingerprint)>> {
        let rows = sqlx::query(
            r#"
            SELECT p.*, f.* FROM properties p
              JOIN fingerprints f ON f.property_id = p.id
             WHERE f.city_district = $1 AND f.area_range = $2 AND p.status = 'ACTIVE'
             ORDER BY p.id
            "#,
        )
        .bind(&key.city_district)
        .bind(&key.area_range)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((property_from_row(row)?, fingerprint_from_row(row)?)))
            .collect()
    }

    async fn upsert_match_edge(&self, edge: &MatchEdge) -> StoreResult<()> {
        let (primary_id, matched_id) = canonical_pair(edge.primary_id, edge.matched_id);
        sqlx::query(
            r#"
            INSERT INTO match_edges (primary_id, matched_id, score, confidence, reasons, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (primary_id, matched_id) DO UPDATE SET
                score = EXCLUDED.score,
                confidence = EXCLUDED.confidence,
                reasons = EXCLUDED.reasons,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(primary_id)
        .bind(matched_id)
        .bind(i16::from(edge.score))
        .bind(edge.confidence.as_str())
        .bind(Json(&edge.reasons))
        .bind(edge.created_at)
        .bind(edge.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_match_edge(&self, a: Uuid, b: Uuid) -> StoreResult<Option<MatchEdge>> {
        let (primary_id, matched_id) = canonical_pair(a, b);
        let row = sqlx::query("SELECT * FROM match_edges WHERE primary_id = $1 AND matched_id = $2")
            .bind(primary_id)
            .bind(matched_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(edge_from_row).transpose()
    }

    async fn match_edges_for(&self, property_id: Uuid) -> StoreResult<Vec<MatchEdge>> {
        let rows = sqlx::query(
            "SELECT * FROM match_edges WHERE primary_id = $1 OR matched_id = $1 ORDER BY score DESC",
        )
        .bind(property_id)
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, edge_from_row)
    }

    async fn list_match_edges(&self) -> StoreResult<Vec<MatchEdge>> {
        let rows = sqlx::query("SELECT * FROM match_edges ORDER BY primary_id, matched_id")
            .fetch_all(&self.pool)
            .await?;
        collect(&rows, edge_from_row)
    }

    async fn active_properties_without_edges(&self) -> StoreResult<Vec<PropertyEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT p.* FROM properties p
             WHERE p.status = 'ACTIVE'
               AND NOT EXISTS (
                   SELECT 1 FROM match_edges e
                    WHERE e.primary_id = p.id OR e.matched_id = p.id
               )
             ORDER BY p.created_at, p.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, property_from_row)
    }

    async fn append_price_point(&self, point: &PriceHistoryPoint) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO price_history (property_id, price, price_per_m2, recorded_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(point.property_id)
        .bind(point.price)
        .bind(point.price_per_m2)
        .bind(point.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn price_history(&self, property_id: Uuid) -> StoreResult<Vec<PriceHistoryPoint>> {
        let rows = sqlx::query(
            r#"
            SELECT property_id, price, price_per_m2, recorded_at FROM price_history
             WHERE property_id = $1
             ORDER BY recorded_at, id
            "#,
        )
        .bind(property_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(PriceHistoryPoint {
                    property_id: row.try_get("property_id")?,
                    price: row.try_get("price")?,
                    price_per_m2: row.try_get("price_per_m2")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    async fn upsert_lifecycle_record(&self, record: &LifecycleRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO lifecycle_records (
                source, external_id, generation, property_id, initial_price, final_price,
                days_on_market, removal_reason, final_status, closed_at, notified
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (source, external_id, generation) DO UPDATE SET
                property_id = EXCLUDED.property_id,
                initial_price = EXCLUDED.initial_price,
                final_price = EXCLUDED.final_price,
                days_on_market = EXCLUDED.days_on_market,
                removal_reason = EXCLUDED.removal_reason,
                final_status = EXCLUDED.final_status,
                closed_at = EXCLUDED.closed_at
            "#,
        )
        .bind(&record.source)
        .bind(&record.external_id)
        .bind(to_i32(record.generation))
        .bind(record.property_id)
        .bind(record.initial_price)
        .bind(record.final_price)
        .bind(to_i32(record.days_on_market))
        .bind(&record.removal_reason)
        .bind(record.final_status.as_str())
        .bind(record.closed_at)
        .bind(record.notified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_lifecycle_record(
        &self,
        key: &SourceKey,
        generation: u32,
    ) -> StoreResult<Option<LifecycleRecord>> {
        let row = sqlx::query(
            "SELECT * FROM lifecycle_records WHERE source = $1 AND external_id = $2 AND generation = $3",
        )
        .bind(&key.source)
        .bind(&key.external_id)
        .bind(to_i32(generation))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(lifecycle_from_row).transpose()
    }

    async fn lifecycle_records_pending_notification(&self) -> StoreResult<Vec<LifecycleRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM lifecycle_records WHERE NOT notified ORDER BY closed_at",
        )
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, lifecycle_from_row)
    }

    async fn mark_lifecycle_notified(&self, key: &SourceKey, generation: u32) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE lifecycle_records SET notified = TRUE
             WHERE source = $1 AND external_id = $2 AND generation = $3
            "#,
        )
        .bind(&key.source)
        .bind(&key.external_id)
        .bind(to_i32(generation))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_market_gap_flag(&self, flag: &MarketGapFlag) -> StoreResult<MarketGapFlag> {
        let row = sqlx::query(
            r#"
            INSERT INTO market_gap_flags (
                property_id, gap_percentage, reference_price, reference_level,
                comparable_count, confidence, potential_profit, notified, computed_at,
                cleared_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (property_id) DO UPDATE SET
                gap_percentage = EXCLUDED.gap_percentage,
                reference_price = EXCLUDED.reference_price,
                reference_level = EXCLUDED.reference_level,
                comparable_count = EXCLUDED.comparable_count,
                confidence = EXCLUDED.confidence,
                potential_profit = EXCLUDED.potential_profit,
                computed_at = EXCLUDED.computed_at,
                cleared_at = EXCLUDED.cleared_at
            RETURNING *
            "#,
        )
        .bind(flag.property_id)
        .bind(flag.gap_percentage)
        .bind(flag.reference_price)
        .bind(flag.reference_level.as_str())
        .bind(to_i32(flag.comparable_count))
        .bind(flag.confidence.as_str())
        .bind(flag.potential_profit)
        .bind(flag.notified)
        .bind(flag.computed_at)
        .bind(flag.cleared_at)
        .fetch_one(&self.pool)
        .await?;
        flag_from_row(&row)
    }

    async fn clear_market_gap_flag(&self, property_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE market_gap_flags SET cleared_at = $2 WHERE property_id = $1 AND cleared_at IS NULL",
        )
        .bind(property_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_market_gap_flag(&self, property_id: Uuid) -> StoreResult<Option<MarketGapFlag>> {
        let row = sqlx::query("SELECT * FROM market_gap_flags WHERE property_id = $1")
            .bind(property_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(flag_from_row).transpose()
    }

    async fn list_market_gap_flags(&self) -> StoreResult<Vec<MarketGapFlag>> {
        let rows = sqlx::query(
            "SELECT * FROM market_gap_flags ORDER BY gap_percentage DESC, property_id",
        )
        .fetch_all(&self.pool)
        .await?;
        collect(&rows, flag_from_row)
    }

    async fn mark_flag_notified(&self, property_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE market_gap_flags SET notified = TRUE WHERE property_id = $1")
            .bind(property_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn locality_reference(&self, query: &ReferenceQuery) -> StoreResult<ReferencePrices> {
        let row = sqlx::query(
            r#"
            SELECT
                AVG(price_per_m2) FILTER (WHERE lower(trim(street)) = lower(trim($4::text))) AS street_avg,
                COUNT(*) FILTER (WHERE lower(trim(street)) = lower(trim($4::text)))        AS street_count,
                AVG(price_per_m2)                                                          AS district_avg,
                COUNT(*)                                                                   AS district_count
              FROM properties
             WHERE status = 'ACTIVE'
               AND listing_type = $3
               AND price_per_m2 > 0
               AND lower(trim(city)) = lower(trim($1))
               AND lower(trim(district)) = lower(trim($2))
               AND ($5::uuid IS NULL OR id <> $5)
            "#,
        )
        .bind(&query.city)
        .bind(&query.district)
        .bind(query.listing_type.as_str())
        .bind(&query.street)
        .bind(query.exclude_property_id)
        .fetch_one(&self.pool)
        .await?;

        let street_count: i64 = row.try_get("street_count")?;
        let district_count: i64 = row.try_get("district_count")?;
        Ok(ReferencePrices {
            street_avg: row.try_get("street_avg")?,
            street_count: street_count.clamp(0, i64::from(u32::MAX)) as u32,
            district_avg: row.try_get("district_avg")?,
            district_count: district_count.clamp(0, i64::from(u32::MAX)) as u32,
        })
    }

    async fn get_scan_cursor(&self, source: &str) -> StoreResult<Option<ScanCursor>> {
        let row = sqlx::query("SELECT * FROM scan_cursors WHERE source = $1")
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(cursor_from_row).transpose()
    }

    async fn save_scan_cursor(&self, cursor: &ScanCursor) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_cursors (source, category_index, page, cycle_count, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source) DO UPDATE SET
                category_index = EXCLUDED.category_index,
                page = EXCLUDED.page,
                cycle_count = EXCLUDED.cycle_count,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&cursor.source)
        .bind(to_i32(cursor.category_index))
        .bind(to_i32(cursor.page))
        .bind(to_i32(cursor.cycle_count))
        .bind(cursor.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_scan_cursors(&self) -> StoreResult<Vec<ScanCursor>> {
        let rows = sqlx::query("SELECT * FROM scan_cursors ORDER BY source")
            .fetch_all(&self.pool)
            .await?;
        collect(&rows, cursor_from_row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_conversions_saturate() {
        assert_eq!(to_u32(-4), 0);
        assert_eq!(to_u32(17), 17);
        assert_eq!(to_i32(u32::MAX), i32::MAX);
    }
}
