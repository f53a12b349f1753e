//! Normalized, bucketed property summaries used for candidate retrieval.

use chrono::{DateTime, Utc};
use pmr_core::{Fingerprint, PropertyEntity};
use sha2::{Digest, Sha256};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const DESCRIPTION_HASH_CHARS: usize = 500;

/// Strips diacritics, lowercases, turns punctuation into spaces and collapses whitespace.
pub fn normalize_text(input: &str) -> String {
    let folded: String = input
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn city_district_key(city: &str, district: &str) -> String {
    format!("{}|{}", normalize_text(city), normalize_text(district))
}

pub fn area_band(area_m2: f64) -> &'static str {
    match area_m2 {
        a if a < 30.0 => "<30",
        a if a < 50.0 => "30-50",
        a if a < 70.0 => "50-70",
        a if a < 90.0 => "70-90",
        a if a < 120.0 => "90-120",
        a if a < 150.0 => "120-150",
        _ => "150+",
    }
}

/// `None` for a price on request.
pub fn price_band(price: f64) -> Option<&'static str> {
    if price <= 0.0 {
        return None;
    }
    Some(match price {
        p if p < 50_000.0 => "<50k",
        p if p < 100_000.0 => "50-100k",
        p if p < 150_000.0 => "100-150k",
        p if p < 200_000.0 => "150-200k",
        p if p < 300_000.0 => "200-300k",
        p if p < 500_000.0 => "300-500k",
        _ => "500k+",
    })
}

pub fn floor_band(floor: Option<i32>) -> Option<&'static str> {
    floor.map(|f| match f {
        f if f <= 0 => "ground",
        1..=3 => "1-3",
        4..=6 => "4-6",
        _ => "7+",
    })
}

pub fn rooms_band(rooms: Option<u32>) -> Option<&'static str> {
    rooms.filter(|r| *r > 0).map(|r| match r {
        1 => "1",
        2 => "2",
        3 => "3",
        4 => "4",
        _ => "5+",
    })
}

/// SHA-256 hex of the first 500 characters of the normalized description.
pub fn description_hash(description: Option<&str>) -> Option<String> {
    let normalized = normalize_text(description?);
    if normalized.is_empty() {
        return None;
    }
    let head: String = normalized.chars().take(DESCRIPTION_HASH_CHARS).collect();
    let mut hasher = Sha256::new();
    hasher.update(head.as_bytes());
    Some(hex::encode(hasher.finalize()))
}

pub fn fingerprint_for(entity: &PropertyEntity, now: DateTime<Utc>) -> Fingerprint {
    Fingerprint {
        property_id: entity.id,
        normalized_address: entity
            .street
            .as_deref()
            .map(normalize_text)
            .unwrap_or_default(),
        city_district: city_district_key(&entity.city, &entity.district),
        area_range: area_band(entity.area_m2).to_string(),
        price_range: price_band(entity.price).map(str::to_string),
        rooms_range: rooms_band(entity.rooms).map(str::to_string),
        floor_range: floor_band(entity.floor).map(str::to_string),
        normalized_title: normalize_text(&entity.title),
        description_hash: description_hash(entity.description.as_deref()),
        computed_at: now,
    }
}
