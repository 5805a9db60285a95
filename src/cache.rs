use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

/// Cache identity for a coordinate pair: both values rounded to 6 decimals (~11 cm).
pub fn coordinate_key(lat: f64, lng: f64) -> String {
    format!("{}_{}", key_part(lat), key_part(lng))
}

// A value that rounds to zero keys the same regardless of its sign.
fn key_part(value: f64) -> String {
    let formatted = format!("{value:.6}");
    match formatted.strip_prefix('-') {
        Some(magnitude) if magnitude.bytes().all(|b| b == b'0' || b == b'.') => {
            magnitude.to_string()
        }
        _ => formatted,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Miss,
    Stale,
}

pub fn cached_place_info(
    conn: &Connection,
    lat: f64,
    lng: f64,
    max_age: Duration,
) -> Option<Value> {
    cached_place_info_at(conn, lat, lng, max_age, Utc::now())
}

pub fn cache_place_info(conn: &Connection, lat: f64, lng: f64, value: &Value) {
    cache_place_info_at(conn, lat, lng, value, Utc::now())
}

pub(crate) fn cached_place_info_at(
    conn: &Connection,
    lat: f64,
    lng: f64,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Option<Value> {
    let key = coordinate_key(lat, lng);
    match lookup(conn, &key, max_age, now) {
        Ok((CacheLookup::Hit, value)) => {
            debug!(target: "place_cache", cache_key = %key, "cache hit");
            value
        }
        Ok((outcome, _)) => {
            debug!(target: "place_cache", cache_key = %key, ?outcome, "cache not usable");
            None
        }
        Err(err) => {
            warn!(target: "place_cache", cache_key = %key, error = %err, "cache read failed; treating as miss");
            None
        }
    }
}

pub(crate) fn cache_place_info_at(
    conn: &Connection,
    lat: f64,
    lng: f64,
    value: &Value,
    at: DateTime<Utc>,
) {
    let key = coordinate_key(lat, lng);
    if !(value.is_object() || value.is_array()) {
        warn!(
            target: "place_cache",
            cache_key = %key,
            "refusing to cache a value that is neither an object nor an array"
        );
        return;
    }
    match store(conn, &key, value, at) {
        Ok(()) => debug!(target: "place_cache", cache_key = %key, "cached place info"),
        Err(err) => warn!(target: "place_cache", cache_key = %key, error = %err, "cache write failed"),
    }
}

fn lookup(
    conn: &Connection,
    key: &str,
    max_age: Duration,
    now: DateTime<Utc>,
) -> AppResult<(CacheLookup, Option<Value>)> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT json_result, timestamp FROM cache WHERE cache_key = ?1",
            [key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((payload, timestamp)) = row else {
        return Ok((CacheLookup::Miss, None));
    };

    let written_at = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|err| AppError::CorruptCacheEntry(format!("invalid timestamp {timestamp:?}: {err}")))?
        .with_timezone(&Utc);
    if now - written_at >= max_age {
        return Ok((CacheLookup::Stale, None));
    }

    let value = serde_json::from_str(&payload)?;
    Ok((CacheLookup::Hit, Some(value)))
}

fn store(conn: &Connection, key: &str, value: &Value, at: DateTime<Utc>) -> AppResult<()> {
    let payload = serde_json::to_string(value)?;
    conn.execute(
        "INSERT OR REPLACE INTO cache (cache_key, json_result, timestamp) VALUES (?1, ?2, ?3)",
        (key, payload.as_str(), at.to_rfc3339()),
    )?;
    Ok(())
}
