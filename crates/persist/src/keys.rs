//! Key encoding for history collections.
//!
//! Keys are designed for ordered range scans:
//! - Entity history: `<name>#<timestamp>`, scan one entity with prefix `<name>#`
//! - Cluster snapshots: `<timestamp>` alone, one timeline per cluster
//!
//! # Timestamp format
//!
//! ```text
//! 2023-05-01T12:30:00.000000001Z
//! └──── 19 ─────────┘└ 10 ────┘└ Z
//! ```
//!
//! RFC 3339 in UTC with exactly nine fractional digits (30 bytes). Fixed width
//! and zero padding make byte order of keys equal to chronological order within
//! one name. Encode and decode use the same format, so sub-second ordering
//! survives a round trip.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{Result, StoreError};

/// Separates the entity name from the timestamp. Never valid in a Kubernetes name.
pub const SEPARATOR: u8 = b'#';

/// Length of an encoded timestamp.
pub const TIMESTAMP_LEN: usize = 30;

/// Render an instant in the fixed-width key format.
pub fn format_timestamp(t: DateTime<Utc>) -> Result<String> {
    let s = t.to_rfc3339_opts(SecondsFormat::Nanos, true);
    // years outside 0000..=9999 widen the string and break ordering
    if s.len() != TIMESTAMP_LEN {
        return Err(StoreError::UnencodableTimestamp(t));
    }
    Ok(s)
}

/// Parse a timestamp rendered by [`format_timestamp`]; anything else is rejected.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let b = s.as_bytes();
    if b.len() != TIMESTAMP_LEN || b[10] != b'T' || b[19] != b'.' || b[TIMESTAMP_LEN - 1] != b'Z' {
        return None;
    }
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.as_bytes().contains(&SEPARATOR) {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Encode `<name>#<timestamp>`.
pub fn encode_entity_key(name: &str, t: DateTime<Utc>) -> Result<Vec<u8>> {
    validate_name(name)?;
    let ts = format_timestamp(t)?;
    let mut key = Vec::with_capacity(name.len() + 1 + TIMESTAMP_LEN);
    key.extend_from_slice(name.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(ts.as_bytes());
    Ok(key)
}

/// Split an entity key on the first separator without copying the name.
pub fn split_entity_key(key: &[u8]) -> Result<(&str, DateTime<Utc>)> {
    let sep = key.iter().position(|b| *b == SEPARATOR).ok_or_else(|| malformed(key))?;
    let name = std::str::from_utf8(&key[..sep]).map_err(|_| malformed(key))?;
    let ts = std::str::from_utf8(&key[sep + 1..])
        .ok()
        .and_then(parse_timestamp)
        .ok_or_else(|| malformed(key))?;
    Ok((name, ts))
}

/// Decode an entity key into its name and instant.
pub fn decode_entity_key(key: &[u8]) -> Result<(String, DateTime<Utc>)> {
    let (name, ts) = split_entity_key(key)?;
    Ok((name.to_string(), ts))
}

/// Encode a cluster snapshot key (the timestamp alone).
pub fn encode_snapshot_key(t: DateTime<Utc>) -> Result<Vec<u8>> {
    Ok(format_timestamp(t)?.into_bytes())
}

pub fn decode_snapshot_key(key: &[u8]) -> Result<DateTime<Utc>> {
    std::str::from_utf8(key)
        .ok()
        .and_then(parse_timestamp)
        .ok_or_else(|| malformed(key))
}

/// Scan prefix selecting every key of one entity: `<name>#`.
pub fn entity_prefix(name: &str) -> Result<Vec<u8>> {
    validate_name(name)?;
    let mut p = Vec::with_capacity(name.len() + 1);
    p.extend_from_slice(name.as_bytes());
    p.push(SEPARATOR);
    Ok(p)
}

/// Smallest byte string greater than every key starting with `prefix`.
///
/// `None` when no such bound exists (empty or all-`0xff` prefix).
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

fn malformed(key: &[u8]) -> StoreError {
    StoreError::MalformedKey(String::from_utf8_lossy(key).into_owned())
}
