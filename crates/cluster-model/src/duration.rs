//! Serde helpers for human-readable durations ("24h", "1m 30s").

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Serialize a `Duration` as a humantime string.
pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

/// Deserialize a `Duration` from a humantime string.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}
