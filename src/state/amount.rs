//! Serde helpers for wei amounts encoded as decimal or `0x` hex strings.

use std::str::FromStr;

use alloy_primitives::U256;
use serde::{Deserialize, Deserializer};

/// Deserialize a required amount.
pub fn deserialize<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse(&raw).map_err(serde::de::Error::custom)
}

/// Deserialize an optional amount; `null` maps to `None`.
pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<U256>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse(&raw).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Parse an amount string.
pub fn parse(raw: &str) -> Result<U256, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty amount".to_string());
    }

    U256::from_str(trimmed).map_err(|e| format!("invalid amount {raw:?}: {e}"))
}
