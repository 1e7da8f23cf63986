//! Duration encodings used in the TOML config files.
//!
//! Timings are written as plain integers so config files stay readable:
//! `heartbeat_interval = 60` rather than a nested `{ secs, nanos }` table.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

fn write_u64<S: Serializer>(value: u128, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value).unwrap_or(u64::MAX))
}

/// `#[serde(with = "duration_secs")]`: whole seconds
pub mod duration_secs {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        write_u64(u128::from(d.as_secs()), s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// `#[serde(with = "duration_millis")]`: whole milliseconds
pub mod duration_millis {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        write_u64(d.as_millis(), s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
