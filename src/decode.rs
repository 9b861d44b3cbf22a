//! Boundary decoder: raw device message to [`Reading`].
//!
//! Messages are JSON objects of the form
//! `{"name_to_temp": {"Ambient": 20.2}, "time": "1999-05-25 02:35:05.523000", "error_msg": ""}`.
//! A `time` without an offset is UTC. RFC 3339 with an explicit offset is also accepted.

use crate::error::IngestError;
use crate::types::{Reading, SensorValues, Timestamp};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

#[derive(Debug, Deserialize)]
struct WireReading {
    #[serde(default)]
    name_to_temp: SensorValues,
    time: String,
    #[serde(default)]
    error_msg: Option<String>,
}

impl Reading {
    /// Decodes one message. On failure no `Reading` is produced.
    pub fn from_json(msg: &str) -> Result<Reading, IngestError> {
        Self::from_json_slice(msg.as_bytes())
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Reading, IngestError> {
        let wire: WireReading =
            serde_json::from_slice(bytes).map_err(|e| IngestError::Decode(e.to_string()))?;
        let timestamp = parse_time(&wire.time)?;
        Ok(Reading::new(
            wire.name_to_temp,
            timestamp,
            wire.error_msg.unwrap_or_default(),
        ))
    }
}

/// Parses a message timestamp. Offset-less timestamps are taken as UTC.
pub fn parse_time(s: &str) -> Result<Timestamp, IngestError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    Err(IngestError::Decode(format!("unrecognised timestamp {:?}", s)))
}
