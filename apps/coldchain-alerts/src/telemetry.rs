use crate::error::DecodeError;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;

/// Physically plausible sensor output. Anything outside is treated as sensor noise.
const PLAUSIBLE_MIN_C: f64 = -80.0;
const PLAUSIBLE_MAX_C: f64 = 80.0;

/// Integer timestamps above this are epoch milliseconds, below it epoch seconds.
const EPOCH_MILLIS_CUTOFF: u64 = 100_000_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub asset_id: String,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub temperature: f64,
    pub door_open: bool,
    pub battery: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireTelemetry {
    #[serde(default, alias = "temperature")]
    temp: Option<JsonValue>,
    #[serde(default)]
    door_open: Option<bool>,
    #[serde(default)]
    battery: Option<f64>,
    #[serde(default)]
    timestamp: Option<WireTimestamp>,
    #[serde(default)]
    asset_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Int(i64),
    Float(f64),
    Str(String),
}

impl WireTimestamp {
    fn to_datetime(&self) -> Result<DateTime<Utc>, DecodeError> {
        match self {
            WireTimestamp::Str(raw) => DateTime::parse_from_rfc3339(raw.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| DecodeError::InvalidTimestamp(raw.clone())),
            WireTimestamp::Int(value) if value.unsigned_abs() >= EPOCH_MILLIS_CUTOFF => {
                millis_to_dt(*value).ok_or_else(|| DecodeError::InvalidTimestamp(value.to_string()))
            }
            WireTimestamp::Int(secs) => Utc
                .timestamp_opt(*secs, 0)
                .single()
                .ok_or_else(|| DecodeError::InvalidTimestamp(secs.to_string())),
            WireTimestamp::Float(secs) if secs.is_finite() => millis_to_dt((*secs * 1000.0) as i64)
                .ok_or_else(|| DecodeError::InvalidTimestamp(secs.to_string())),
            WireTimestamp::Float(secs) => Err(DecodeError::InvalidTimestamp(secs.to_string())),
        }
    }
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Decodes one telemetry payload for `asset_id` (taken from the topic).
pub fn decode(
    asset_id: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<TelemetryRecord, DecodeError> {
    let asset_id = asset_id.trim();
    if asset_id.is_empty() {
        return Err(DecodeError::MissingAssetId);
    }

    let value: JsonValue = serde_json::from_slice(payload)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let wire: WireTelemetry = serde_json::from_value(value)?;

    if let Some(claimed) = wire.asset_id.as_deref().map(str::trim) {
        if !claimed.is_empty() && claimed != asset_id {
            return Err(DecodeError::AssetMismatch {
                topic: asset_id.to_string(),
                payload: claimed.to_string(),
            });
        }
    }

    let temperature = match wire.temp {
        None | Some(JsonValue::Null) => return Err(DecodeError::MissingTemperature),
        Some(JsonValue::Number(n)) => n.as_f64().ok_or(DecodeError::NonNumericTemperature)?,
        Some(_) => return Err(DecodeError::NonNumericTemperature),
    };
    if !temperature.is_finite() || !(PLAUSIBLE_MIN_C..=PLAUSIBLE_MAX_C).contains(&temperature) {
        return Err(DecodeError::ImplausibleTemperature(temperature));
    }

    if let Some(battery) = wire.battery {
        if !(0.0..=100.0).contains(&battery) {
            return Err(DecodeError::InvalidBattery(battery));
        }
    }

    let timestamp = match wire.timestamp.as_ref() {
        Some(ts) => ts.to_datetime()?,
        None => received_at,
    };

    Ok(TelemetryRecord {
        asset_id: asset_id.to_string(),
        timestamp,
        received_at,
        temperature,
        door_open: wire.door_open.unwrap_or(false),
        battery: wire.battery,
    })
}
