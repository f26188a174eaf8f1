use std::path::PathBuf;
use std::time::Duration;

/// Telemetry payload rejected before it reaches an asset worker.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("asset_id is missing or empty")]
    MissingAssetId,
    #[error("payload asset_id {payload:?} does not match topic asset {topic:?}")]
    AssetMismatch { topic: String, payload: String },
    #[error("temp is missing")]
    MissingTemperature,
    #[error("temp is not numeric")]
    NonNumericTemperature,
    #[error("temp {0} is outside the plausible sensor range")]
    ImplausibleTemperature(f64),
    #[error("battery {0} is outside 0..=100")]
    InvalidBattery(f64),
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
}

/// Publish failure on the message bus.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("publish abandoned during shutdown")]
    Cancelled,
}

/// Invalid startup configuration. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error(
        "thresholds must satisfy critical_low < warning_low < warning_high < critical_high \
         (got critical_low={critical_low}, warning_low={warning_low}, \
         warning_high={warning_high}, critical_high={critical_high})"
    )]
    InvertedBounds {
        critical_low: f64,
        warning_low: f64,
        warning_high: f64,
        critical_high: f64,
    },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
