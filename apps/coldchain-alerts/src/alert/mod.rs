mod machine;


pub use machine::{AlertState, AssetSnapshot};

use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity of an asset. Ordered: `Nominal < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Nominal,
    Warning,
    Critical,
}

/// Wire `level` of an outbound alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Warning,
    Critical,
    Recovery,
}

impl AlertKind {
    /// Event emitted when an asset enters `level`.
    pub fn entering(level: AlertLevel) -> Self {
        match level {
            AlertLevel::Nominal => AlertKind::Recovery,
            AlertLevel::Warning => AlertKind::Warning,
            AlertLevel::Critical => AlertKind::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Warning => "warning",
            AlertKind::Critical => "critical",
            AlertKind::Recovery => "recovery",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub asset_id: String,
    pub level: AlertKind,
    pub message: String,
    pub door_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// Temperature bands in °C. The warning band sits strictly inside the critical band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub warning_low: f64,
    pub warning_high: f64,
    pub critical_low: f64,
    pub critical_high: f64,
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bounds = [
            ("warning_low", self.warning_low),
            ("warning_high", self.warning_high),
            ("critical_low", self.critical_low),
            ("critical_high", self.critical_high),
        ];
        for (key, value) in bounds {
            if !value.is_finite() {
                return Err(ConfigError::Invalid {
                    key,
                    value: value.to_string(),
                });
            }
        }
        let ordered = self.critical_low < self.warning_low
            && self.warning_low < self.warning_high
            && self.warning_high < self.critical_high;
        if !ordered {
            return Err(ConfigError::InvertedBounds {
                critical_low: self.critical_low,
                warning_low: self.warning_low,
                warning_high: self.warning_high,
                critical_high: self.critical_high,
            });
        }
        Ok(())
    }

    pub fn classify(&self, temperature: f64) -> AlertLevel {
        if temperature < self.critical_low || temperature > self.critical_high {
            AlertLevel::Critical
        } else if temperature < self.warning_low || temperature > self.warning_high {
            AlertLevel::Warning
        } else {
            AlertLevel::Nominal
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AlertPolicy {
    pub thresholds: Thresholds,
    pub recovery_hold: chrono::Duration,
    pub stale_after: chrono::Duration,
}
