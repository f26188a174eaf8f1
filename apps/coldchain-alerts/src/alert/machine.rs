use super::{AlertEvent, AlertKind, AlertLevel, AlertPolicy, Thresholds};
use crate::telemetry::TelemetryRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    InRange,
    DoorOpen,
    TooWarm,
    TooCold,
}

#[derive(Debug, Clone, Copy)]
struct Classification {
    level: AlertLevel,
    cause: Cause,
}

fn classify(record: &TelemetryRecord, thresholds: &Thresholds) -> Classification {
    let level = thresholds.classify(record.temperature);
    if level == AlertLevel::Nominal {
        let cause = if record.door_open {
            Cause::DoorOpen
        } else {
            Cause::InRange
        };
        return Classification { level, cause };
    }
    let cause = if record.temperature > thresholds.warning_high {
        Cause::TooWarm
    } else {
        Cause::TooCold
    };
    Classification { level, cause }
}

/// Start of an uninterrupted run of calmer readings, on both the device and receipt clocks.
#[derive(Debug, Clone, Copy, PartialEq)]
struct HoldRun {
    since: DateTime<Utc>,
    received_since: DateTime<Utc>,
}

impl HoldRun {
    fn start(record: &TelemetryRecord) -> Self {
        Self {
            since: record.timestamp,
            received_since: record.received_at,
        }
    }

    /// Only time both clocks agree on counts, so a device clock jump cannot skip the hold.
    fn held_for(&self, record: &TelemetryRecord) -> chrono::Duration {
        (record.timestamp - self.since).min(record.received_at - self.received_since)
    }
}

/// Alert state of one asset. Owned by that asset's worker and nothing else.
#[derive(Debug, Clone)]
pub struct AlertState {
    asset_id: String,
    current_level: AlertLevel,
    level_entered_at: DateTime<Utc>,
    last_telemetry_at: DateTime<Utc>,
    last_dispatched_level: Option<AlertKind>,
    /// Continuous nominal readings; gates `recovery`.
    recovering: Option<HoldRun>,
    /// Continuous non-critical readings while CRITICAL; gates the step down to WARNING.
    easing: Option<HoldRun>,
    silent: bool,
    undelivered: Option<AlertEvent>,
    last_temperature: Option<f64>,
    last_door_open: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetSnapshot {
    pub asset_id: String,
    pub level: AlertLevel,
    pub level_entered_at: DateTime<Utc>,
    pub last_telemetry_at: DateTime<Utc>,
    pub last_dispatched_level: Option<AlertKind>,
    pub recovering_since: Option<DateTime<Utc>>,
    pub silent: bool,
    pub temperature: Option<f64>,
    pub door_open: bool,
}

impl AlertState {
    pub fn new(asset_id: impl Into<String>, first_seen: DateTime<Utc>) -> Self {
        Self {
            asset_id: asset_id.into(),
            current_level: AlertLevel::Nominal,
            level_entered_at: first_seen,
            last_telemetry_at: first_seen,
            last_dispatched_level: None,
            recovering: None,
            easing: None,
            silent: false,
            undelivered: None,
            last_temperature: None,
            last_door_open: false,
        }
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn level(&self) -> AlertLevel {
        self.current_level
    }

    pub fn last_dispatched_level(&self) -> Option<AlertKind> {
        self.last_dispatched_level
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    /// Applies one accepted reading. Returns the event for a level change, if any.
    pub fn observe(&mut self, record: &TelemetryRecord, policy: &AlertPolicy) -> Option<AlertEvent> {
        self.silent = false;
        if record.received_at > self.last_telemetry_at {
            self.last_telemetry_at = record.received_at;
        }
        self.last_temperature = Some(record.temperature);
        self.last_door_open = record.door_open;

        let reading = classify(record, &policy.thresholds);

        if reading.level > self.current_level {
            self.recovering = None;
            self.easing = None;
            let message = describe(reading, record, &policy.thresholds);
            return Some(self.transition(reading.level, record.timestamp, message, record));
        }
        if self.current_level == AlertLevel::Nominal {
            return None;
        }

        // Each step down needs its own uninterrupted run of readings at or below the target.
        self.recovering = match reading.level {
            AlertLevel::Nominal => Some(self.recovering.unwrap_or_else(|| HoldRun::start(record))),
            _ => None,
        };
        self.easing = match (self.current_level, reading.level) {
            (AlertLevel::Critical, AlertLevel::Warning | AlertLevel::Nominal) => {
                Some(self.easing.unwrap_or_else(|| HoldRun::start(record)))
            }
            _ => None,
        };

        if self
            .recovering
            .is_some_and(|run| run.held_for(record) >= policy.recovery_hold)
        {
            self.recovering = None;
            self.easing = None;
            let message = describe(reading, record, &policy.thresholds);
            return Some(self.transition(AlertLevel::Nominal, record.timestamp, message, record));
        }

        if self
            .easing
            .is_some_and(|run| run.held_for(record) >= policy.recovery_hold)
        {
            self.easing = None;
            let eased = Classification {
                level: AlertLevel::Warning,
                cause: reading.cause,
            };
            let message = describe(eased, record, &policy.thresholds);
            return Some(self.transition(AlertLevel::Warning, record.timestamp, message, record));
        }
        None
    }

    /// Timer input. Latches a single silence alarm once telemetry has stopped.
    pub fn check_stale(&mut self, now: DateTime<Utc>, policy: &AlertPolicy) -> Option<AlertEvent> {
        if self.silent || now - self.last_telemetry_at < policy.stale_after {
            return None;
        }
        self.silent = true;
        self.recovering = None;
        self.easing = None;
        if self.current_level == AlertLevel::Critical {
            return None;
        }

        let silent_for = (now - self.last_telemetry_at).num_seconds();
        self.current_level = AlertLevel::Critical;
        self.level_entered_at = now;
        self.undelivered = None;
        Some(AlertEvent {
            event_id: Uuid::new_v4(),
            timestamp: now,
            asset_id: self.asset_id.clone(),
            level: AlertKind::Critical,
            message: format!("No telemetry for {silent_for}s; asset silent/disconnected"),
            door_open: self.last_door_open,
            temperature: None,
        })
    }

    /// Event whose publish previously failed and is still the latest transition.
    pub fn undelivered(&mut self) -> Option<AlertEvent> {
        let pending = self.undelivered.as_ref()?;
        if Some(pending.level) == self.last_dispatched_level {
            self.undelivered = None;
            return None;
        }
        Some(pending.clone())
    }

    pub fn mark_dispatched(&mut self, event: &AlertEvent) {
        self.last_dispatched_level = Some(event.level);
        if self
            .undelivered
            .as_ref()
            .is_some_and(|pending| pending.event_id == event.event_id)
        {
            self.undelivered = None;
        }
    }

    pub fn mark_undelivered(&mut self, event: AlertEvent) {
        if Some(event.level) != self.last_dispatched_level {
            self.undelivered = Some(event);
        }
    }

    pub fn snapshot(&self) -> AssetSnapshot {
        AssetSnapshot {
            asset_id: self.asset_id.clone(),
            level: self.current_level,
            level_entered_at: self.level_entered_at,
            last_telemetry_at: self.last_telemetry_at,
            last_dispatched_level: self.last_dispatched_level,
            recovering_since: self.recovering.map(|run| run.since),
            silent: self.silent,
            temperature: self.last_temperature,
            door_open: self.last_door_open,
        }
    }

    fn transition(
        &mut self,
        level: AlertLevel,
        at: DateTime<Utc>,
        message: String,
        record: &TelemetryRecord,
    ) -> AlertEvent {
        tracing::debug!(
            asset_id = %self.asset_id,
            from = ?self.current_level,
            to = ?level,
            "alert level transition"
        );
        self.current_level = level;
        self.level_entered_at = at;
        self.undelivered = None;
        AlertEvent {
            event_id: Uuid::new_v4(),
            timestamp: at,
            asset_id: self.asset_id.clone(),
            level: AlertKind::entering(level),
            message,
            door_open: record.door_open,
            temperature: Some(record.temperature),
        }
    }
}

fn describe(
    reading: Classification,
    record: &TelemetryRecord,
    thresholds: &Thresholds,
) -> String {
    let t = record.temperature;
    let door = if record.door_open {
        " with door open"
    } else {
        ""
    };
    match (reading.level, reading.cause) {
        (AlertLevel::Critical, Cause::TooWarm) => format!(
            "Temperature {t:.2}°C above critical limit {:.1}°C{door}; cooling failure suspected",
            thresholds.critical_high
        ),
        (AlertLevel::Critical, _) => format!(
            "Temperature {t:.2}°C below critical limit {:.1}°C{door}; freezing risk",
            thresholds.critical_low
        ),
        (AlertLevel::Warning, Cause::InRange | Cause::DoorOpen) => format!(
            "Temperature {t:.2}°C back inside critical limits{door}; recovery pending"
        ),
        (AlertLevel::Warning, Cause::TooWarm) => format!(
            "Temperature {t:.2}°C above safe range {:.1}..{:.1}°C{door}",
            thresholds.warning_low, thresholds.warning_high
        ),
        (AlertLevel::Warning, _) => format!(
            "Temperature {t:.2}°C below safe range {:.1}..{:.1}°C{door}",
            thresholds.warning_low, thresholds.warning_high
        ),
        (AlertLevel::Nominal, Cause::DoorOpen) => {
            format!("Temperature back in range at {t:.2}°C (door open)")
        }
        (AlertLevel::Nominal, _) => format!("Temperature back in range at {t:.2}°C"),
    }
}
