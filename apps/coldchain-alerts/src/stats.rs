use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct AlertStats {
    pub telemetry_accepted: AtomicU64,
    pub telemetry_rejected: AtomicU64,
    pub telemetry_dropped: AtomicU64,
    pub alerts_published: AtomicU64,
    pub alerts_suppressed: AtomicU64,
    pub alerts_dropped: AtomicU64,
    pub commands_forwarded: AtomicU64,
    pub commands_dropped: AtomicU64,
    pub assets: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub telemetry_accepted: u64,
    pub telemetry_rejected: u64,
    pub telemetry_dropped: u64,
    pub alerts_published: u64,
    pub alerts_suppressed: u64,
    pub alerts_dropped: u64,
    pub commands_forwarded: u64,
    pub commands_dropped: u64,
    pub assets: u64,
    pub mqtt_connected: bool,
    pub last_error: Option<String>,
}

impl AlertStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            telemetry_accepted: self.telemetry_accepted.load(Ordering::Relaxed),
            telemetry_rejected: self.telemetry_rejected.load(Ordering::Relaxed),
            telemetry_dropped: self.telemetry_dropped.load(Ordering::Relaxed),
            alerts_published: self.alerts_published.load(Ordering::Relaxed),
            alerts_suppressed: self.alerts_suppressed.load(Ordering::Relaxed),
            alerts_dropped: self.alerts_dropped.load(Ordering::Relaxed),
            commands_forwarded: self.commands_forwarded.load(Ordering::Relaxed),
            commands_dropped: self.commands_dropped.load(Ordering::Relaxed),
            assets: self.assets.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}
