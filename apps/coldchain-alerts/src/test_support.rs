use crate::alert::AlertEvent;
use crate::bus::Publisher;
use crate::config::{Config, FileOverrides};
use crate::error::TransportError;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const INJECTED_TIMEOUT: Duration = Duration::from_millis(50);

pub fn test_config() -> Config {
    let mut config = Config::resolve(|_| None, FileOverrides::default()).expect("default config");
    config.recovery_hold_seconds = 30;
    config.stale_after_seconds = 60;
    config.publish_max_attempts = 3;
    config.publish_backoff_ms = 100;
    config.publish_backoff_max_ms = 400;
    config.http_bind = None;
    config
}

#[derive(Debug, Default)]
struct MemoryBusInner {
    published: Vec<(String, Vec<u8>)>,
    attempts: u32,
    fail_next: u32,
    fail_always: bool,
}

/// In-memory bus that records publishes and can inject transport failures.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<MemoryBusInner>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, count: u32) {
        self.inner.lock().unwrap().fail_next = count;
    }

    pub fn fail_always(&self, fail: bool) {
        self.inner.lock().unwrap().fail_always = fail;
    }

    pub fn attempts(&self) -> u32 {
        self.inner.lock().unwrap().attempts
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.lock().unwrap().published.clone()
    }

    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.published()
            .into_iter()
            .filter(|(topic, _)| topic.ends_with("/alert"))
            .map(|(_, payload)| serde_json::from_slice(&payload).expect("alert payload"))
            .collect()
    }
}

impl Publisher for MemoryBus {
    async fn publish(&self, topic: String, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.attempts += 1;
        if inner.fail_always {
            return Err(TransportError::Timeout(INJECTED_TIMEOUT));
        }
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(TransportError::Timeout(INJECTED_TIMEOUT));
        }
        inner.published.push((topic, payload));
        Ok(())
    }
}
