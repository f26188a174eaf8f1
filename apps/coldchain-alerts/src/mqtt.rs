use crate::bus::{parse_topic, subscription_filters, MqttBus, Publisher, Topic};
use crate::relay::CommandRelay;
use crate::router::AssetRouter;
use crate::stats::AlertStats;
use crate::telemetry;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rumqttc::{Event, EventLoop, Incoming};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Drives the MQTT event loop until `cancel` fires. Subscriptions are re-issued on every
/// ConnAck, so broker restarts and network drops recover without operator action.
pub async fn run_listener(
    topic_prefix: String,
    bus: MqttBus,
    mut eventloop: EventLoop,
    router: AssetRouter<MqttBus>,
    relay: CommandRelay,
    stats: Arc<AlertStats>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                stats.set_mqtt_connected(true);
                for filter in subscription_filters(&topic_prefix) {
                    if let Err(err) = bus.subscribe(&filter) {
                        tracing::warn!(%filter, error = %err, "failed to subscribe");
                    }
                }
                tracing::info!(prefix = %topic_prefix, "MQTT connected; subscribed to asset topics");
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                route_publish(
                    &topic_prefix,
                    &publish.topic,
                    &publish.payload,
                    Utc::now(),
                    &router,
                    &relay,
                    &stats,
                );
            }
            Ok(_) => {}
            Err(err) => {
                if stats.mqtt_connected.swap(false, Ordering::Relaxed) {
                    tracing::warn!(error = %err, "MQTT connection lost; reconnecting");
                } else {
                    tracing::debug!(error = %err, "MQTT reconnect failed");
                }
                stats.record_error(err.to_string());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }

    stats.set_mqtt_connected(false);
    tracing::info!("MQTT listener stopped");
    Ok(())
}

/// Classifies one inbound message by topic and hands it off without waiting.
pub fn route_publish<P: Publisher>(
    topic_prefix: &str,
    topic: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
    router: &AssetRouter<P>,
    relay: &CommandRelay,
    stats: &AlertStats,
) {
    match parse_topic(topic_prefix, topic) {
        Some(Topic::Telemetry(asset_id)) => match telemetry::decode(asset_id, payload, received_at) {
            Ok(record) => router.route_telemetry(record),
            Err(err) => {
                AlertStats::incr(&stats.telemetry_rejected);
                tracing::warn!(%asset_id, error = %err, "telemetry rejected");
            }
        },
        Some(Topic::CommandRequest(asset_id)) => relay.forward(asset_id, payload),
        Some(Topic::Location(_)) | Some(Topic::Alert(_)) | Some(Topic::Command(_)) => {}
        None => tracing::debug!(%topic, "ignoring message on unrecognized topic"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertKind, AlertLevel};
    use crate::test_support::{test_config, MemoryBus};

    struct Harness {
        bus: MemoryBus,
        router: AssetRouter<MemoryBus>,
        relay: CommandRelay,
        relay_task: tokio::task::JoinHandle<()>,
        stats: Arc<AlertStats>,
    }

    fn harness() -> Harness {
        let bus = MemoryBus::new();
        let config = test_config();
        let stats = Arc::new(AlertStats::new());
        let cancel = CancellationToken::new();
        let router = AssetRouter::new(bus.clone(), &config, stats.clone(), cancel.clone());
        let (relay, relay_task) = CommandRelay::spawn(bus.clone(), &config, stats.clone(), cancel);
        Harness {
            bus,
            router,
            relay,
            relay_task,
            stats,
        }
    }

    impl Harness {
        fn send(&self, topic: &str, payload: &[u8]) {
            route_publish(
                "coldchain",
                topic,
                payload,
                Utc::now(),
                &self.router,
                &self.relay,
                &self.stats,
            );
        }
    }

    #[tokio::test]
    async fn telemetry_reaches_asset_worker() {
        let h = harness();
        h.send("coldchain/truck_001/telemetry", br#"{"temp": 11.2, "door_open": false}"#);

        let snapshots = h.router.snapshot().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].level, AlertLevel::Critical);
        let alerts = h.bus.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertKind::Critical);
        assert_eq!(alerts[0].asset_id, "truck_001");
    }

    #[tokio::test]
    async fn malformed_telemetry_is_counted_and_skipped() {
        let h = harness();
        h.send("coldchain/truck_001/telemetry", b"{\"temp\": ");
        h.send("coldchain/truck_001/telemetry", br#"{"door_open": true}"#);

        assert!(h.router.snapshot().await.is_empty());
        assert_eq!(h.stats.snapshot().telemetry_rejected, 2);
        assert!(h.bus.published().is_empty());
    }

    #[tokio::test]
    async fn location_and_own_topics_are_ignored() {
        let h = harness();
        h.send("coldchain/truck_001/location", br#"{"lat": 52.1, "lon": 4.3}"#);
        h.send("coldchain/truck_001/alert", br#"{"level": "critical"}"#);
        h.send("coldchain/truck_001/command", b"reboot");
        h.send("elsewhere/truck_001/telemetry", br#"{"temp": 20}"#);

        assert!(h.router.snapshot().await.is_empty());
        assert_eq!(h.stats.snapshot().telemetry_rejected, 0);
        drop(h.relay);
        h.relay_task.await.unwrap();
        assert!(h.bus.published().is_empty());
    }

    #[tokio::test]
    async fn command_request_is_relayed_to_device_topic() {
        let h = harness();
        h.send("coldchain/truck_001/command/request", br#"{"cmd":"defrost"}"#);
        drop(h.relay);
        h.relay_task.await.unwrap();

        assert_eq!(
            h.bus.published(),
            vec![(
                "coldchain/truck_001/command".to_string(),
                br#"{"cmd":"defrost"}"#.to_vec()
            )]
        );
    }
}
