use crate::config::Config;
use crate::error::TransportError;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use std::future::Future;
use std::time::Duration;

/// Outbound half of the message bus. Implementations must be safe to share across
/// asset workers.
pub trait Publisher: Clone + Send + Sync + 'static {
    fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Shared MQTT connection. `AsyncClient` hands requests to the single event loop task,
/// so clones can publish concurrently.
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    publish_timeout: Duration,
}

impl MqttBus {
    pub fn connect(config: &Config) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            options.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }
        let (client, eventloop) = AsyncClient::new(options, 64);
        (
            Self {
                client,
                publish_timeout: config.publish_timeout(),
            },
            eventloop,
        )
    }

    /// Non-blocking so it can be issued from inside the event loop task.
    pub fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.client.try_subscribe(filter, QoS::AtLeastOnce)?;
        Ok(())
    }
}

impl Publisher for MqttBus {
    async fn publish(&self, topic: String, payload: Vec<u8>) -> Result<(), TransportError> {
        tokio::time::timeout(
            self.publish_timeout,
            self.client.publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.publish_timeout))??;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic<'a> {
    Telemetry(&'a str),
    Location(&'a str),
    Alert(&'a str),
    Command(&'a str),
    CommandRequest(&'a str),
}

pub fn parse_topic<'a>(prefix: &str, topic: &'a str) -> Option<Topic<'a>> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();
    let asset_id = *parts.first()?;
    if asset_id.is_empty() {
        return None;
    }
    match parts[1..] {
        ["telemetry"] => Some(Topic::Telemetry(asset_id)),
        ["location"] => Some(Topic::Location(asset_id)),
        ["alert"] => Some(Topic::Alert(asset_id)),
        ["command"] => Some(Topic::Command(asset_id)),
        ["command", "request"] => Some(Topic::CommandRequest(asset_id)),
        _ => None,
    }
}

pub fn alert_topic(prefix: &str, asset_id: &str) -> String {
    format!("{prefix}/{asset_id}/alert")
}

pub fn command_topic(prefix: &str, asset_id: &str) -> String {
    format!("{prefix}/{asset_id}/command")
}

/// Filters the service listens on: device telemetry and operator command requests.
pub fn subscription_filters(prefix: &str) -> [String; 2] {
    [
        format!("{prefix}/+/telemetry"),
        format!("{prefix}/+/command/request"),
    ]
}
