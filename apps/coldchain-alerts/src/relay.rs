use crate::bus::{command_topic, Publisher};
use crate::config::Config;
use crate::dispatch::{publish_with_retry, RetryPolicy};
use crate::stats::AlertStats;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct CommandRequest {
    asset_id: String,
    payload: Vec<u8>,
}

/// Forwards operator commands to `{prefix}/{asset}/command` unchanged, in arrival order.
#[derive(Clone)]
pub struct CommandRelay {
    tx: mpsc::Sender<CommandRequest>,
    stats: Arc<AlertStats>,
}

impl CommandRelay {
    /// The returned task ends once every relay handle is dropped and the queue drains.
    pub fn spawn<P: Publisher>(
        publisher: P,
        config: &Config,
        stats: Arc<AlertStats>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.asset_queue_capacity);
        let worker = tokio::spawn(run_relay(
            publisher,
            config.topic_prefix.clone(),
            RetryPolicy::from_config(config),
            rx,
            stats.clone(),
            cancel,
        ));
        (Self { tx, stats }, worker)
    }

    pub fn forward(&self, asset_id: &str, payload: &[u8]) {
        let request = CommandRequest {
            asset_id: asset_id.to_string(),
            payload: payload.to_vec(),
        };
        match self.tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) | Err(TrySendError::Closed(request)) => {
                AlertStats::incr(&self.stats.commands_dropped);
                tracing::warn!(asset_id = %request.asset_id, "command relay unavailable; command dropped");
            }
        }
    }
}

async fn run_relay<P: Publisher>(
    publisher: P,
    topic_prefix: String,
    retry: RetryPolicy,
    mut rx: mpsc::Receiver<CommandRequest>,
    stats: Arc<AlertStats>,
    cancel: CancellationToken,
) {
    while let Some(request) = rx.recv().await {
        let topic = command_topic(&topic_prefix, &request.asset_id);
        match publish_with_retry(&publisher, &topic, &request.payload, &retry, &cancel).await {
            Ok(_) => {
                AlertStats::incr(&stats.commands_forwarded);
                tracing::info!(asset_id = %request.asset_id, bytes = request.payload.len(), "command forwarded");
            }
            Err(err) => {
                AlertStats::incr(&stats.commands_dropped);
                stats.record_error(err.to_string());
                tracing::warn!(asset_id = %request.asset_id, error = %err, "command dropped after publish retries");
            }
        }
    }
}
