use crate::alert::{AlertEvent, AlertPolicy, AlertState, AssetSnapshot};
use crate::bus::Publisher;
use crate::config::Config;
use crate::dispatch::{DispatchOutcome, Dispatcher, RetryPolicy};
use crate::stats::AlertStats;
use crate::telemetry::TelemetryRecord;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum AssetInput {
    Telemetry(TelemetryRecord),
    Tick(DateTime<Utc>),
    Snapshot(oneshot::Sender<AssetSnapshot>),
}

struct AssetHandle {
    tx: mpsc::Sender<AssetInput>,
    join: JoinHandle<()>,
}

struct WorkerContext<P> {
    publisher: P,
    topic_prefix: String,
    policy: AlertPolicy,
    retry: RetryPolicy,
    alerts_per_minute: u32,
    queue_capacity: usize,
    stats: Arc<AlertStats>,
    cancel: CancellationToken,
}

impl<P: Publisher> WorkerContext<P> {
    fn dispatcher(&self) -> Dispatcher<P> {
        Dispatcher::new(
            self.publisher.clone(),
            self.topic_prefix.clone(),
            self.retry,
            self.alerts_per_minute,
            self.stats.clone(),
            self.cancel.clone(),
        )
    }
}

/// Routes decoded telemetry to one worker task per asset. Workers are created on first
/// sight of an asset and each owns that asset's `AlertState`.
pub struct AssetRouter<P> {
    assets: Arc<Mutex<HashMap<String, AssetHandle>>>,
    ctx: Arc<WorkerContext<P>>,
}

impl<P> Clone for AssetRouter<P> {
    fn clone(&self) -> Self {
        Self {
            assets: self.assets.clone(),
            ctx: self.ctx.clone(),
        }
    }
}

impl<P: Publisher> AssetRouter<P> {
    /// `cancel` aborts in-flight publish retries of every worker.
    pub fn new(
        publisher: P,
        config: &Config,
        stats: Arc<AlertStats>,
        cancel: CancellationToken,
    ) -> Self {
        let ctx = WorkerContext {
            publisher,
            topic_prefix: config.topic_prefix.clone(),
            policy: config.alert_policy(),
            retry: RetryPolicy::from_config(config),
            alerts_per_minute: config.alerts_per_minute,
            queue_capacity: config.asset_queue_capacity,
            stats,
            cancel,
        };
        Self {
            assets: Arc::new(Mutex::new(HashMap::new())),
            ctx: Arc::new(ctx),
        }
    }

    fn lock_assets(&self) -> MutexGuard<'_, HashMap<String, AssetHandle>> {
        self.assets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Never waits: a full asset queue drops the record.
    pub fn route_telemetry(&self, record: TelemetryRecord) {
        let mut assets = self.lock_assets();
        let asset_id = record.asset_id.clone();

        let tx = match assets.get(&asset_id) {
            Some(handle) if !handle.tx.is_closed() => handle.tx.clone(),
            existing => {
                if existing.is_some() {
                    tracing::warn!(asset_id = %asset_id, "asset worker exited; restarting");
                } else {
                    AlertStats::incr(&self.ctx.stats.assets);
                    tracing::info!(asset_id = %asset_id, "tracking new asset");
                }
                let handle = spawn_worker(self.ctx.clone(), &asset_id, record.received_at);
                let tx = handle.tx.clone();
                assets.insert(asset_id.clone(), handle);
                tx
            }
        };
        drop(assets);

        match tx.try_send(AssetInput::Telemetry(record)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                AlertStats::incr(&self.ctx.stats.telemetry_dropped);
                tracing::warn!(asset_id = %asset_id, "asset queue full; telemetry dropped");
            }
            Err(TrySendError::Closed(_)) => {
                AlertStats::incr(&self.ctx.stats.telemetry_dropped);
                tracing::warn!(asset_id = %asset_id, "asset worker closed; telemetry dropped");
            }
        }
    }

    /// Sends a staleness tick to every worker without waiting on busy ones.
    pub fn broadcast_tick(&self, now: DateTime<Utc>) {
        let assets = self.lock_assets();
        for (asset_id, handle) in assets.iter() {
            if let Err(TrySendError::Full(_)) = handle.tx.try_send(AssetInput::Tick(now)) {
                tracing::debug!(asset_id = %asset_id, "asset queue full; tick skipped");
            }
        }
    }

    pub fn spawn_stale_ticker(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => router.broadcast_tick(Utc::now()),
                }
            }
        })
    }

    /// Queues behind pending inputs, so busy assets are reported once their backlog drains.
    /// Assets that do not answer within `SNAPSHOT_TIMEOUT` are left out.
    pub async fn snapshot(&self) -> Vec<AssetSnapshot> {
        let senders: Vec<(String, mpsc::Sender<AssetInput>)> = {
            let assets = self.lock_assets();
            assets
                .iter()
                .map(|(asset_id, handle)| (asset_id.clone(), handle.tx.clone()))
                .collect()
        };

        let deadline = Instant::now() + SNAPSHOT_TIMEOUT;
        let mut out = Vec::with_capacity(senders.len());
        for (asset_id, tx) in senders {
            let (reply, rx) = oneshot::channel();
            let request = async {
                tx.send(AssetInput::Snapshot(reply)).await.ok()?;
                rx.await.ok()
            };
            match tokio::time::timeout_at(deadline, request).await {
                Ok(Some(snapshot)) => out.push(snapshot),
                Ok(None) => {}
                Err(_) => tracing::warn!(asset_id = %asset_id, "asset snapshot timed out"),
            }
        }
        out.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));
        out
    }

    /// Closes every asset queue and waits for workers to drain. Retries still running
    /// after `grace` are abandoned.
    pub async fn shutdown(&self, grace: Duration) {
        let mut joins: Vec<JoinHandle<()>> = {
            let mut assets = self.lock_assets();
            assets.drain().map(|(_, handle)| handle.join).collect()
        };

        let drained = tokio::time::timeout(grace, async {
            while let Some(join) = joins.last_mut() {
                let _ = join.await;
                joins.pop();
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                pending = joins.len(),
                "shutdown grace elapsed; abandoning in-flight alert retries"
            );
            self.ctx.cancel.cancel();
            for join in joins {
                let _ = join.await;
            }
        }
    }
}

fn spawn_worker<P: Publisher>(
    ctx: Arc<WorkerContext<P>>,
    asset_id: &str,
    first_seen: DateTime<Utc>,
) -> AssetHandle {
    let (tx, rx) = mpsc::channel(ctx.queue_capacity);
    let state = AlertState::new(asset_id, first_seen);
    let join = tokio::spawn(run_asset_worker(state, rx, ctx));
    AssetHandle { tx, join }
}

async fn run_asset_worker<P: Publisher>(
    mut state: AlertState,
    mut rx: mpsc::Receiver<AssetInput>,
    ctx: Arc<WorkerContext<P>>,
) {
    let mut dispatcher = ctx.dispatcher();

    while let Some(input) = rx.recv().await {
        match input {
            AssetInput::Telemetry(record) => {
                AlertStats::incr(&ctx.stats.telemetry_accepted);
                tracing::trace!(
                    asset_id = %record.asset_id,
                    temperature = record.temperature,
                    door_open = record.door_open,
                    "telemetry"
                );
                if let Some(event) = state.observe(&record, &ctx.policy) {
                    deliver(&mut state, &mut dispatcher, event).await;
                }
            }
            AssetInput::Tick(now) => {
                if let Some(event) = state.undelivered() {
                    deliver(&mut state, &mut dispatcher, event).await;
                }
                if let Some(event) = state.check_stale(now, &ctx.policy) {
                    tracing::warn!(asset_id = %state.asset_id(), "asset went silent");
                    deliver(&mut state, &mut dispatcher, event).await;
                }
            }
            AssetInput::Snapshot(reply) => {
                let _ = reply.send(state.snapshot());
            }
        }
    }

    tracing::debug!(asset_id = %state.asset_id(), "asset worker stopped");
}

async fn deliver<P: Publisher>(
    state: &mut AlertState,
    dispatcher: &mut Dispatcher<P>,
    event: AlertEvent,
) {
    match dispatcher.dispatch(state.last_dispatched_level(), &event).await {
        DispatchOutcome::Published => state.mark_dispatched(&event),
        DispatchOutcome::Suppressed => {}
        DispatchOutcome::Dropped => state.mark_undelivered(event),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertKind, AlertLevel};
    use crate::test_support::{test_config, MemoryBus};
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap()
    }

    fn reading(asset_id: &str, offset_secs: i64, temperature: f64) -> TelemetryRecord {
        let at = base() + chrono::Duration::seconds(offset_secs);
        TelemetryRecord {
            asset_id: asset_id.to_string(),
            timestamp: at,
            received_at: at,
            temperature,
            door_open: false,
            battery: None,
        }
    }

    fn router(bus: &MemoryBus) -> AssetRouter<MemoryBus> {
        AssetRouter::new(
            bus.clone(),
            &test_config(),
            Arc::new(AlertStats::new()),
            CancellationToken::new(),
        )
    }

    async fn settle(router: &AssetRouter<MemoryBus>) -> Vec<AssetSnapshot> {
        // Snapshot requests queue behind earlier inputs, so this waits for them.
        router.snapshot().await
    }

    #[tokio::test]
    async fn workers_are_created_lazily_per_asset() {
        let bus = MemoryBus::new();
        let router = router(&bus);
        assert!(settle(&router).await.is_empty());

        router.route_telemetry(reading("truck_001", 0, 5.0));
        router.route_telemetry(reading("truck_002", 0, 11.0));
        router.route_telemetry(reading("truck_001", 1, 9.0));

        let snapshots = settle(&router).await;
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].asset_id, "truck_001");
        assert_eq!(snapshots[0].level, AlertLevel::Warning);
        assert_eq!(snapshots[1].asset_id, "truck_002");
        assert_eq!(snapshots[1].level, AlertLevel::Critical);

        let mut topics: Vec<String> = bus.published().into_iter().map(|(t, _)| t).collect();
        topics.sort();
        assert_eq!(
            topics,
            vec!["coldchain/truck_001/alert", "coldchain/truck_002/alert"]
        );
        assert_eq!(router.ctx.stats.snapshot().assets, 2);
    }

    #[tokio::test]
    async fn duplicate_delivery_emits_nothing_extra() {
        let bus = MemoryBus::new();
        let router = router(&bus);
        let record = reading("truck_001", 0, 11.0);
        router.route_telemetry(record.clone());
        router.route_telemetry(record.clone());
        router.route_telemetry(record);
        settle(&router).await;

        let alerts = bus.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertKind::Critical);
    }

    #[tokio::test]
    async fn silence_is_reported_once() {
        let bus = MemoryBus::new();
        let router = router(&bus);
        router.route_telemetry(reading("truck_001", 0, 5.0));
        settle(&router).await;

        for secs in [30, 61, 62, 120, 600] {
            router.broadcast_tick(base() + chrono::Duration::seconds(secs));
        }
        let snapshots = settle(&router).await;
        assert!(snapshots[0].silent);
        assert_eq!(snapshots[0].level, AlertLevel::Critical);

        let alerts = bus.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertKind::Critical);
        assert!(alerts[0].message.contains("silent"));
        assert_eq!(alerts[0].temperature, None);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_alert_is_retried_on_next_tick() {
        let bus = MemoryBus::new();
        bus.fail_always(true);
        let router = router(&bus);
        router.route_telemetry(reading("truck_001", 0, 9.0));
        let snapshots = settle(&router).await;
        assert_eq!(snapshots[0].level, AlertLevel::Warning);
        assert_eq!(snapshots[0].last_dispatched_level, None);
        assert!(bus.published().is_empty());

        bus.fail_always(false);
        router.broadcast_tick(base() + chrono::Duration::seconds(1));
        let snapshots = settle(&router).await;
        assert_eq!(snapshots[0].last_dispatched_level, Some(AlertKind::Warning));

        router.broadcast_tick(base() + chrono::Duration::seconds(2));
        settle(&router).await;
        let alerts = bus.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertKind::Warning);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let bus = MemoryBus::new();
        let mut config = test_config();
        config.asset_queue_capacity = 1;
        let stats = Arc::new(AlertStats::new());
        let router = AssetRouter::new(bus.clone(), &config, stats.clone(), CancellationToken::new());

        // The current-thread test runtime cannot run the worker until we yield.
        for offset in 0..5 {
            router.route_telemetry(reading("truck_001", offset, 5.0));
        }
        assert_eq!(stats.snapshot().telemetry_dropped, 4);

        // The queue is still full here; the snapshot must wait for it instead of skipping it.
        let snapshots = settle(&router).await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].temperature, Some(5.0));
        assert_eq!(stats.snapshot().telemetry_accepted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_stuck_retries_after_grace() {
        let bus = MemoryBus::new();
        bus.fail_always(true);
        let mut config = test_config();
        config.publish_max_attempts = 1_000;
        config.publish_backoff_ms = 1_000;
        config.publish_backoff_max_ms = 1_000;
        let cancel = CancellationToken::new();
        let router = AssetRouter::new(
            bus.clone(),
            &config,
            Arc::new(AlertStats::new()),
            cancel.clone(),
        );
        router.route_telemetry(reading("truck_001", 0, 11.0));
        tokio::task::yield_now().await;

        router.shutdown(Duration::from_secs(3)).await;
        assert!(cancel.is_cancelled());
        assert!(bus.attempts() < 10);
        assert!(router.snapshot().await.is_empty());
    }
}
