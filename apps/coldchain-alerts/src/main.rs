use anyhow::{Context, Result};
use clap::Parser;
use coldchain_alerts::bus::MqttBus;
use coldchain_alerts::config::Config;
use coldchain_alerts::relay::CommandRelay;
use coldchain_alerts::router::AssetRouter;
use coldchain_alerts::stats::AlertStats;
use coldchain_alerts::{cli, http, mqtt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,coldchain_alerts=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    init_tracing()?;
    let config = Config::from_env(args.config.as_deref()).context("invalid configuration")?;

    if args.check_config {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "mqtt": format!("{}:{}", config.mqtt_host, config.mqtt_port),
                "topic_prefix": config.topic_prefix,
                "thresholds": config.thresholds,
                "recovery_hold_seconds": config.recovery_hold_seconds,
                "stale_after_seconds": config.stale_after_seconds,
            }))?
        );
        return Ok(());
    }

    let stats = Arc::new(AlertStats::new());
    // Listener and ticker stop first; retries are only abandoned once the grace period ends.
    let intake_cancel = CancellationToken::new();
    let retry_cancel = CancellationToken::new();

    let (bus, eventloop) = MqttBus::connect(&config);
    let router = AssetRouter::new(bus.clone(), &config, stats.clone(), retry_cancel.clone());
    let (relay, relay_task) =
        CommandRelay::spawn(bus.clone(), &config, stats.clone(), retry_cancel.clone());
    let ticker = router.spawn_stale_ticker(config.stale_check_interval(), intake_cancel.clone());

    let mut listener = tokio::spawn(mqtt::run_listener(
        config.topic_prefix.clone(),
        bus,
        eventloop,
        router.clone(),
        relay,
        stats.clone(),
        intake_cancel.clone(),
    ));

    if let Some(bind) = config.http_bind.as_deref() {
        let app = http::router(http::HttpState {
            router: router.clone(),
            stats: stats.clone(),
        });
        let tcp = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind status listener on {bind}"))?;
        tracing::info!(%bind, "coldchain-alerts HTTP listening");
        let http_cancel = intake_cancel.clone();
        tokio::spawn(async move {
            axum::serve(tcp, app)
                .with_graceful_shutdown(async move { http_cancel.cancelled().await })
                .await
                .ok();
        });
    }

    tracing::info!(
        broker = %format!("{}:{}", config.mqtt_host, config.mqtt_port),
        prefix = %config.topic_prefix,
        warning_low = config.thresholds.warning_low,
        warning_high = config.thresholds.warning_high,
        critical_low = config.thresholds.critical_low,
        critical_high = config.thresholds.critical_high,
        "coldchain-alerts started"
    );

    let listener_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            false
        }
        res = &mut listener => {
            match res {
                Ok(Ok(())) => tracing::warn!("MQTT listener exited"),
                Ok(Err(err)) => tracing::error!(error = %err, "MQTT listener failed"),
                Err(err) => tracing::error!(error = %err, "MQTT listener panicked"),
            }
            true
        }
    };

    intake_cancel.cancel();
    if !listener_done {
        let _ = listener.await;
    }
    let _ = ticker.await;

    router.shutdown(config.shutdown_grace()).await;
    if tokio::time::timeout(config.shutdown_grace(), relay_task)
        .await
        .is_err()
    {
        tracing::warn!("command relay did not drain before shutdown");
    }
    retry_cancel.cancel();

    tracing::info!(stats = ?stats.snapshot(), "coldchain-alerts stopped");
    Ok(())
}
