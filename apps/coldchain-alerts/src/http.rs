use crate::alert::{AlertLevel, AssetSnapshot};
use crate::bus::Publisher;
use crate::router::AssetRouter;
use crate::stats::{AlertStats, StatsSnapshot};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

pub struct HttpState<P> {
    pub router: AssetRouter<P>,
    pub stats: Arc<AlertStats>,
}

impl<P> Clone for HttpState<P> {
    fn clone(&self) -> Self {
        Self {
            router: self.router.clone(),
            stats: self.stats.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: &'static str,
    assets_warning: usize,
    assets_critical: usize,
    assets_silent: usize,
    #[serde(flatten)]
    stats: StatsSnapshot,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status<P: Publisher>(State(state): State<HttpState<P>>) -> Json<StatusResponse> {
    let assets = state.router.snapshot().await;
    let at_level = |level: AlertLevel| assets.iter().filter(|a| a.level == level).count();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        assets_warning: at_level(AlertLevel::Warning),
        assets_critical: at_level(AlertLevel::Critical),
        assets_silent: assets.iter().filter(|a| a.silent).count(),
        stats: state.stats.snapshot(),
    })
}

async fn get_assets<P: Publisher>(State(state): State<HttpState<P>>) -> Json<Vec<AssetSnapshot>> {
    Json(state.router.snapshot().await)
}

pub fn router<P: Publisher>(state: HttpState<P>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status::<P>))
        .route("/v1/assets", get(get_assets::<P>))
        .with_state(state)
}
