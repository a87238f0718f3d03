use std::future::Future;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::dispatcher::{DeliveryParams, Dispatcher, VerifyParams};
use crate::error::{HubError, HubResult};
use crate::feed::FeedDownloads;
use crate::wecom::AppSelector;

const APP_ID_HEADER: &str = "x-app-id";
const UPSTREAM_HEADER: &str = "x-upstream";

#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Arc<Dispatcher>,
    /// Present only when a feed and a torrent client are configured
    pub feed_downloads: Option<Arc<FeedDownloads>>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(verify_handler).post(receive_handler))
        .route("/health", get(health_handler))
        .route("/feed/add", get(feed_add_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve<F>(bind_addr: &str, state: GatewayState, shutdown: F) -> HubResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| HubError::Io(format!("Gateway bind error on {}: {}", bind_addr, e)))?;
    info!("[Gateway] Listening on {}", bind_addr);
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| HubError::Io(format!("Gateway server error: {}", e)))?;
    info!("[Gateway] Stopped");
    Ok(())
}

fn selector(headers: &HeaderMap) -> AppSelector {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    AppSelector {
        app_id: header(APP_ID_HEADER),
        upstream: header(UPSTREAM_HEADER),
    }
}

async fn verify_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(params): Query<VerifyParams>,
) -> (StatusCode, String) {
    let body = state.dispatcher.verify_url(&selector(&headers), &params);
    (StatusCode::OK, body)
}

async fn receive_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(params): Query<DeliveryParams>,
    body: String,
) -> (StatusCode, String) {
    let outcome = state
        .dispatcher
        .dispatch(&selector(&headers), &params, &body)
        .await;
    (outcome.status(), outcome.body())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    apps: Vec<String>,
    feed: bool,
}

async fn health_handler(State(state): State<GatewayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        apps: state
            .dispatcher
            .keyring()
            .app_ids()
            .map(str::to_string)
            .collect(),
        feed: state.feed_downloads.is_some(),
    })
}

#[derive(Debug, Deserialize)]
struct FeedAddQuery {
    episode_id: String,
}

async fn feed_add_handler(
    State(state): State<GatewayState>,
    Query(query): Query<FeedAddQuery>,
) -> (StatusCode, String) {
    let Some(downloads) = state.feed_downloads else {
        return (
            StatusCode::NOT_FOUND,
            "feed downloads are not configured".to_string(),
        );
    };
    match downloads.by_episode(&query.episode_id).await {
        Ok(text) => (StatusCode::OK, text),
        Err(e @ HubError::NotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
    }
}
