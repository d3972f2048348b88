//! HTTP dashboard surface over the store, analytics engine, and broadcast
//! hub (C9).

use crate::analytics::{AnalyticsEngine, Window};
use crate::broadcast::BroadcastHub;
use crate::record::TransportType;
use crate::store::MessageStore;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::debug;

const SUBSCRIBER_PING_IDLE: Duration = Duration::from_secs(30);

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<MessageStore>,
    pub hub: BroadcastHub,
    pub with_mcp: bool,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/logs", get(logs))
        .route("/api/metrics/timeseries", get(metrics_timeseries))
        .route("/api/metrics/methods", get(metrics_methods))
        .route("/api/metrics/transport", get(metrics_transport))
        .route("/api/metrics/message-types", get(metrics_message_types))
        .route("/api/metrics/performance", get(metrics_performance))
        .route("/api/metrics/errors", get(metrics_errors))
        .route("/ws", get(ws_subscribe))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({ "with_mcp": state.with_mcp }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn logs(State(state): State<ApiState>, Query(q): Query<LogsQuery>) -> Response {
    let limit = q.limit.unwrap_or(100);
    match state.store.fetch_recent(limit) {
        Ok(records) => Json(json!({ "count": records.len(), "records": records })).into_response(),
        Err(e) => api_error(e),
    }
}

/// Shared query parameters accepted by every `/api/metrics/*` endpoint.
#[derive(Debug, Deserialize, Default)]
struct MetricsQuery {
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    interval_minutes: Option<i64>,
    transport_type: Option<String>,
    server_name: Option<String>,
    limit: Option<usize>,
}

impl MetricsQuery {
    fn window(&self) -> Window {
        Window {
            start: self.start_time,
            end: self.end_time,
            transport_type: self.transport_type.as_deref().map(TransportType::parse),
            server_name: self.server_name.clone(),
        }
    }
}

async fn metrics_timeseries(State(state): State<ApiState>, Query(q): Query<MetricsQuery>) -> Response {
    let engine = AnalyticsEngine::new(&state.store);
    let bucket = q.interval_minutes.unwrap_or(5);
    match engine.timeseries(bucket, &q.window()) {
        Ok(result) => Json(result).into_response(),
        Err(e) => api_error(e),
    }
}

async fn metrics_methods(State(state): State<ApiState>, Query(q): Query<MetricsQuery>) -> Response {
    let engine = AnalyticsEngine::new(&state.store);
    let limit = q.limit.unwrap_or(10);
    match engine.method_frequency(limit, &q.window()) {
        Ok(result) => Json(result).into_response(),
        Err(e) => api_error(e),
    }
}

async fn metrics_transport(State(state): State<ApiState>, Query(q): Query<MetricsQuery>) -> Response {
    let engine = AnalyticsEngine::new(&state.store);
    match engine.transport_distribution(&q.window()) {
        Ok(result) => Json(result).into_response(),
        Err(e) => api_error(e),
    }
}

async fn metrics_message_types(State(state): State<ApiState>, Query(q): Query<MetricsQuery>) -> Response {
    let engine = AnalyticsEngine::new(&state.store);
    match engine.message_type_distribution(&q.window()) {
        Ok(result) => Json(result).into_response(),
        Err(e) => api_error(e),
    }
}

async fn metrics_performance(State(state): State<ApiState>, Query(q): Query<MetricsQuery>) -> Response {
    let engine = AnalyticsEngine::new(&state.store);
    match engine.performance(&q.window()) {
        Ok(result) => Json(result).into_response(),
        Err(e) => api_error(e),
    }
}

async fn metrics_errors(State(state): State<ApiState>, Query(q): Query<MetricsQuery>) -> Response {
    let engine = AnalyticsEngine::new(&state.store);
    let bucket = q.interval_minutes.unwrap_or(5);
    match engine.error_timeline(bucket, &q.window()) {
        Ok(result) => Json(result).into_response(),
        Err(e) => api_error(e),
    }
}

async fn ws_subscribe(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| handle_subscriber(socket, state.hub))
}

async fn handle_subscriber(mut socket: WebSocket, hub: BroadcastHub) {
    let mut subscription = hub.subscribe();
    loop {
        tokio::select! {
            record = subscription.recv() => {
                let Some(record) = record else { break };
                let text = match serde_json::to_string(&record) {
                    Ok(t) => t,
                    Err(e) => { debug!(error = %e, "ws: failed to serialize record"); continue; }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(SUBSCRIBER_PING_IDLE) => {
                if socket.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn api_error(err: anyhow::Error) -> Response {
    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response()
}
