use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

mod config;
mod engine;
mod error;
mod normalize;
mod state;
mod store;

use crate::config::load_config;
use crate::error::ApiError;
use crate::normalize::clean_code;
use crate::state::{AppState, ChangeEvent};
use crate::store::SnapshotPayload;

// ===== HTTP handlers =====

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query("SELECT 1")
        .fetch_one(&state.db)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, format!("db error: {e}")))?;
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "database": "connected"
    })))
}

/// Postgres aborts one of two overlapping serializable snapshots with
/// SQLSTATE 40001; the whole batch rolled back, so the caller just replays.
fn map_reconcile_err(e: sqlx::Error) -> ApiError {
    if let Some(db_err) = e.as_database_error() {
        if db_err.code().as_deref() == Some("40001") {
            return ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "concurrent snapshot, retry",
            );
        }
    }
    e.into()
}

async fn ingest_snapshot(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let payload = SnapshotPayload::from_value(body).map_err(ApiError::bad_request)?;
    let day = Utc::now().date_naive();
    let plan = store::build_plan(&payload, day);
    let summary = store::apply_plan(&state.db, &plan)
        .await
        .map_err(map_reconcile_err)?;
    info!(
        agents = plan.seen.len(),
        inserted = summary.inserted,
        updated = summary.updated,
        deleted = summary.deleted,
        %day,
        "snapshot reconciled"
    );
    state.notify(ChangeEvent::Order { code: plan.last_code });
    Ok(Json(serde_json::json!({
        "ok": true,
        "inserted": summary.inserted,
        "updated": summary.updated,
        "deleted": summary.deleted
    })))
}

/// Raw two-day rows, the contract the board renderer has always consumed.
async fn get_data(State(state): State<AppState>) -> Result<Json<Vec<store::LedgerRow>>, ApiError> {
    let rows = store::fetch_board_rows(&state.db).await?;
    Ok(Json(rows))
}

/// Allocated, trend-annotated client view computed server-side.
async fn get_board(
    State(state): State<AppState>,
) -> Result<Json<Vec<engine::ClientGroup>>, ApiError> {
    let rows = store::fetch_board_rows(&state.db).await?;
    Ok(Json(engine::build_board(&rows)))
}

#[derive(Debug, Deserialize)]
struct StockAdjustRequest {
    product_code: String,
    delta_units: i64,
}

async fn adjust_stock(
    State(state): State<AppState>,
    Json(req): Json<StockAdjustRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let code = clean_code(&req.product_code);
    if code.is_empty() {
        return Err(ApiError::bad_request("product_code must not be empty"));
    }
    let stock_units = store::adjust_stock(&state.db, &code, req.delta_units).await?;
    info!(%code, delta = req.delta_units, stock_units, "stock adjusted");
    state.notify(ChangeEvent::Stock { code: code.clone() });
    Ok(Json(serde_json::json!({
        "ok": true,
        "product_code": code,
        "stock_units": stock_units
    })))
}

async fn reset(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    store::reset_all(&state.db).await?;
    warn!("ledger and stock pool truncated");
    state.notify(ChangeEvent::reset());
    Ok(Json(serde_json::json!({"ok": true})))
}

/// Live change stream. Events carry `{type, code}` as a wake-up signal;
/// keepalive comments go out on a fixed interval so idle proxies don't cut
/// the connection. Lagged or dropped receivers just fall off the bus.
async fn event_stream(State(state): State<AppState>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));

    let rx = state.bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(ev) => serde_json::to_string(&ev)
            .ok()
            .map(|data| Ok::<_, Infallible>(Event::default().data(data))),
        Err(_) => None,
    });

    let keepalive = KeepAlive::new()
        .interval(Duration::from_secs(state.cfg.events.keepalive_seconds));
    (headers, Sse::new(stream).keep_alive(keepalive)).into_response()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = Arc::new(load_config()?);

    let db = PgPoolOptions::new()
        .min_connections(cfg.database.min_pool_size)
        .max_connections(cfg.database.max_pool_size)
        .acquire_timeout(Duration::from_secs(cfg.database.acquire_timeout_seconds))
        .connect(&cfg.database.url)
        .await
        .context("failed to connect to postgres")?;
    store::init_schema(&db)
        .await
        .context("failed to initialize schema")?;

    let state = AppState::new(cfg.clone(), db);

    let allowed_headers = [AUTHORIZATION, CONTENT_TYPE, ACCEPT];
    let allowed_methods = [Method::GET, Method::POST, Method::OPTIONS];
    let cors = if cfg.api.cors_origins.iter().any(|x| x == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    } else {
        let origins: Vec<HeaderValue> = cfg
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/webhook", post(ingest_snapshot))
        .route("/api/data", get(get_data))
        .route("/api/board", get(get_board))
        .route("/api/stock", post(adjust_stock))
        .route("/api/reset", post(reset))
        .route("/api/events", get(event_stream))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.api.host, cfg.api.port).parse()?;
    info!(%addr, "production board API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
