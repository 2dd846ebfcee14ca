//! Axum-based HTTP adapter over the charging engine

use crate::engine::ChargingEngine;
use crate::error::{ChargeError, Result};
use crate::session::SessionStatus;
use crate::tariff::Money;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub engine: ChargingEngine,
}

#[derive(Deserialize)]
pub struct StartBody {
    pub user_id: String,
}

#[derive(Deserialize)]
pub struct TopUpBody {
    pub amount: Money,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
    pub status: Option<SessionStatus>,
}

impl ChargeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChargeError::InsufficientBalance { .. } | ChargeError::InsufficientFunds { .. } => {
                StatusCode::PAYMENT_REQUIRED
            }
            ChargeError::ChargerUnavailable { .. } | ChargeError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            ChargeError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            ChargeError::Validation { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ChargeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            crate::logging::get_logger("web").error(&format!("Request failed: {}", self));
        }
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ChargeError>;

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn charger(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.charger_status())
}

async fn charger_offline(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.set_charger_offline())
}

async fn charger_online(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.clear_charger_offline())
}

async fn start_session(
    State(state): State<AppState>,
    Json(body): Json<StartBody>,
) -> std::result::Result<impl IntoResponse, ChargeError> {
    let handle = state.engine.start_charging(&body.user_id).await?;
    Ok((StatusCode::CREATED, Json(handle)))
}

async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::session::ChargingSession> {
    Ok(Json(state.engine.stop_charging_idempotent(&id).await?))
}

async fn live(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<crate::session::LiveData> {
    Ok(Json(state.engine.live_data(&id).await?))
}

async fn wallet(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<crate::wallet::BalanceSnapshot> {
    Ok(Json(state.engine.wallet().snapshot(&user_id).await?))
}

async fn top_up(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<TopUpBody>,
) -> ApiResult<serde_json::Value> {
    let tx = state.engine.top_up(&user_id, body.amount).await?;
    let balance = state.engine.wallet().snapshot(&user_id).await?;
    Ok(Json(serde_json::json!({
        "transaction": tx,
        "wallet": balance,
    })))
}

async fn history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<crate::session::ChargingSession>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    Ok(Json(
        state
            .engine
            .history_filtered(&user_id, params.status, limit)
            .await?,
    ))
}

async fn transactions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<crate::ledger::WalletTransaction>> {
    Ok(Json(state.engine.transactions(&user_id).await?))
}

async fn stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<crate::session::UserStats> {
    Ok(Json(state.engine.user_stats(&user_id).await?))
}

async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.engine.subscribe_events();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(ev) => Event::default()
            .event(ev.name())
            .json_data(&ev)
            .ok()
            .map(Ok::<Event, std::convert::Infallible>),
        // Lagged receivers skip ahead
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/charger", get(charger))
        .route("/api/charger/offline", post(charger_offline))
        .route("/api/charger/online", post(charger_online))
        .route("/api/sessions", post(start_session))
        .route("/api/sessions/{id}/stop", post(stop_session))
        .route("/api/sessions/{id}/live", get(live))
        .route("/api/users/{id}/wallet", get(wallet))
        .route("/api/users/{id}/wallet/topup", post(top_up))
        .route("/api/users/{id}/history", get(history))
        .route("/api/users/{id}/transactions", get(transactions))
        .route("/api/users/{id}/stats", get(stats))
        .route("/api/events", get(events))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(engine: ChargingEngine, host: &str, port: u16) -> Result<()> {
    let router = build_router(AppState { engine });

    let logger = crate::logging::get_logger("web");
    logger.info(&format!(
        "Starting web server; requested host={}, port={}",
        host, port
    ));

    let addr = match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => {
            logger.warn(&format!("Invalid host '{}'; falling back to 127.0.0.1", host));
            ([127, 0, 0, 1], port).into()
        }
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ChargeError::web(format!("bind {} failed: {}", addr, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| ChargeError::web(e.to_string()))?;
    logger.info(&format!(
        "Web server listening at http://{}:{}",
        local_addr.ip(),
        local_addr.port()
    ));

    axum::serve(listener, router)
        .await
        .map_err(|e| ChargeError::web(e.to_string()))
}
