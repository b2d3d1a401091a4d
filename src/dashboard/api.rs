// Dashboard API - read-only snapshots plus token-gated mutations
// Served by axum; CORS and request tracing wrap the whole router.

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::dashboard::push::push_handler;
use crate::dashboard::state::DashboardState;

pub struct DashboardServer {
    state: Arc<DashboardState>,
}

impl DashboardServer {
    pub fn new(state: Arc<DashboardState>) -> Self {
        Self { state }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/health", get(health))
            .route("/api/stats", get(get_stats))
            .route("/api/coins", get(get_coins))
            .route("/api/signals", get(get_signals))
            .route("/api/orderflow/:symbol", get(get_order_flow))
            .route("/api/coins/add", post(add_coin))
            .route("/api/coins/remove/:symbol", delete(remove_coin))
            .route("/api/coins/:symbol/toggle", patch(toggle_coin))
            .route("/api/export/signals.csv", get(export_signals_csv))
            .route("/ws", get(push_handler))
            .with_state(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve. A bind failure here is fatal at boot.
    pub async fn serve(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = addr, "Dashboard listening");
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn check_rate(state: &DashboardState, addr: SocketAddr) -> Result<(), StatusCode> {
    if state.check_rate_limit(addr.ip(), now_ms()) {
        Ok(())
    } else {
        warn!(addr = %addr, "Dashboard rate limit hit");
        Err(StatusCode::TOO_MANY_REQUESTS)
    }
}

fn check_token(state: &DashboardState, headers: &HeaderMap) -> Result<(), StatusCode> {
    if !state.auth_required() {
        return Ok(());
    }
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;
    if state.token_matches(presented) {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

fn validate_symbol(symbol: &str) -> Result<String, StatusCode> {
    let symbol = symbol.trim().to_uppercase();
    let valid = !symbol.is_empty()
        && symbol.len() <= 24
        && symbol.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(symbol)
    } else {
        Err(StatusCode::BAD_REQUEST)
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn get_stats(
    State(state): State<Arc<DashboardState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<impl IntoResponse, StatusCode> {
    check_rate(&state, addr)?;
    Ok(Json(state.counters()))
}

async fn get_coins(
    State(state): State<Arc<DashboardState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<impl IntoResponse, StatusCode> {
    check_rate(&state, addr)?;
    Ok(Json(json!({"coins": state.coins()})))
}

#[derive(Deserialize)]
struct SignalsQuery {
    limit: Option<usize>,
}

async fn get_signals(
    State(state): State<Arc<DashboardState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<SignalsQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    check_rate(&state, addr)?;
    let limit = query.limit.unwrap_or(50).min(500);
    Ok(Json(json!({"signals": state.recent_signals(limit)})))
}

async fn get_order_flow(
    State(state): State<Arc<DashboardState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    check_rate(&state, addr)?;
    let symbol = validate_symbol(&symbol)?;
    match state.order_flow_for(&symbol) {
        Some(summary) => Ok(Json(serde_json::to_value(summary).unwrap_or_default())),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Deserialize)]
struct AddCoinRequest {
    symbol: String,
}

async fn add_coin(
    State(state): State<Arc<DashboardState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<AddCoinRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    check_rate(&state, addr)?;
    check_token(&state, &headers)?;
    let symbol = validate_symbol(&request.symbol)?;

    if state.add_coin(&symbol) {
        info!(symbol = %symbol, "Coin added via dashboard");
        Ok(Json(json!({"added": symbol})))
    } else {
        Err(StatusCode::CONFLICT)
    }
}

async fn remove_coin(
    State(state): State<Arc<DashboardState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(symbol): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    check_rate(&state, addr)?;
    check_token(&state, &headers)?;
    let symbol = validate_symbol(&symbol)?;

    if state.remove_coin(&symbol) {
        info!(symbol = %symbol, "Coin removed via dashboard");
        Ok(Json(json!({"removed": symbol})))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(Deserialize)]
struct ToggleCoinRequest {
    active: bool,
}

async fn toggle_coin(
    State(state): State<Arc<DashboardState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(symbol): Path<String>,
    Json(request): Json<ToggleCoinRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    check_rate(&state, addr)?;
    check_token(&state, &headers)?;
    let symbol = validate_symbol(&symbol)?;

    if state.toggle_coin(&symbol, request.active) {
        Ok(Json(json!({"symbol": symbol, "active": request.active})))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn export_signals_csv(
    State(state): State<Arc<DashboardState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    check_token(&state, &headers)?;

    let signals = state
        .db
        .recent_signals(1_000)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let mut csv = String::from(
        "id,ts,symbol,kind,direction,entry,stop,target,confidence,priority,context,delivery_status\n",
    );
    for s in signals {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{:.1},{},{},{}\n",
            s.id,
            s.ts,
            s.symbol,
            s.kind,
            s.direction,
            s.entry,
            s.stop,
            s.target,
            s.confidence,
            s.priority,
            s.context.unwrap_or_default(),
            s.delivery_status,
        ));
    }

    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/csv")],
        csv,
    ))
}
