use std::collections::BTreeMap;
use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use log::debug;

use crate::data::{Notifier, TopicStats};

#[derive(Clone)]
pub struct ApiState {
    pub prices: Arc<Notifier<Decimal>>,
    pub changes: Arc<Notifier<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PriceBoard {
    pub prices: BTreeMap<String, Decimal>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PriceQuote {
    pub key: String,
    pub value: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub topics: Vec<TopicStats>,
}

// GET /api/health - Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "stock_notifier",
        "timestamp": chrono::Utc::now()
    }))
}

// GET /api/prices - Current price board
pub async fn get_prices(State(state): State<ApiState>) -> Json<PriceBoard> {
    Json(PriceBoard {
        prices: state.prices.values(),
        timestamp: chrono::Utc::now(),
    })
}

// GET /api/prices/:key - Single price, never inserts a default
pub async fn get_price(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Result<Json<PriceQuote>, (StatusCode, String)> {
    match state.prices.get_value(&key) {
        Some(value) => Ok(Json(PriceQuote { key, value })),
        None => {
            debug!("Price lookup for unknown key {}", key);
            Err((StatusCode::NOT_FOUND, format!("No price for {}", key)))
        }
    }
}

// GET /api/stats - Per topic registry and delivery counters
pub async fn get_stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        topics: vec![state.prices.get_stats(), state.changes.get_stats()],
    })
}

// Create the API router
pub fn create_api_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/prices", get(get_prices))
        .route("/prices/:key", get(get_price))
        .route("/stats", get(get_stats))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
}
