use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::collector::aggregator::ConsensusAggregator;
use crate::collector::broadcaster::EventBroadcaster;
use crate::collector::liveness::LivenessTracker;

pub mod error;
pub mod models;
pub mod report_routes;
pub mod websocket_handler;

pub struct AppState {
    pub pool: PgPool,
    pub broadcaster: Arc<EventBroadcaster>,
    pub aggregator: Arc<ConsensusAggregator>,
    pub liveness: Arc<LivenessTracker>,
}

async fn health_check_handler() -> &'static str {
    "OK"
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check_handler))
        .route("/api/report", post(report_routes::submit_report))
        .route("/ws", get(websocket_handler::observer_ws_handler))
        .with_state(app_state)
        .layer(cors)
}
