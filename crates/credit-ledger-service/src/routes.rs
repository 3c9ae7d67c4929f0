//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post, put};
use axum::Router;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{admin, health, ledger, webhooks};
use crate::state::AppState;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Ledger (Service API key auth)
/// - `GET /v1/ledger/:user_id/balance` - Current balance
/// - `GET /v1/ledger/:user_id/transactions` - Transaction history
/// - `POST /v1/ledger/ops` - Deduct, add, refund or grant
///
/// ## Admin (admin code auth)
/// - `GET /v1/admin/plans` - Plan catalog
/// - `PUT /v1/admin/plans/:plan_id` - Create or replace a plan
/// - `GET /v1/admin/billing/:user_id` - Billing status
/// - `PUT /v1/admin/billing/:user_id` - Set billing status
///
/// ## Webhooks (Signature verification)
/// - `POST /webhooks/billing` - Billing provider events
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;
    let max_concurrent_requests = state.config.max_concurrent_requests;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    // One limit shared by every /v1 route.
    let api_routes = Router::new()
        .route("/ledger/:user_id/balance", get(ledger::get_balance))
        .route("/ledger/:user_id/transactions", get(ledger::list_transactions))
        .route("/ledger/ops", post(ledger::apply_op))
        .route("/admin/plans", get(admin::list_plans))
        .route("/admin/plans/:plan_id", put(admin::put_plan))
        .route(
            "/admin/billing/:user_id",
            get(admin::get_billing).put(admin::put_billing),
        )
        .layer(GlobalConcurrencyLimitLayer::new(max_concurrent_requests));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (concurrency limited)
        .nest("/v1", api_routes)
        // Webhooks (no rate limit - controlled by the provider)
        .route("/webhooks/billing", post(webhooks::billing_webhook))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
