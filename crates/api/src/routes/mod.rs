//! Route definitions

pub mod payments;
pub mod reports;


use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::auth::require_auth;
use crate::state::AppState;

/// Build the application router.
///
/// The webhook stays outside the auth group: the provider calls it with its
/// own envelope, not with our bearer tokens.
pub fn create_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/api/payments", post(payments::create_payment))
        .route(
            "/api/payments/{invoice_number}/status",
            get(payments::payment_status),
        )
        .route("/api/reports/{report_id}/unlock", post(reports::unlock_report))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/api/packages", get(list_packages))
        .route("/api/payments/webhook", post(payments::webhook))
        .merge(authed)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn list_packages() -> Json<serde_json::Value> {
    let packages: Vec<_> = quotapay_payments::packages::all()
        .iter()
        .map(|p| {
            json!({
                "code": p.code,
                "units": p.units,
                "price": p.price,
            })
        })
        .collect();
    Json(json!({ "success": true, "packages": packages }))
}
