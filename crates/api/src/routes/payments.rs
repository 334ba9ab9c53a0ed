//! Payment endpoints: creation, status polling, webhook ingestion

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use quotapay_payments::{packages, Buyer, PaymentError, ReconcileOutcome};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// How long a signed return-URL stays usable.
const RETURN_URL_MAX_AGE_SECS: i64 = 15 * 60;

/// Clock-skew allowance for timestamps slightly in the future.
const RETURN_URL_MAX_SKEW_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
pub struct CreatePaymentBody {
    pub package_code: String,
    pub amount: i64,
}

/// `POST /api/payments`
pub async fn create_payment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreatePaymentBody>,
) -> ApiResult<Json<Value>> {
    // Cheap validation before touching the database.
    packages::find(&body.package_code).ok_or_else(|| {
        PaymentError::InvalidRequest(format!("unknown package code: {}", body.package_code))
    })?;

    let buyer = fetch_buyer(&state.pool, user.user_id).await?;
    let created = state
        .quota
        .intents
        .create_intent(user.user_id, &buyer, &body.package_code, body.amount)
        .await?;

    Ok(Json(json!({
        "success": true,
        "invoice_number": created.invoice_number,
        "payment_url": created.payment_url,
    })))
}

async fn fetch_buyer(pool: &PgPool, user_id: Uuid) -> ApiResult<Buyer> {
    let row: Option<(String, String, String)> =
        sqlx::query_as("SELECT name, email, mobile FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await
            .map_err(PaymentError::from)?;

    let (name, email, mobile) =
        row.ok_or_else(|| PaymentError::NotFound(format!("user {} not found", user_id)))?;
    Ok(Buyer {
        name,
        email,
        mobile,
    })
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub timestamp: i64,
    pub signature: String,
}

/// `GET /api/payments/{invoice_number}/status`
///
/// The return-URL signature gates this endpoint: only links we issued at
/// intent creation are accepted, and only within the staleness window.
/// Runs one reconciler poll step, so the buyer landing back from the
/// payment page settles the intent even when the webhook is late.
pub async fn payment_status(
    State(state): State<AppState>,
    Extension(_user): Extension<AuthUser>,
    Path(invoice_number): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<Value>> {
    if !state
        .quota
        .signer
        .verify(&invoice_number, query.timestamp, &query.signature)
    {
        return Err(PaymentError::InvalidRequest("invalid status link signature".to_string()).into());
    }

    let age = time::OffsetDateTime::now_utc().unix_timestamp() - query.timestamp;
    if age > RETURN_URL_MAX_AGE_SECS {
        return Err(PaymentError::InvalidRequest("status link expired".to_string()).into());
    }
    if age < -RETURN_URL_MAX_SKEW_SECS {
        return Err(PaymentError::InvalidRequest("status link timestamp is in the future".to_string()).into());
    }

    let outcome = state.quota.reconciler.poll(&invoice_number).await?;
    let status = match outcome {
        ReconcileOutcome::Credited { .. } | ReconcileOutcome::AlreadyProcessed => "success",
        ReconcileOutcome::Failed => "failed",
        // Not settled yet; the client checks back later.
        _ => "pending",
    };

    Ok(Json(json!({ "success": true, "status": status })))
}

/// `POST /api/payments/webhook`
///
/// Unauthenticated, provider-called. Any 2xx stops redelivery, so
/// idempotent-success outcomes (including redeliveries and non-terminal
/// notifications) acknowledge with 200; transient failures answer non-2xx
/// and let the provider's retry mechanism drive another attempt.
pub async fn webhook(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match state.quota.reconciler.handle_webhook(&body).await {
        Ok(outcome) => {
            tracing::info!(outcome = ?outcome, "Webhook processed");
            Json(json!({ "success": true })).into_response()
        }
        Err(e) => ApiError(e).into_response(),
    }
}
