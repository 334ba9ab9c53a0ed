//! Report unlock endpoint

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

/// `POST /api/reports/{report_id}/unlock`
///
/// Spends one quota unit through the gate. Idempotent for already-unlocked
/// reports; insufficient balance maps to 402 in the error layer.
pub async fn unlock_report(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(report_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.quota.gate.unlock_report(user.user_id, report_id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Report unlocked",
    })))
}
