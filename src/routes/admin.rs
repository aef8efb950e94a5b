//! Operator routes

use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;

use crate::api::response::DataResponse;
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::settlement::SettlementRunRequest;
use crate::error::ApiError;
use crate::services;

/// POST /admin/settlements/run
///
/// Trigger a settlement batch over a period. `dry_run` reports without
/// paying or marking anything.
pub async fn run_settlement(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SettlementRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_admin()?;

    tracing::info!(
        user_id = %auth.user_id,
        period_start = %req.period_start,
        period_end = %req.period_end,
        dry_run = req.dry_run,
        "Settlement run requested"
    );

    let report = services::settlement::run_settlement(&state, req).await?;
    Ok(DataResponse::new(report))
}
