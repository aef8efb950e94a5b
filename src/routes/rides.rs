//! Ride routes
//!
//! Ride history, detail, cancellation, payment, bill and receipt.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::pagination::PaginationParams;
use crate::api::response::DataResponse;
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::error::ApiError;
use crate::services;
use crate::services::rides::{CancelRideRequest, PayRideRequest, RideHistoryQuery};

/// GET /rides
///
/// Paginated ride history, filterable by status and pickup-time window.
pub async fn list_rides(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RideHistoryQuery>,
    Query(pagination): Query<PaginationParams>,
) -> Result<impl IntoResponse, ApiError> {
    let rides = services::rides::list_rides(&state, auth.user_id, query, pagination).await?;
    Ok(rides)
}

/// GET /rides/:ride_id
pub async fn get_ride(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let ride = services::rides::get_ride(&state, auth.user_id, ride_id).await?;
    Ok(DataResponse::new(ride))
}

/// POST /rides/:ride_id/cancel
pub async fn cancel_ride(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<Uuid>,
    req: Option<Json<CancelRideRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!(user_id = %auth.user_id, ride_id = %ride_id, "Cancelling ride");

    let req = req.map(|Json(r)| r).unwrap_or_default();
    let ride = services::rides::cancel_ride(&state, auth.user_id, ride_id, req).await?;
    Ok(DataResponse::new(ride))
}

/// POST /rides/:ride_id/payment
///
/// Charge the fare for a completed ride.
pub async fn pay_ride(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<Uuid>,
    Json(req): Json<PayRideRequest>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!(user_id = %auth.user_id, ride_id = %ride_id, "Taking ride payment");

    let ride = services::rides::pay_ride(&state, auth.user_id, ride_id, req).await?;
    Ok(DataResponse::new(ride))
}

/// GET /rides/:ride_id/bill
pub async fn get_bill(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let bill = services::rides::get_bill(&state, auth.user_id, ride_id).await?;
    Ok(DataResponse::new(bill))
}

/// GET /rides/:ride_id/receipt
pub async fn get_receipt(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(ride_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = services::rides::get_receipt(&state, auth.user_id, ride_id).await?;
    Ok(DataResponse::new(receipt))
}
