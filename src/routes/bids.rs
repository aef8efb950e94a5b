//! Bid routes
//!
//! Quote request, retrieval, selection and booking authorization.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;

use crate::api::response::DataResponse;
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::bid::{BidResponse, RequestBidsRequest, SelectBidRequest};
use crate::error::ApiError;
use crate::services;
use crate::services::booking::AuthorizeBookingRequest;

/// POST /bids
///
/// Request quotes from every vendor covering the route.
pub async fn request_bids(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Json(req): Json<RequestBidsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!(
        user_id = %auth.user_id,
        pickup = %req.pickup.address,
        dropoff = %req.dropoff.address,
        "Requesting bids"
    );

    let bid =
        services::bids::request_bids(&state, auth.user_id, auth.email.clone(), req).await?;

    Ok((
        StatusCode::CREATED,
        Json(DataResponse::new(BidResponse::from(bid))),
    ))
}

/// GET /bids/:bid_reference
pub async fn get_bid(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(bid_reference): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let bid = services::bids::get_bid(&state, auth.user_id, &bid_reference).await?;
    Ok(DataResponse::new(BidResponse::from(bid)))
}

/// POST /bids/:bid_reference/select
///
/// Pick the winning offer and confirm availability with its vendor.
pub async fn select_bid(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(bid_reference): Path<String>,
    Json(req): Json<SelectBidRequest>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!(
        user_id = %auth.user_id,
        bid_reference = %bid_reference,
        vendor_id = %req.vendor_id,
        "Selecting bid"
    );

    let response =
        services::bids::select_bid(&state, auth.user_id, &bid_reference, &req.vendor_id).await?;
    Ok(DataResponse::new(response))
}

/// POST /bids/:bid_reference/authorize
///
/// Authorize the booking for the selected offer; creates the ride.
pub async fn authorize_booking(
    auth: RequireAuth,
    State(state): State<Arc<AppState>>,
    Path(bid_reference): Path<String>,
    Json(req): Json<AuthorizeBookingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!(
        user_id = %auth.user_id,
        bid_reference = %bid_reference,
        "Authorizing booking"
    );

    let ride =
        services::booking::authorize_booking(&state, auth.user_id, &bid_reference, req).await?;

    Ok((StatusCode::CREATED, Json(DataResponse::new(ride))))
}
