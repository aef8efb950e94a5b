pub mod admin;
pub mod bids;
pub mod health;
pub mod rides;
pub mod webhooks;

use axum::{routing::get, routing::post, Router};
use std::sync::Arc;

use crate::app::AppState;

/// Build the API router with all routes
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        // Public routes
        .route("/health", get(health::health_check))
        // Bids
        .route("/bids", post(bids::request_bids))
        .route("/bids/:bid_reference", get(bids::get_bid))
        .route("/bids/:bid_reference/select", post(bids::select_bid))
        .route("/bids/:bid_reference/authorize", post(bids::authorize_booking))
        // Rides
        .route("/rides", get(rides::list_rides))
        .route("/rides/:ride_id", get(rides::get_ride))
        .route("/rides/:ride_id/cancel", post(rides::cancel_ride))
        .route("/rides/:ride_id/payment", post(rides::pay_ride))
        .route("/rides/:ride_id/bill", get(rides::get_bill))
        .route("/rides/:ride_id/receipt", get(rides::get_receipt))
        // Vendor webhook events (authenticated by agent credentials, not JWT)
        .route("/events/:event_name", post(webhooks::receive_event))
        // Operator endpoints
        .route("/admin/settlements/run", post(admin::run_settlement))
}
