//! Vendor webhook routes
//!
//! The dispatch network pushes booking lifecycle events here as XML, one
//! path per event name, authenticated by agent credentials in the
//! `X-Authorization-Reference` header. The reply is always an XML
//! acknowledgement with HTTP 200; only an undecodable payload earns a 400.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap},
    response::IntoResponse,
};
use std::sync::Arc;

use crate::app::AppState;
use crate::error::ApiError;
use crate::services;

const AGENT_CREDENTIALS_HEADER: &str = "x-authorization-reference";

/// POST /events/:event_name
pub async fn receive_event(
    State(state): State<Arc<AppState>>,
    Path(event_name): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let credentials = headers
        .get(AGENT_CREDENTIALS_HEADER)
        .and_then(|v| v.to_str().ok());

    let ack = services::events::ingest_event(&state, &event_name, credentials, &body).await?;

    Ok(([(header::CONTENT_TYPE, "application/xml")], ack))
}
