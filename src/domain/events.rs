//! Vendor webhook event types
//!
//! The dispatch network pushes booking lifecycle events at-least-once and in
//! no guaranteed order. The XML codec decodes the wire envelope into the
//! typed [`VendorEvent`] here; everything downstream works with this value,
//! never with loose payload probing.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::money::Pence;

/// How long archived webhook events are retained.
pub fn event_retention() -> Duration {
    Duration::days(30)
}

/// The booking lifecycle events the vendor protocol can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorEventKind {
    Dispatched,
    VehicleArrived,
    PassengerOnBoard,
    Completed,
    Cancelled,
}

impl VendorEventKind {
    /// Wire name of the event, as it appears in the webhook path. The body's
    /// root element is this name with a `Request` suffix, and our reply's
    /// root is the same name with a `Response` suffix; that bidirectional
    /// naming convention is part of the wire contract.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Dispatched => "AgentBookingDispatchedEvent",
            Self::VehicleArrived => "AgentBookingVehicleArrivedEvent",
            Self::PassengerOnBoard => "AgentBookingPassengerOnBoardEvent",
            Self::Completed => "AgentBookingCompletedEvent",
            Self::Cancelled => "AgentBookingCancelledEvent",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "AgentBookingDispatchedEvent" => Some(Self::Dispatched),
            "AgentBookingVehicleArrivedEvent" => Some(Self::VehicleArrived),
            "AgentBookingPassengerOnBoardEvent" => Some(Self::PassengerOnBoard),
            "AgentBookingCompletedEvent" => Some(Self::Completed),
            "AgentBookingCancelledEvent" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for VendorEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.event_name())
    }
}

/// A decoded webhook event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorEvent {
    pub kind: VendorEventKind,
    /// Vendor-issued id matching the event back to a ride. Extraction can
    /// fail on malformed payloads; the event is archived regardless.
    pub authorization_reference: Option<String>,
    /// Agent-side booking reference, when the vendor echoes it.
    pub booking_reference: Option<String>,
    /// Post-completion bill total, pence. Only on completion events.
    pub final_fare: Option<Pence>,
    /// Only on cancellation events.
    pub cancellation_reason: Option<String>,
    /// Dispatched vehicle details, when present.
    pub vehicle_registration: Option<String>,
    pub driver_name: Option<String>,
    /// The decoded payload as received, for the audit trail.
    pub raw: serde_json::Value,
}

/// Append-only audit record for every received webhook event, whether or not
/// it matched a ride. TTL-expired after 30 days via `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHistoryRecord {
    pub id: Uuid,
    pub event_type: String,
    pub authorization_reference: Option<String>,
    pub booking_reference: Option<String>,
    pub ride_id: Option<Uuid>,
    pub event_data: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_round_trip() {
        for kind in [
            VendorEventKind::Dispatched,
            VendorEventKind::VehicleArrived,
            VendorEventKind::PassengerOnBoard,
            VendorEventKind::Completed,
            VendorEventKind::Cancelled,
        ] {
            assert_eq!(VendorEventKind::from_event_name(kind.event_name()), Some(kind));
        }
        assert_eq!(VendorEventKind::from_event_name("AgentMadeUpEvent"), None);
    }
}
