//! Ride domain types and state machine
//!
//! The ride is the central aggregate: one persisted row per trip, mutated
//! only through guarded single-row updates. This module owns the legality of
//! status transitions; callers (user cancel, webhook ingestion) consult it
//! before touching storage.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::bid::{Location, Passenger, PaymentPoint, PricingModel};
use super::events::VendorEventKind;
use super::money::{CommissionSplit, Pence};
use crate::error::{ApiError, ApiResult};

/// Ride status, in forward order. `Cancelled` sits outside the forward
/// sequence and is reachable only from `Pending`/`Booked` for user cancels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,
    Booked,
    Dispatched,
    VehicleArrived,
    PassengerOnBoard,
    Completed,
    Cancelled,
}

impl RideStatus {
    /// Position in the forward sequence; used to detect stale out-of-order
    /// webhook events. `Cancelled` ranks above everything.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Booked => 1,
            Self::Dispatched => 2,
            Self::VehicleArrived => 3,
            Self::PassengerOnBoard => 4,
            Self::Completed => 5,
            Self::Cancelled => 6,
        }
    }
}

impl std::fmt::Display for RideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Booked => write!(f, "booked"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::VehicleArrived => write!(f, "vehicle_arrived"),
            Self::PassengerOnBoard => write!(f, "passenger_on_board"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<String> for RideStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "booked" => Self::Booked,
            "dispatched" => Self::Dispatched,
            "vehicle_arrived" => Self::VehicleArrived,
            "passenger_on_board" => Self::PassengerOnBoard,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

/// Payment status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Paid => write!(f, "paid"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl From<String> for PaymentStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "paid" => Self::Paid,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Commission computed and frozen at payment time. Settlement aggregates
/// these figures and never recomputes pricing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionDetails {
    pub commission_amount: Decimal,
    pub vendor_amount: Decimal,
    pub commission_rate: Decimal,
    pub computed_at: DateTime<Utc>,
}

impl CommissionDetails {
    pub fn from_split(split: CommissionSplit, rate: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            commission_amount: split.commission_amount,
            vendor_amount: split.vendor_amount,
            commission_rate: rate,
            computed_at: at,
        }
    }
}

/// Set exactly once by the settlement batcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementDetails {
    pub settled: bool,
    pub settled_at: DateTime<Utc>,
    pub settlement_id: String,
    pub vendor_amount: Decimal,
    pub commission_amount: Decimal,
}

/// A vendor-supplied bill/receipt line item, fetched after completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillLineItem {
    pub description: String,
    pub amount: Pence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillDetails {
    pub line_items: Vec<BillLineItem>,
    pub total: Pence,
    pub fetched_at: DateTime<Utc>,
}

/// Ride entity (persisted, the central aggregate)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ride {
    pub id: Uuid,
    pub user_id: Uuid,
    pub pickup_location: Location,
    pub dropoff_location: Location,
    pub pickup_time: DateTime<Utc>,
    pub vehicle_type: String,
    pub vendor_id: String,
    pub vendor_name: String,

    /// Marked-up fare shown to and charged from the user, pounds.
    pub fare: Decimal,
    /// The vendor's quoted total at booking time, pence.
    pub original_fare: Pence,
    /// Post-completion bill total when the vendor reports one, pence.
    pub final_fare: Option<Pence>,

    pub status: RideStatus,
    pub pricing_model: PricingModel,
    pub payment_point: PaymentPoint,

    // Vendor correlation identifiers. The authorization reference is the
    // primary key for matching inbound webhook events to this ride.
    pub igo_booking_id: String,
    pub igo_availability_reference: String,
    pub igo_authorization_reference: String,

    pub passengers: Vec<Passenger>,

    pub dispatched_at: Option<DateTime<Utc>>,
    pub vehicle_arrived_at: Option<DateTime<Utc>>,
    pub passenger_on_board_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,

    pub payment_status: PaymentStatus,
    pub payment_reference: Option<String>,
    pub transaction_reference: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,

    pub commission_details: Option<CommissionDetails>,
    pub bill_details: Option<BillDetails>,
    pub settlement_details: Option<SettlementDetails>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What applying a webhook event to a ride in a given status would do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPlan {
    pub target: RideStatus,
    /// The ride is already at or past the target status. The status write
    /// changes nothing visible and the timestamp must not move, but the
    /// event still lands in the audit history.
    pub already_applied: bool,
    /// The event arrived after a later-stage event (vendor delivery is
    /// unordered). Last write wins per the vendor contract, so the status is
    /// still overwritten; flagged so the gate can log it for operators.
    pub regresses: bool,
}

/// Map a webhook event kind onto the ride status it drives.
pub fn target_status(kind: VendorEventKind) -> RideStatus {
    match kind {
        VendorEventKind::Dispatched => RideStatus::Dispatched,
        VendorEventKind::VehicleArrived => RideStatus::VehicleArrived,
        VendorEventKind::PassengerOnBoard => RideStatus::PassengerOnBoard,
        VendorEventKind::Completed => RideStatus::Completed,
        VendorEventKind::Cancelled => RideStatus::Cancelled,
    }
}

/// Plan the application of an event against the current status.
pub fn plan_event(current: RideStatus, kind: VendorEventKind) -> EventPlan {
    let target = target_status(kind);
    EventPlan {
        target,
        already_applied: current.rank() >= target.rank(),
        regresses: current.rank() > target.rank(),
    }
}

/// Guard for user-initiated cancellation. Only rides that have not left the
/// kerb can be cancelled by the user.
pub fn check_cancellable(current: RideStatus) -> ApiResult<()> {
    match current {
        RideStatus::Cancelled => Err(ApiError::duplicate("ride is already cancelled")),
        RideStatus::Pending | RideStatus::Booked => Ok(()),
        other => Err(ApiError::InvalidTransition(format!(
            "cannot cancel a ride in status '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_sequence_is_ordered() {
        let order = [
            RideStatus::Pending,
            RideStatus::Booked,
            RideStatus::Dispatched,
            RideStatus::VehicleArrived,
            RideStatus::PassengerOnBoard,
            RideStatus::Completed,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
    }

    #[test]
    fn events_map_to_their_statuses() {
        assert_eq!(
            target_status(VendorEventKind::Dispatched),
            RideStatus::Dispatched
        );
        assert_eq!(
            target_status(VendorEventKind::Completed),
            RideStatus::Completed
        );
        assert_eq!(
            target_status(VendorEventKind::Cancelled),
            RideStatus::Cancelled
        );
    }

    #[test]
    fn replayed_event_is_a_status_noop() {
        let plan = plan_event(RideStatus::Dispatched, VendorEventKind::Dispatched);
        assert!(plan.already_applied);
        assert!(!plan.regresses);
    }

    #[test]
    fn stale_event_after_later_stage_is_flagged() {
        let plan = plan_event(RideStatus::Completed, VendorEventKind::Dispatched);
        assert!(plan.already_applied);
        assert!(plan.regresses);
    }

    #[test]
    fn forward_event_applies_normally() {
        let plan = plan_event(RideStatus::Booked, VendorEventKind::Dispatched);
        assert_eq!(plan.target, RideStatus::Dispatched);
        assert!(!plan.already_applied);
        assert!(!plan.regresses);
    }

    #[test]
    fn cancel_guard_allows_only_pending_and_booked() {
        assert!(check_cancellable(RideStatus::Pending).is_ok());
        assert!(check_cancellable(RideStatus::Booked).is_ok());

        for status in [
            RideStatus::Dispatched,
            RideStatus::VehicleArrived,
            RideStatus::PassengerOnBoard,
            RideStatus::Completed,
        ] {
            let err = check_cancellable(status).unwrap_err();
            assert!(
                matches!(err, ApiError::InvalidTransition(_)),
                "expected InvalidTransition from {status}"
            );
            // error names the current status
            assert!(err.to_string().contains(&status.to_string()));
        }

        assert!(matches!(
            check_cancellable(RideStatus::Cancelled).unwrap_err(),
            ApiError::Duplicate(_)
        ));
    }
}
