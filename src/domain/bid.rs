//! Bid domain types
//!
//! A bid is a time-boxed set of vendor offers for one ride request. It is a
//! quoting artifact: rides are created only after booking authorization, at
//! which point the winning offer's fields are copied (not referenced) so the
//! ride stays valid after the bid expires.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::money::Pence;
use crate::error::{ApiError, ApiResult};

/// How long a set of quotes stays selectable.
pub fn bid_validity() -> Duration {
    Duration::minutes(5)
}

/// Bid status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Available,
    Unavailable,
    Partial,
}

impl std::fmt::Display for BidStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BidStatus::Available => write!(f, "available"),
            BidStatus::Unavailable => write!(f, "unavailable"),
            BidStatus::Partial => write!(f, "partial"),
        }
    }
}

impl From<String> for BidStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "available" => BidStatus::Available,
            "partial" => BidStatus::Partial,
            _ => BidStatus::Unavailable,
        }
    }
}

/// Whether the quote is for a ride now, a prebooking, or valid for either.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BidType {
    Immediate,
    Prebook,
    Both,
}

impl std::fmt::Display for BidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BidType::Immediate => write!(f, "immediate"),
            BidType::Prebook => write!(f, "prebook"),
            BidType::Both => write!(f, "both"),
        }
    }
}

impl From<String> for BidType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "immediate" => BidType::Immediate,
            "prebook" => BidType::Prebook,
            _ => BidType::Both,
        }
    }
}

/// When the vendor expects the fare to be charged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPoint {
    TimeOfBooking,
    TimeOfDropOff,
}

impl std::fmt::Display for PaymentPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentPoint::TimeOfBooking => write!(f, "time_of_booking"),
            PaymentPoint::TimeOfDropOff => write!(f, "time_of_drop_off"),
        }
    }
}

impl From<String> for PaymentPoint {
    fn from(s: String) -> Self {
        match s.as_str() {
            "time_of_drop_off" => PaymentPoint::TimeOfDropOff,
            _ => PaymentPoint::TimeOfBooking,
        }
    }
}

/// Vendor fare model for the offer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PricingModel {
    Fixed,
    Metered,
}

impl std::fmt::Display for PricingModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PricingModel::Fixed => write!(f, "fixed"),
            PricingModel::Metered => write!(f, "metered"),
        }
    }
}

impl From<String> for PricingModel {
    fn from(s: String) -> Self {
        match s.as_str() {
            "metered" => PricingModel::Metered,
            _ => PricingModel::Fixed,
        }
    }
}

/// A geographic point with its display address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn validate(&self, label: &str) -> ApiResult<()> {
        if !(-90.0..=90.0).contains(&self.latitude)
            || !(-180.0..=180.0).contains(&self.longitude)
            || (self.latitude == 0.0 && self.longitude == 0.0)
        {
            return Err(ApiError::validation(format!(
                "{label} must carry valid coordinates"
            )));
        }
        Ok(())
    }
}

/// The vendor's itemized price for one offer, in pence. The vendor protocol
/// quotes roughly twenty named monetary components; `total_price` is the
/// vendor-side sum and `display_price` is the marked-up pounds figure shown
/// to the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FareBreakdown {
    pub base_fare: Pence,
    pub booking_fee: Pence,
    pub distance_cost: Pence,
    pub time_cost: Pence,
    pub waiting_cost: Pence,
    pub airport_fee: Pence,
    pub toll_fees: Pence,
    pub parking_fees: Pence,
    pub meet_and_greet_fee: Pence,
    pub luggage_fee: Pence,
    pub infant_seat_fee: Pence,
    pub wheelchair_fee: Pence,
    pub vehicle_class_premium: Pence,
    pub out_of_hours_fee: Pence,
    pub holiday_surcharge: Pence,
    pub gratuity: Pence,
    pub discount: Pence,
    pub tax_amount: Pence,
    pub extras_cost: Pence,
    pub total_price: Pence,
    /// Marked-up price in pounds, 2dp. Computed by the pricing transform at
    /// normalization time; never recomputed downstream.
    pub display_price: Decimal,
}

/// One normalized vendor offer inside a bid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VendorOffer {
    pub vendor_id: String,
    pub vendor_name: String,
    pub vendor_phone: Option<String>,
    pub vendor_rating: Option<f32>,
    pub vehicle_type: String,
    pub eta_minutes: Option<i32>,
    pub payment_point: PaymentPoint,
    pub pricing_model: PricingModel,
    pub fare: FareBreakdown,
}

/// A passenger travelling on the ride. Exactly one passenger is the lead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Passenger {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub is_lead: bool,
}

pub fn validate_passengers(passengers: &[Passenger]) -> ApiResult<()> {
    if passengers.is_empty() {
        return Err(ApiError::validation("at least one passenger is required"));
    }
    let leads = passengers.iter().filter(|p| p.is_lead).count();
    if leads != 1 {
        return Err(ApiError::validation(
            "exactly one passenger must be the lead",
        ));
    }
    Ok(())
}

/// Bid entity (persisted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bid_reference: String,
    pub status: BidStatus,
    pub bid_type: BidType,
    pub pickup: Location,
    pub dropoff: Location,
    pub requested_time: DateTime<Utc>,
    pub passenger_count: i32,
    pub luggage_count: i32,
    pub vehicle_type: Option<String>,
    /// Captured at request time and propagated unchanged through selection
    /// and authorization, so choosing an offer can never silently change the
    /// party.
    pub passengers: Vec<Passenger>,
    pub offers: Vec<VendorOffer>,
    pub selected_offer: Option<VendorOffer>,
    pub availability_reference: Option<String>,
    pub authorization_reference: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Bid {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn offer_for_vendor(&self, vendor_id: &str) -> Option<&VendorOffer> {
        self.offers.iter().find(|o| o.vendor_id == vendor_id)
    }
}

/// Request DTO for requesting bids
#[derive(Debug, Clone, Deserialize)]
pub struct RequestBidsRequest {
    pub pickup: Location,
    pub dropoff: Location,
    pub pickup_time: DateTime<Utc>,
    #[serde(default)]
    pub vehicle_type: Option<String>,
    pub passenger_count: i32,
    #[serde(default)]
    pub luggage_count: i32,
    pub passengers: Vec<Passenger>,
}

impl RequestBidsRequest {
    pub fn validate(&self) -> ApiResult<()> {
        self.pickup.validate("pickup")?;
        self.dropoff.validate("dropoff")?;
        if self.passenger_count < 1 {
            return Err(ApiError::validation("passenger count must be at least 1"));
        }
        if self.luggage_count < 0 {
            return Err(ApiError::validation("luggage count cannot be negative"));
        }
        validate_passengers(&self.passengers)
    }
}

/// Request DTO for selecting the winning offer
#[derive(Debug, Clone, Deserialize)]
pub struct SelectBidRequest {
    pub vendor_id: String,
}

/// Response DTO for a bid
#[derive(Debug, Clone, Serialize)]
pub struct BidResponse {
    pub bid_reference: String,
    pub status: BidStatus,
    pub bid_type: BidType,
    pub pickup: Location,
    pub dropoff: Location,
    pub requested_time: DateTime<Utc>,
    pub passenger_count: i32,
    pub luggage_count: i32,
    pub expires_at: DateTime<Utc>,
    pub bids: Vec<VendorOffer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_bid: Option<VendorOffer>,
}

impl From<Bid> for BidResponse {
    fn from(b: Bid) -> Self {
        Self {
            bid_reference: b.bid_reference,
            status: b.status,
            bid_type: b.bid_type,
            pickup: b.pickup,
            dropoff: b.dropoff,
            requested_time: b.requested_time,
            passenger_count: b.passenger_count,
            luggage_count: b.luggage_count,
            expires_at: b.expires_at,
            bids: b.offers,
            selected_bid: b.selected_offer,
        }
    }
}

/// Response DTO for bid selection
#[derive(Debug, Clone, Serialize)]
pub struct SelectBidResponse {
    pub bid_reference: String,
    pub availability_reference: String,
    pub selected_bid: VendorOffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(lat: f64, lng: f64) -> Location {
        Location {
            address: "somewhere".into(),
            latitude: lat,
            longitude: lng,
        }
    }

    #[test]
    fn location_rejects_out_of_range_and_null_island() {
        assert!(location(51.5, -0.12).validate("pickup").is_ok());
        assert!(location(91.0, 0.5).validate("pickup").is_err());
        assert!(location(10.0, 181.0).validate("pickup").is_err());
        assert!(location(0.0, 0.0).validate("pickup").is_err());
    }

    #[test]
    fn passenger_list_needs_exactly_one_lead() {
        let lead = Passenger {
            name: "Ada".into(),
            phone: None,
            email: None,
            is_lead: true,
        };
        let extra = Passenger {
            name: "Grace".into(),
            phone: None,
            email: None,
            is_lead: false,
        };

        assert!(validate_passengers(&[lead.clone(), extra.clone()]).is_ok());
        assert!(validate_passengers(&[]).is_err());
        assert!(validate_passengers(&[extra.clone()]).is_err());
        assert!(validate_passengers(&[lead.clone(), lead]).is_err());
    }

    #[test]
    fn expiry_is_strictly_after_the_deadline() {
        let now = Utc::now();
        let bid = Bid {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            bid_reference: "BID-1".into(),
            status: BidStatus::Available,
            bid_type: BidType::Immediate,
            pickup: location(51.5, -0.12),
            dropoff: location(51.52, -0.12),
            requested_time: now,
            passenger_count: 1,
            luggage_count: 0,
            vehicle_type: None,
            passengers: vec![],
            offers: vec![],
            selected_offer: None,
            availability_reference: None,
            authorization_reference: None,
            expires_at: now,
            created_at: now,
        };

        assert!(!bid.is_expired(now));
        assert!(bid.is_expired(now + Duration::seconds(1)));
    }
}
