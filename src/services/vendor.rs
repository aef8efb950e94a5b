//! Vendor dispatch network client (iGo protocol)
//!
//! Typed request-in/response-out over the flat XML codec. Calls are
//! classified critical or non-critical: critical calls (authorization,
//! cancellation, payment recording) are retried up to three times with
//! exponential backoff on transport failure; non-critical calls are sent
//! once, because a stale retry of a time-sensitive quote may come back with
//! a different, unacceptable price.
//!
//! A mock implementation backs environments without live vendor credentials
//! (`VENDOR_MOCK_MODE`) and the service tests.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::codec::{self, XmlNode};
use crate::domain::bid::{FareBreakdown, Location, Passenger, PaymentPoint, PricingModel};
use crate::domain::money::{normalize_to_minor_units, Pence};
use crate::domain::ride::{BillDetails, BillLineItem};
use crate::error::{ApiError, ApiResult};

/// Maximum attempts for critical-path vendor calls.
const CRITICAL_MAX_ATTEMPTS: u32 = 3;

/// Outbound bid request: one fan-out to the multi-vendor bid endpoint.
#[derive(Debug, Clone)]
pub struct VendorBidRequest {
    pub bid_reference: String,
    pub pickup: Location,
    pub dropoff: Location,
    pub pickup_time: DateTime<Utc>,
    pub vehicle_type: Option<String>,
    pub passenger_count: i32,
    pub luggage_count: i32,
}

/// One raw offer as quoted by a vendor, pence amounts only. The bid
/// aggregator turns these into display-priced [`crate::domain::bid::VendorOffer`]s.
#[derive(Debug, Clone)]
pub struct RawOffer {
    pub vendor_id: String,
    pub vendor_name: String,
    pub vendor_phone: Option<String>,
    pub vendor_rating: Option<f32>,
    pub vehicle_type: String,
    pub eta_minutes: Option<i32>,
    pub payment_point: PaymentPoint,
    pub pricing_model: PricingModel,
    /// Itemized quote in pence. `display_price` is left at zero here; the
    /// bid aggregator owns the markup.
    pub fare: FareBreakdown,
}

/// Availability check for a selected offer. The quoted price is mandatory;
/// the vendor protocol rejects availability checks without it.
#[derive(Debug, Clone)]
pub struct AvailabilityRequest {
    pub bid_reference: String,
    pub vendor_id: String,
    pub quoted_price: Pence,
    pub passenger_count: i32,
    pub luggage_count: i32,
}

#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub availability_reference: String,
    pub booking_reference: String,
    pub pickup: Location,
    pub dropoff: Location,
    pub pickup_time: DateTime<Utc>,
    pub quoted_price: Pence,
    pub passengers: Vec<Passenger>,
}

#[derive(Debug, Clone)]
pub struct AuthorizationResponse {
    pub authorization_reference: String,
    /// The decoded vendor response, archived verbatim on the ride.
    pub raw: serde_json::Value,
}

/// The vendor protocol surface this backend consumes.
#[async_trait]
pub trait VendorApi: Send + Sync {
    async fn request_bids(&self, req: &VendorBidRequest) -> ApiResult<Vec<RawOffer>>;

    async fn check_availability(&self, req: &AvailabilityRequest) -> ApiResult<String>;

    async fn authorize_booking(
        &self,
        req: &AuthorizationRequest,
    ) -> ApiResult<AuthorizationResponse>;

    async fn cancel_booking(&self, authorization_reference: &str, reason: &str) -> ApiResult<()>;

    async fn record_payment(
        &self,
        authorization_reference: &str,
        amount: Pence,
        transaction_reference: &str,
    ) -> ApiResult<()>;

    async fn request_bill(&self, authorization_reference: &str) -> ApiResult<BillDetails>;

    /// Reachability probe for the health endpoint.
    async fn health_check(&self) -> ApiResult<()>;
}

/// Live client for the vendor gateway.
#[derive(Clone)]
pub struct VendorClient {
    client: Client,
    base_url: String,
    agent_id: String,
    agent_password: String,
}

impl VendorClient {
    pub fn new(
        base_url: &str,
        agent_id: &str,
        agent_password: &str,
        timeout_seconds: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        tracing::info!(base_url = base_url, "Vendor client initialized");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_id: agent_id.to_string(),
            agent_password: agent_password.to_string(),
        })
    }

    /// Send one request document and decode the response envelope. The
    /// response root must carry the request name with the `Response` suffix
    /// and a successful `Result`.
    async fn send(&self, name: &str, body: XmlNode) -> ApiResult<XmlNode> {
        let url = format!("{}/{}", self.base_url, name);
        debug!(url = %url, request = name, "Vendor request");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/xml")
            .header(
                "X-Authorization-Reference",
                format!("{}:{}", self.agent_id, self.agent_password),
            )
            .body(body.to_xml())
            .send()
            .await
            .map_err(|e| ApiError::VendorUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ApiError::VendorUnavailable(format!(
                "vendor gateway returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(ApiError::VendorRejected(format!(
                "vendor gateway returned {status}"
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ApiError::VendorUnavailable(e.to_string()))?;
        let doc = codec::parse_document(&text)
            .map_err(|e| ApiError::VendorUnavailable(format!("undecodable response: {e}")))?;

        let expected = format!("{name}Response");
        if doc.name != expected {
            return Err(ApiError::VendorUnavailable(format!(
                "vendor answered {} to {name}Request",
                doc.name
            )));
        }

        codec::read_result(&doc).map_err(ApiError::VendorRejected)?;
        Ok(doc)
    }

    /// Critical-path variant: retried on transport failure with exponential
    /// backoff, up to [`CRITICAL_MAX_ATTEMPTS`] attempts. Structured vendor
    /// failures are never retried. The last error surfaces to the caller; no
    /// compensating action is taken here.
    async fn send_critical(&self, name: &str, body: XmlNode) -> ApiResult<XmlNode> {
        let mut policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send(name, body.clone()).await {
                Ok(doc) => return Ok(doc),
                Err(err @ ApiError::VendorUnavailable(_)) if attempt < CRITICAL_MAX_ATTEMPTS => {
                    let delay = policy
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(500));
                    warn!(
                        request = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Critical vendor call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn location_node(name: &str, location: &Location) -> XmlNode {
    XmlNode::element(name)
        .with_child(XmlNode::leaf("Address", &location.address))
        .with_child(XmlNode::leaf("Latitude", location.latitude.to_string()))
        .with_child(XmlNode::leaf("Longitude", location.longitude.to_string()))
}

fn parse_offer(node: &XmlNode) -> Option<RawOffer> {
    // An offer without a vendor id or a total cannot be normalized; skip it
    // rather than failing the whole bid.
    let vendor_id = node.find_text("VendorId")?.to_string();
    let total_price = node
        .find_text("TotalPrice")
        .and_then(|v| v.parse::<f64>().ok())
        .map(normalize_to_minor_units)?;

    let amount = |field: &str| {
        node.find_text(field)
            .and_then(|v| v.parse::<f64>().ok())
            .map(normalize_to_minor_units)
            .unwrap_or_default()
    };

    let fare = FareBreakdown {
        base_fare: amount("BaseFare"),
        booking_fee: amount("BookingFee"),
        distance_cost: amount("DistanceCost"),
        time_cost: amount("TimeCost"),
        waiting_cost: amount("WaitingCost"),
        airport_fee: amount("AirportFee"),
        toll_fees: amount("TollFees"),
        parking_fees: amount("ParkingFees"),
        meet_and_greet_fee: amount("MeetAndGreetFee"),
        luggage_fee: amount("LuggageFee"),
        infant_seat_fee: amount("InfantSeatFee"),
        wheelchair_fee: amount("WheelchairFee"),
        vehicle_class_premium: amount("VehicleClassPremium"),
        out_of_hours_fee: amount("OutOfHoursFee"),
        holiday_surcharge: amount("HolidaySurcharge"),
        gratuity: amount("Gratuity"),
        discount: amount("Discount"),
        tax_amount: amount("TaxAmount"),
        extras_cost: amount("ExtrasCost"),
        total_price,
        display_price: Default::default(),
    };

    let payment_point = match node.find_text("PaymentPoint") {
        Some("TimeOfDropOff") => PaymentPoint::TimeOfDropOff,
        _ => PaymentPoint::TimeOfBooking,
    };
    let pricing_model = match node.find_text("PricingModel") {
        Some("Metered") => PricingModel::Metered,
        _ => PricingModel::Fixed,
    };

    Some(RawOffer {
        vendor_id,
        vendor_name: node
            .find_text("VendorName")
            .unwrap_or("Unknown vendor")
            .to_string(),
        vendor_phone: node.find_text("VendorPhone").map(str::to_string),
        vendor_rating: node
            .find_text("VendorRating")
            .and_then(|v| v.parse().ok()),
        vehicle_type: node
            .find_text("VehicleType")
            .unwrap_or("standard")
            .to_string(),
        eta_minutes: node.find_text("EtaMinutes").and_then(|v| v.parse().ok()),
        payment_point,
        pricing_model,
        fare,
    })
}

#[async_trait]
impl VendorApi for VendorClient {
    #[instrument(skip(self, req), fields(bid_reference = %req.bid_reference))]
    async fn request_bids(&self, req: &VendorBidRequest) -> ApiResult<Vec<RawOffer>> {
        let mut body = XmlNode::element("AgentBidsRequest")
            .with_child(XmlNode::leaf("BidReference", &req.bid_reference))
            .with_child(location_node("Pickup", &req.pickup))
            .with_child(location_node("DropOff", &req.dropoff))
            .with_child(XmlNode::leaf("PickupTime", req.pickup_time.to_rfc3339()))
            .with_child(XmlNode::leaf(
                "PassengerCount",
                req.passenger_count.to_string(),
            ))
            .with_child(XmlNode::leaf(
                "LuggageCount",
                req.luggage_count.to_string(),
            ));
        if let Some(vehicle_type) = &req.vehicle_type {
            body = body.with_child(XmlNode::leaf("VehicleType", vehicle_type));
        }

        // Quotes are time-sensitive: sent once, never retried.
        let doc = self.send("AgentBids", body).await?;

        let offers = doc
            .child("Bids")
            .map(|bids| {
                bids.children_named("Bid")
                    .filter_map(parse_offer)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        debug!(offers = offers.len(), "Vendor bids decoded");
        Ok(offers)
    }

    #[instrument(skip(self, req), fields(bid_reference = %req.bid_reference, vendor_id = %req.vendor_id))]
    async fn check_availability(&self, req: &AvailabilityRequest) -> ApiResult<String> {
        let body = XmlNode::element("AgentAvailabilityRequest")
            .with_child(XmlNode::leaf("BidReference", &req.bid_reference))
            .with_child(XmlNode::leaf("VendorId", &req.vendor_id))
            .with_child(XmlNode::leaf("QuotedPrice", req.quoted_price.0.to_string()))
            .with_child(XmlNode::leaf(
                "PassengerCount",
                req.passenger_count.to_string(),
            ))
            .with_child(XmlNode::leaf(
                "LuggageCount",
                req.luggage_count.to_string(),
            ));

        // Availability is time-sensitive: sent once, never retried.
        let doc = self.send("AgentAvailability", body).await?;

        doc.find_text("AvailabilityReference")
            .map(str::to_string)
            .ok_or_else(|| {
                ApiError::VendorUnavailable(
                    "availability response missing AvailabilityReference".into(),
                )
            })
    }

    #[instrument(skip(self, req), fields(booking_reference = %req.booking_reference))]
    async fn authorize_booking(
        &self,
        req: &AuthorizationRequest,
    ) -> ApiResult<AuthorizationResponse> {
        let mut passengers = XmlNode::element("Passengers");
        for passenger in &req.passengers {
            let mut node = XmlNode::element("Passenger")
                .with_child(XmlNode::leaf("Name", &passenger.name))
                .with_child(XmlNode::leaf(
                    "IsLead",
                    if passenger.is_lead { "true" } else { "false" },
                ));
            if let Some(phone) = &passenger.phone {
                node = node.with_child(XmlNode::leaf("Phone", phone));
            }
            if let Some(email) = &passenger.email {
                node = node.with_child(XmlNode::leaf("Email", email));
            }
            passengers = passengers.with_child(node);
        }

        let body = XmlNode::element("AgentBookingAuthorizationRequest")
            .with_child(XmlNode::leaf(
                "AvailabilityReference",
                &req.availability_reference,
            ))
            .with_child(XmlNode::leaf(
                "AgentBookingReference",
                &req.booking_reference,
            ))
            .with_child(location_node("Pickup", &req.pickup))
            .with_child(location_node("DropOff", &req.dropoff))
            .with_child(XmlNode::leaf("PickupTime", req.pickup_time.to_rfc3339()))
            .with_child(XmlNode::leaf("QuotedPrice", req.quoted_price.0.to_string()))
            .with_child(passengers);

        let doc = self.send_critical("AgentBookingAuthorization", body).await?;

        let authorization_reference = doc
            .find_text("AuthorizationReference")
            .map(str::to_string)
            .ok_or_else(|| {
                ApiError::VendorUnavailable(
                    "authorization response missing AuthorizationReference".into(),
                )
            })?;

        Ok(AuthorizationResponse {
            authorization_reference,
            raw: doc.to_json(),
        })
    }

    #[instrument(skip(self))]
    async fn cancel_booking(&self, authorization_reference: &str, reason: &str) -> ApiResult<()> {
        let body = XmlNode::element("AgentBookingCancellationRequest")
            .with_child(XmlNode::leaf(
                "AuthorizationReference",
                authorization_reference,
            ))
            .with_child(XmlNode::leaf("Reason", reason));

        self.send_critical("AgentBookingCancellation", body)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn record_payment(
        &self,
        authorization_reference: &str,
        amount: Pence,
        transaction_reference: &str,
    ) -> ApiResult<()> {
        let body = XmlNode::element("AgentPaymentRecordRequest")
            .with_child(XmlNode::leaf(
                "AuthorizationReference",
                authorization_reference,
            ))
            .with_child(XmlNode::leaf("Amount", amount.0.to_string()))
            .with_child(XmlNode::leaf(
                "TransactionReference",
                transaction_reference,
            ));

        self.send_critical("AgentPaymentRecord", body)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn request_bill(&self, authorization_reference: &str) -> ApiResult<BillDetails> {
        let body = XmlNode::element("AgentBookingBillRequest").with_child(XmlNode::leaf(
            "AuthorizationReference",
            authorization_reference,
        ));

        // Status/bill polling is non-critical: sent once.
        let doc = self.send("AgentBookingBill", body).await?;

        let line_items = doc
            .child("LineItems")
            .map(|items| {
                items
                    .children_named("LineItem")
                    .filter_map(|item| {
                        let description = item.find_text("Description")?.to_string();
                        let amount = item
                            .find_text("Amount")
                            .and_then(|v| v.parse::<f64>().ok())
                            .map(normalize_to_minor_units)?;
                        Some(BillLineItem {
                            description,
                            amount,
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let total = doc
            .find_text("Total")
            .and_then(|v| v.parse::<f64>().ok())
            .map(normalize_to_minor_units)
            .unwrap_or_else(|| Pence(line_items.iter().map(|i| i.amount.0).sum()));

        Ok(BillDetails {
            line_items,
            total,
            fetched_at: Utc::now(),
        })
    }

    async fn health_check(&self) -> ApiResult<()> {
        self.client
            .get(&self.base_url)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ApiError::VendorUnavailable(e.to_string()))
    }
}

/// Deterministic in-process vendor for environments without live vendor
/// credentials, toggled by `VENDOR_MOCK_MODE`.
#[derive(Debug, Clone, Default)]
pub struct MockVendor;

impl MockVendor {
    fn offer(vendor_id: &str, vendor_name: &str, total: i64, eta: i32) -> RawOffer {
        RawOffer {
            vendor_id: vendor_id.to_string(),
            vendor_name: vendor_name.to_string(),
            vendor_phone: Some("+441234567890".to_string()),
            vendor_rating: Some(4.6),
            vehicle_type: "saloon".to_string(),
            eta_minutes: Some(eta),
            payment_point: PaymentPoint::TimeOfBooking,
            pricing_model: PricingModel::Fixed,
            fare: FareBreakdown {
                base_fare: Pence(total - 300),
                booking_fee: Pence(300),
                total_price: Pence(total),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl VendorApi for MockVendor {
    async fn request_bids(&self, _req: &VendorBidRequest) -> ApiResult<Vec<RawOffer>> {
        Ok(vec![
            Self::offer("mock-city-cars", "City Cars", 2300, 6),
            Self::offer("mock-swift", "Swift Taxis", 2550, 4),
        ])
    }

    async fn check_availability(&self, req: &AvailabilityRequest) -> ApiResult<String> {
        Ok(format!("AV-{}-{}", req.vendor_id, Uuid::new_v4()))
    }

    async fn authorize_booking(
        &self,
        req: &AuthorizationRequest,
    ) -> ApiResult<AuthorizationResponse> {
        Ok(AuthorizationResponse {
            authorization_reference: format!("AUTH-{}", Uuid::new_v4()),
            raw: serde_json::json!({
                "mock": true,
                "AgentBookingReference": req.booking_reference,
            }),
        })
    }

    async fn cancel_booking(&self, _authorization_reference: &str, _reason: &str) -> ApiResult<()> {
        Ok(())
    }

    async fn record_payment(
        &self,
        _authorization_reference: &str,
        _amount: Pence,
        _transaction_reference: &str,
    ) -> ApiResult<()> {
        Ok(())
    }

    async fn request_bill(&self, _authorization_reference: &str) -> ApiResult<BillDetails> {
        Ok(BillDetails {
            line_items: vec![BillLineItem {
                description: "Metered fare".to_string(),
                amount: Pence(2000),
            }],
            total: Pence(2000),
            fetched_at: Utc::now(),
        })
    }

    async fn health_check(&self) -> ApiResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offers_without_vendor_or_total_are_skipped() {
        let doc = codec::parse_document(
            r#"<AgentBidsResponse>
                <Result><Success>true</Success></Result>
                <Bids>
                    <Bid><VendorId>v1</VendorId><VendorName>One</VendorName><TotalPrice>2300</TotalPrice></Bid>
                    <Bid><VendorName>No Id</VendorName><TotalPrice>900</TotalPrice></Bid>
                    <Bid><VendorId>v3</VendorId></Bid>
                </Bids>
            </AgentBidsResponse>"#,
        )
        .unwrap();

        let offers: Vec<_> = doc
            .child("Bids")
            .unwrap()
            .children_named("Bid")
            .filter_map(parse_offer)
            .collect();

        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].vendor_id, "v1");
        assert_eq!(offers[0].fare.total_price, Pence(2300));
    }

    #[test]
    fn offer_amounts_are_normalized_to_pence() {
        let doc = codec::parse_document(
            r#"<Bid>
                <VendorId>v1</VendorId>
                <TotalPrice>23.00</TotalPrice>
                <BaseFare>2000</BaseFare>
                <BookingFee>3.00</BookingFee>
            </Bid>"#,
        )
        .unwrap();

        let offer = parse_offer(&doc).unwrap();
        // 23.00 is decimal pounds, 2000 is integral pence, 3.00 is pounds
        assert_eq!(offer.fare.total_price, Pence(2300));
        assert_eq!(offer.fare.base_fare, Pence(2000));
        assert_eq!(offer.fare.booking_fee, Pence(300));
    }
}
