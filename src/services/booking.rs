//! Booking authorization orchestrator
//!
//! Turns a selected, availability-confirmed bid into a booked ride. The
//! vendor authorization call is the point of no return: once the vendor
//! confirms, a ride row exists and is never rolled back by later payment
//! trouble. The winning offer's fields are copied onto the ride so it stays
//! valid after the bid expires.

use chrono::Utc;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::domain::bid::{Bid, PaymentPoint, VendorOffer};
use crate::domain::money::{split_commission, PricingConfig};
use crate::domain::refs::{self, ChainedOperation, ReferenceChain};
use crate::domain::ride::{CommissionDetails, PaymentStatus, Ride, RideStatus};
use crate::error::{ApiError, ApiResult};
use crate::services::bids;
use crate::services::notifications::{send_detached, NotificationTemplate};
use crate::services::payments::PaymentGateway;
use crate::services::vendor::{AuthorizationRequest, AuthorizationResponse, VendorApi};

/// Request DTO for booking authorization
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeBookingRequest {
    /// Required when the selected offer charges at time of booking.
    #[serde(default)]
    pub payment_token: Option<String>,
}

/// Authorize the booking for a bid's selected offer and create the ride.
#[instrument(skip(state, req), fields(user_id = %user_id, bid_reference = bid_reference))]
pub async fn authorize_booking(
    state: &AppState,
    user_id: Uuid,
    bid_reference: &str,
    req: AuthorizeBookingRequest,
) -> ApiResult<Ride> {
    // Re-runs the lazy expiry check; an expired bid can no longer be booked.
    let bid = bids::get_bid(state, user_id, bid_reference).await?;
    ensure_not_yet_authorized(&bid)?;

    let offer = bid
        .selected_offer
        .clone()
        .ok_or_else(|| ApiError::validation("no offer has been selected for this bid"))?;
    let availability_reference = bid
        .availability_reference
        .clone()
        .ok_or_else(|| ApiError::validation("availability has not been confirmed for this bid"))?;

    if offer.payment_point == PaymentPoint::TimeOfBooking && req.payment_token.is_none() {
        return Err(ApiError::validation(
            "this offer charges at booking time; a payment token is required",
        ));
    }

    let booking_reference = refs::new_booking_reference();
    refs::validate_chain(
        ChainedOperation::Authorization,
        &ReferenceChain {
            bid: Some(&bid.bid_reference),
            availability: Some(&availability_reference),
            booking: Some(&booking_reference),
            ..Default::default()
        },
    )?;

    let authorization = state
        .vendor
        .authorize_booking(&AuthorizationRequest {
            availability_reference: availability_reference.clone(),
            booking_reference: booking_reference.clone(),
            pickup: bid.pickup.clone(),
            dropoff: bid.dropoff.clone(),
            pickup_time: bid.requested_time,
            quoted_price: offer.fare.total_price,
            passengers: bid.passengers.clone(),
        })
        .await?;

    let now = Utc::now();
    let ride_id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO rides (id, user_id, pickup_location, dropoff_location, pickup_time,
                           vehicle_type, vendor_id, vendor_name, fare, original_fare, status,
                           pricing_model, payment_point, igo_booking_id,
                           igo_availability_reference, igo_authorization_reference, passengers,
                           payment_status, vendor_response_logs, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                $18, $19, $20, $20)
        "#,
    )
    .bind(ride_id)
    .bind(user_id)
    .bind(serde_json::to_value(&bid.pickup).unwrap_or_default())
    .bind(serde_json::to_value(&bid.dropoff).unwrap_or_default())
    .bind(bid.requested_time)
    .bind(&offer.vehicle_type)
    .bind(&offer.vendor_id)
    .bind(&offer.vendor_name)
    .bind(offer.fare.display_price)
    .bind(offer.fare.total_price.0)
    .bind(RideStatus::Booked.to_string())
    .bind(offer.pricing_model.to_string())
    .bind(offer.payment_point.to_string())
    .bind(&booking_reference)
    .bind(&availability_reference)
    .bind(&authorization.authorization_reference)
    .bind(serde_json::to_value(&bid.passengers).unwrap_or_default())
    .bind(PaymentStatus::Pending.to_string())
    .bind(serde_json::json!([authorization.raw]))
    .bind(now)
    .execute(&state.db)
    .await?;

    sqlx::query(
        "UPDATE bids SET authorization_reference = $2 \
         WHERE id = $1 AND authorization_reference IS NULL",
    )
    .bind(bid.id)
    .bind(&authorization.authorization_reference)
    .execute(&state.db)
    .await?;

    tracing::info!(
        ride_id = %ride_id,
        booking_reference = %booking_reference,
        authorization_reference = %authorization.authorization_reference,
        vendor_id = %offer.vendor_id,
        "Booking authorized"
    );

    if offer.payment_point == PaymentPoint::TimeOfBooking {
        // Booking wins over payment: a failed charge leaves the ride booked
        // with payment still pending, recoverable through the payment
        // endpoint. The booking itself is never unwound here.
        if let Some(token) = req.payment_token.as_deref() {
            if let Err(e) = take_booking_payment(
                &state.db,
                state.payments.as_ref(),
                state.vendor.as_ref(),
                &state.pricing,
                ride_id,
                &offer,
                &authorization,
                token,
            )
            .await
            {
                warn!(
                    ride_id = %ride_id,
                    error = %e,
                    "Recording booking-time payment failed, ride stays booked"
                );
            }
        }
    }

    send_detached(
        state.notifier.clone(),
        user_id,
        NotificationTemplate::RideBooked,
        serde_json::json!({
            "ride_id": ride_id,
            "booking_reference": booking_reference,
            "vendor_name": offer.vendor_name,
            "pickup_time": bid.requested_time,
        }),
    );

    state
        .broadcaster
        .emit(
            &authorization.authorization_reference,
            "ride_booked",
            serde_json::json!({ "ride_id": ride_id, "status": "booked" }),
        )
        .await;

    crate::services::rides::get_ride(state, user_id, ride_id).await
}

/// One authorization per bid: a client retry after success must not book a
/// second ride with the vendor.
fn ensure_not_yet_authorized(bid: &Bid) -> ApiResult<()> {
    if bid.authorization_reference.is_some() {
        return Err(ApiError::duplicate(format!(
            "bid {} has already been authorized",
            bid.bid_reference
        )));
    }
    Ok(())
}

/// Attempt the booking-time charge. A declined or failed charge is logged
/// and leaves the ride booked with payment still pending; recovery is the
/// regular ride payment endpoint. Only a storage failure after a successful
/// charge is surfaced as an error.
#[allow(clippy::too_many_arguments)]
async fn take_booking_payment(
    db: &PgPool,
    payments: &dyn PaymentGateway,
    vendor: &dyn VendorApi,
    pricing: &PricingConfig,
    ride_id: Uuid,
    offer: &VendorOffer,
    authorization: &AuthorizationResponse,
    payment_token: &str,
) -> ApiResult<()> {
    let amount = offer.fare.display_price;
    let transaction_id = match payments.authorize_hold(amount, payment_token).await {
        Ok(id) => id,
        Err(e) => {
            warn!(
                ride_id = %ride_id,
                error = %e,
                "Booking-time charge declined, ride stays booked with payment pending"
            );
            return Ok(());
        }
    };
    if let Err(e) = payments.capture(&transaction_id).await {
        warn!(
            ride_id = %ride_id,
            error = %e,
            "Booking-time capture failed, ride stays booked with payment pending"
        );
        if let Err(e) = payments.cancel_hold(&transaction_id).await {
            warn!(ride_id = %ride_id, error = %e, "Failed to release uncaptured hold");
        }
        return Ok(());
    }

    let now = Utc::now();
    let split = split_commission(amount, pricing.commission_rate);
    let commission = CommissionDetails::from_split(split, pricing.commission_rate, now);
    let payment_reference = format!("PAY-{}", Uuid::new_v4());

    sqlx::query(
        r#"
        UPDATE rides
        SET payment_status = 'paid', payment_reference = $2, transaction_reference = $3,
            payment_date = $4, commission_details = $5, updated_at = $4
        WHERE id = $1 AND payment_status <> 'paid'
        "#,
    )
    .bind(ride_id)
    .bind(&payment_reference)
    .bind(&transaction_id)
    .bind(now)
    .bind(serde_json::to_value(&commission).unwrap_or_default())
    .execute(db)
    .await?;

    if let Err(e) = vendor
        .record_payment(
            &authorization.authorization_reference,
            offer.fare.total_price,
            &transaction_id,
        )
        .await
    {
        warn!(
            ride_id = %ride_id,
            error = %e,
            "Vendor payment record failed after successful charge"
        );
    }

    tracing::info!(
        ride_id = %ride_id,
        amount = %amount,
        payment_reference = %payment_reference,
        "Booking-time payment captured"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bid::{
        BidStatus, BidType, FareBreakdown, Location, Passenger, PricingModel,
    };
    use crate::services::rides::fixtures;
    use crate::services::vendor::MockVendor;
    use async_trait::async_trait;
    use rust_decimal::Decimal;

    struct DecliningGateway;

    #[async_trait]
    impl PaymentGateway for DecliningGateway {
        async fn authorize_hold(&self, _amount: Decimal, _token: &str) -> ApiResult<String> {
            Err(ApiError::validation("card declined"))
        }

        async fn capture(&self, _transaction_id: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn cancel_hold(&self, _transaction_id: &str) -> ApiResult<()> {
            Ok(())
        }

        async fn payout(
            &self,
            _vendor_id: &str,
            _amount: Decimal,
            _idempotency_key: &str,
        ) -> ApiResult<String> {
            Err(ApiError::validation("card declined"))
        }
    }

    fn sample_bid() -> Bid {
        let now = Utc::now();
        Bid {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            bid_reference: "BID-1".into(),
            status: BidStatus::Available,
            bid_type: BidType::Immediate,
            pickup: Location {
                address: "1 Station Road".into(),
                latitude: 51.5,
                longitude: -0.12,
            },
            dropoff: Location {
                address: "Airport".into(),
                latitude: 51.47,
                longitude: -0.45,
            },
            requested_time: now,
            passenger_count: 1,
            luggage_count: 0,
            vehicle_type: None,
            passengers: vec![Passenger {
                name: "Ada".into(),
                phone: None,
                email: None,
                is_lead: true,
            }],
            offers: vec![],
            selected_offer: None,
            availability_reference: Some("AVL-1".into()),
            authorization_reference: None,
            expires_at: now + chrono::Duration::minutes(5),
            created_at: now,
        }
    }

    fn sample_offer() -> VendorOffer {
        VendorOffer {
            vendor_id: "v1".into(),
            vendor_name: "Vendor One".into(),
            vendor_phone: None,
            vendor_rating: None,
            vehicle_type: "saloon".into(),
            eta_minutes: Some(5),
            payment_point: PaymentPoint::TimeOfBooking,
            pricing_model: PricingModel::Fixed,
            fare: FareBreakdown {
                display_price: Decimal::new(2875, 2),
                ..FareBreakdown::default()
            },
        }
    }

    #[test]
    fn a_bid_cannot_be_authorized_twice() {
        let mut bid = sample_bid();
        assert!(ensure_not_yet_authorized(&bid).is_ok());

        bid.authorization_reference = Some("AUTH-1".into());
        assert!(matches!(
            ensure_not_yet_authorized(&bid),
            Err(ApiError::Duplicate(_))
        ));
    }

    #[sqlx::test]
    #[ignore = "needs a postgres instance via DATABASE_URL"]
    async fn declined_booking_time_charge_leaves_payment_pending(pool: PgPool) {
        let ride_id = fixtures::insert_ride(&pool, "booked", "pending", "AUTH-DECLINE").await;
        let authorization = AuthorizationResponse {
            authorization_reference: "AUTH-DECLINE".into(),
            raw: serde_json::json!({}),
        };

        take_booking_payment(
            &pool,
            &DecliningGateway,
            &MockVendor,
            &PricingConfig::default(),
            ride_id,
            &sample_offer(),
            &authorization,
            "tok-1",
        )
        .await
        .unwrap();

        let (payment_status, payment_reference): (String, Option<String>) =
            sqlx::query_as("SELECT payment_status, payment_reference FROM rides WHERE id = $1")
                .bind(ride_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(payment_status, "pending");
        assert!(payment_reference.is_none());
    }

    #[sqlx::test]
    #[ignore = "needs a postgres instance via DATABASE_URL"]
    async fn successful_booking_time_charge_marks_the_ride_paid(pool: PgPool) {
        let ride_id = fixtures::insert_ride(&pool, "booked", "pending", "AUTH-CHARGE").await;
        let authorization = AuthorizationResponse {
            authorization_reference: "AUTH-CHARGE".into(),
            raw: serde_json::json!({}),
        };

        take_booking_payment(
            &pool,
            &crate::services::payments::MockPaymentGateway,
            &MockVendor,
            &PricingConfig::default(),
            ride_id,
            &sample_offer(),
            &authorization,
            "tok-1",
        )
        .await
        .unwrap();

        let payment_status: String =
            sqlx::query_scalar("SELECT payment_status FROM rides WHERE id = $1")
                .bind(ride_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(payment_status, "paid");
    }
}
