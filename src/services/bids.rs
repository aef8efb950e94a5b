//! Bid aggregator
//!
//! Fans a ride request out to the vendor network's multi-vendor bid
//! endpoint, normalizes the heterogeneous offers into one schema, persists
//! them with a five-minute validity window, and resolves selection of the
//! winning offer. Expiry is enforced lazily on every read; there is no
//! background sweep.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::app::AppState;
use crate::domain::bid::{
    bid_validity, Bid, BidStatus, BidType, RequestBidsRequest, SelectBidResponse, VendorOffer,
};
use crate::domain::money::{apply_markup, PricingConfig};
use crate::domain::refs::{self, ChainedOperation, ReferenceChain};
use crate::error::{ApiError, ApiResult};
use crate::services::notifications::{send_detached, NotificationTemplate};
use crate::services::vendor::{AvailabilityRequest, RawOffer, VendorBidRequest};

/// Requests further out than this are prebookings.
fn prebook_horizon() -> Duration {
    Duration::minutes(30)
}

/// Database row for a bid
#[derive(Debug, sqlx::FromRow)]
struct BidRow {
    id: Uuid,
    user_id: Uuid,
    bid_reference: String,
    status: String,
    bid_type: String,
    pickup: serde_json::Value,
    dropoff: serde_json::Value,
    requested_time: DateTime<Utc>,
    passenger_count: i32,
    luggage_count: i32,
    vehicle_type: Option<String>,
    passengers: serde_json::Value,
    offers: serde_json::Value,
    selected_offer: Option<serde_json::Value>,
    availability_reference: Option<String>,
    authorization_reference: Option<String>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

const BID_COLUMNS: &str = "id, user_id, bid_reference, status, bid_type, pickup, dropoff, \
     requested_time, passenger_count, luggage_count, vehicle_type, passengers, offers, \
     selected_offer, availability_reference, authorization_reference, expires_at, created_at";

impl TryFrom<BidRow> for Bid {
    type Error = ApiError;

    fn try_from(row: BidRow) -> Result<Self, Self::Error> {
        fn decode<T: serde::de::DeserializeOwned>(
            what: &str,
            value: serde_json::Value,
        ) -> ApiResult<T> {
            serde_json::from_value(value)
                .map_err(|e| ApiError::internal(format!("corrupt {what} on bid: {e}")))
        }

        Ok(Bid {
            id: row.id,
            user_id: row.user_id,
            bid_reference: row.bid_reference,
            status: BidStatus::from(row.status),
            bid_type: BidType::from(row.bid_type),
            pickup: decode("pickup", row.pickup)?,
            dropoff: decode("dropoff", row.dropoff)?,
            requested_time: row.requested_time,
            passenger_count: row.passenger_count,
            luggage_count: row.luggage_count,
            vehicle_type: row.vehicle_type,
            passengers: decode("passengers", row.passengers)?,
            offers: decode("offers", row.offers)?,
            selected_offer: row
                .selected_offer
                .map(|v| decode("selected offer", v))
                .transpose()?,
            availability_reference: row.availability_reference,
            authorization_reference: row.authorization_reference,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}

/// Turn a raw vendor quote into the platform offer schema, applying the
/// markup exactly once.
fn normalize_offer(raw: RawOffer, pricing: &PricingConfig) -> VendorOffer {
    let mut fare = raw.fare;
    fare.display_price = apply_markup(fare.total_price, pricing.markup_rate);
    VendorOffer {
        vendor_id: raw.vendor_id,
        vendor_name: raw.vendor_name,
        vendor_phone: raw.vendor_phone,
        vendor_rating: raw.vendor_rating,
        vehicle_type: raw.vehicle_type,
        eta_minutes: raw.eta_minutes,
        payment_point: raw.payment_point,
        pricing_model: raw.pricing_model,
        fare,
    }
}

/// Request quotes from every vendor covering the route and persist the
/// resulting bid.
#[instrument(skip(state, req), fields(user_id = %user_id))]
pub async fn request_bids(
    state: &AppState,
    user_id: Uuid,
    user_email: Option<String>,
    req: RequestBidsRequest,
) -> ApiResult<Bid> {
    req.validate()?;

    let now = Utc::now();
    let bid_reference = refs::new_bid_reference();
    let bid_type = if req.pickup_time > now + prebook_horizon() {
        BidType::Prebook
    } else {
        BidType::Immediate
    };

    let raw_offers = state
        .vendor
        .request_bids(&VendorBidRequest {
            bid_reference: bid_reference.clone(),
            pickup: req.pickup.clone(),
            dropoff: req.dropoff.clone(),
            pickup_time: req.pickup_time,
            vehicle_type: req.vehicle_type.clone(),
            passenger_count: req.passenger_count,
            luggage_count: req.luggage_count,
        })
        .await?;

    let offers: Vec<VendorOffer> = raw_offers
        .into_iter()
        .map(|raw| normalize_offer(raw, &state.pricing))
        .collect();

    let status = if offers.is_empty() {
        BidStatus::Unavailable
    } else {
        BidStatus::Available
    };

    let bid = Bid {
        id: Uuid::new_v4(),
        user_id,
        bid_reference,
        status,
        bid_type,
        pickup: req.pickup,
        dropoff: req.dropoff,
        requested_time: req.pickup_time,
        passenger_count: req.passenger_count,
        luggage_count: req.luggage_count,
        vehicle_type: req.vehicle_type,
        passengers: req.passengers,
        offers,
        selected_offer: None,
        availability_reference: None,
        authorization_reference: None,
        expires_at: now + bid_validity(),
        created_at: now,
    };

    insert_bid(&state.db, &bid).await?;

    tracing::info!(
        bid_reference = %bid.bid_reference,
        offers = bid.offers.len(),
        status = %bid.status,
        "Bid created"
    );

    // Quotes-ready notification: non-blocking, and a failed send never
    // fails the request.
    if !bid.offers.is_empty() && user_email.is_some() {
        send_detached(
            state.notifier.clone(),
            user_id,
            NotificationTemplate::QuotesReady,
            serde_json::json!({
                "bid_reference": bid.bid_reference,
                "offer_count": bid.offers.len(),
                "expires_at": bid.expires_at,
            }),
        );
    }

    Ok(bid)
}

async fn insert_bid(db: &PgPool, bid: &Bid) -> ApiResult<()> {
    sqlx::query(
        r#"
        INSERT INTO bids (id, user_id, bid_reference, status, bid_type, pickup, dropoff,
                          requested_time, passenger_count, luggage_count, vehicle_type,
                          passengers, offers, expires_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(bid.id)
    .bind(bid.user_id)
    .bind(&bid.bid_reference)
    .bind(bid.status.to_string())
    .bind(bid.bid_type.to_string())
    .bind(serde_json::to_value(&bid.pickup).unwrap_or_default())
    .bind(serde_json::to_value(&bid.dropoff).unwrap_or_default())
    .bind(bid.requested_time)
    .bind(bid.passenger_count)
    .bind(bid.luggage_count)
    .bind(&bid.vehicle_type)
    .bind(serde_json::to_value(&bid.passengers).unwrap_or_default())
    .bind(serde_json::to_value(&bid.offers).unwrap_or_default())
    .bind(bid.expires_at)
    .bind(bid.created_at)
    .execute(db)
    .await?;

    Ok(())
}

/// Fetch a bid for its owner, enforcing lazy expiry: a bid past its window
/// is flipped to unavailable in storage (once) and reported as expired.
#[instrument(skip(state))]
pub async fn get_bid(state: &AppState, user_id: Uuid, bid_reference: &str) -> ApiResult<Bid> {
    let row = sqlx::query_as::<_, BidRow>(&format!(
        "SELECT {BID_COLUMNS} FROM bids WHERE bid_reference = $1 AND user_id = $2"
    ))
    .bind(bid_reference)
    .bind(user_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found(format!("no bid found for reference {bid_reference}")))?;

    let mut bid = Bid::try_from(row)?;

    let now = Utc::now();
    if bid.is_expired(now) {
        expire_bid(&state.db, bid.id).await?;
        bid.status = BidStatus::Unavailable;

        return Err(ApiError::Expired {
            expired_at: bid.expires_at,
        });
    }

    Ok(bid)
}

/// Flip an expired bid to unavailable in storage. Guarded: re-reading an
/// already-expired bid writes nothing. Returns whether this call did the
/// flip.
pub(crate) async fn expire_bid(db: &PgPool, bid_id: Uuid) -> ApiResult<bool> {
    let updated =
        sqlx::query("UPDATE bids SET status = 'unavailable' WHERE id = $1 AND status <> 'unavailable'")
            .bind(bid_id)
            .execute(db)
            .await?;

    Ok(updated.rows_affected() == 1)
}

/// Select the winning offer and immediately confirm availability with the
/// vendor, using the passenger/luggage counts stored on the bid. Selection
/// must not silently change the party size.
#[instrument(skip(state))]
pub async fn select_bid(
    state: &AppState,
    user_id: Uuid,
    bid_reference: &str,
    vendor_id: &str,
) -> ApiResult<SelectBidResponse> {
    let bid = get_bid(state, user_id, bid_reference).await?;

    let offer = bid
        .offer_for_vendor(vendor_id)
        .cloned()
        .ok_or_else(|| ApiError::not_found(format!("no offer from vendor {vendor_id} in bid")))?;

    sqlx::query("UPDATE bids SET selected_offer = $2 WHERE id = $1")
        .bind(bid.id)
        .bind(serde_json::to_value(&offer).unwrap_or_default())
        .execute(&state.db)
        .await?;

    refs::validate_chain(
        ChainedOperation::AvailabilityCheck,
        &ReferenceChain {
            bid: Some(&bid.bid_reference),
            ..Default::default()
        },
    )?;

    // Time-sensitive, never retried: a stale retry may come back with a
    // different, unacceptable price.
    let availability_reference = state
        .vendor
        .check_availability(&AvailabilityRequest {
            bid_reference: bid.bid_reference.clone(),
            vendor_id: vendor_id.to_string(),
            quoted_price: offer.fare.total_price,
            passenger_count: bid.passenger_count,
            luggage_count: bid.luggage_count,
        })
        .await?;

    sqlx::query("UPDATE bids SET availability_reference = $2 WHERE id = $1")
        .bind(bid.id)
        .bind(&availability_reference)
        .execute(&state.db)
        .await?;

    tracing::info!(
        bid_reference = %bid.bid_reference,
        vendor_id = vendor_id,
        availability_reference = %availability_reference,
        "Offer selected and availability confirmed"
    );

    Ok(SelectBidResponse {
        bid_reference: bid.bid_reference,
        availability_reference,
        selected_bid: offer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bid::{FareBreakdown, Location, Passenger, PaymentPoint, PricingModel};
    use crate::domain::money::Pence;
    use crate::services::vendor::{MockVendor, VendorApi};
    use rust_decimal::Decimal;

    fn sample_offer(vendor_id: &str) -> VendorOffer {
        VendorOffer {
            vendor_id: vendor_id.to_string(),
            vendor_name: "Vendor One".into(),
            vendor_phone: None,
            vendor_rating: None,
            vehicle_type: "saloon".into(),
            eta_minutes: Some(5),
            payment_point: PaymentPoint::TimeOfDropOff,
            pricing_model: PricingModel::Fixed,
            fare: FareBreakdown::default(),
        }
    }

    fn sample_bid(expires_at: DateTime<Utc>) -> Bid {
        let now = Utc::now();
        Bid {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            bid_reference: refs::new_bid_reference(),
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
            passenger_count: 2,
            luggage_count: 1,
            vehicle_type: None,
            passengers: vec![Passenger {
                name: "Ada".into(),
                phone: None,
                email: None,
                is_lead: true,
            }],
            offers: vec![sample_offer("v1")],
            selected_offer: None,
            availability_reference: None,
            authorization_reference: None,
            expires_at,
            created_at: now,
        }
    }

    #[test]
    fn bid_row_jsonb_columns_decode_into_their_own_types() {
        let now = Utc::now();
        let offer = sample_offer("v1");
        let row = BidRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            bid_reference: "BID-ROW".into(),
            status: "available".into(),
            bid_type: "immediate".into(),
            pickup: serde_json::json!({"address": "A", "latitude": 51.5, "longitude": -0.12}),
            dropoff: serde_json::json!({"address": "B", "latitude": 51.47, "longitude": -0.45}),
            requested_time: now,
            passenger_count: 2,
            luggage_count: 1,
            vehicle_type: None,
            passengers: serde_json::json!([
                {"name": "Ada", "phone": null, "email": null, "is_lead": true}
            ]),
            offers: serde_json::to_value(vec![offer.clone()]).unwrap(),
            selected_offer: Some(serde_json::to_value(&offer).unwrap()),
            availability_reference: None,
            authorization_reference: None,
            expires_at: now,
            created_at: now,
        };

        let bid = Bid::try_from(row).unwrap();
        assert_eq!(bid.passengers.len(), 1);
        assert!(bid.passengers[0].is_lead);
        assert_eq!(bid.offers.len(), 1);
        assert_eq!(bid.selected_offer.unwrap().vendor_id, "v1");
    }

    #[test]
    fn corrupt_jsonb_surfaces_as_internal_error() {
        let now = Utc::now();
        let row = BidRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            bid_reference: "BID-ROW".into(),
            status: "available".into(),
            bid_type: "immediate".into(),
            pickup: serde_json::json!({"address": "A", "latitude": 51.5, "longitude": -0.12}),
            dropoff: serde_json::json!({"address": "B", "latitude": 51.47, "longitude": -0.45}),
            requested_time: now,
            passenger_count: 2,
            luggage_count: 1,
            vehicle_type: None,
            passengers: serde_json::json!("not a list"),
            offers: serde_json::json!([]),
            selected_offer: None,
            availability_reference: None,
            authorization_reference: None,
            expires_at: now,
            created_at: now,
        };

        assert!(matches!(Bid::try_from(row), Err(ApiError::Internal(_))));
    }

    #[sqlx::test]
    #[ignore = "needs a postgres instance via DATABASE_URL"]
    async fn expired_bid_is_flipped_in_storage_exactly_once(pool: PgPool) {
        let bid = sample_bid(Utc::now() - Duration::minutes(1));
        insert_bid(&pool, &bid).await.unwrap();

        assert!(expire_bid(&pool, bid.id).await.unwrap());
        assert!(!expire_bid(&pool, bid.id).await.unwrap());

        let status: String = sqlx::query_scalar("SELECT status FROM bids WHERE id = $1")
            .bind(bid.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "unavailable");
    }

    fn bid_request() -> VendorBidRequest {
        VendorBidRequest {
            bid_reference: "BID-TEST".into(),
            pickup: crate::domain::bid::Location {
                address: "1 Station Road".into(),
                latitude: 51.5,
                longitude: -0.12,
            },
            dropoff: crate::domain::bid::Location {
                address: "Airport".into(),
                latitude: 51.47,
                longitude: -0.45,
            },
            pickup_time: Utc::now(),
            vehicle_type: None,
            passenger_count: 2,
            luggage_count: 1,
        }
    }

    #[test]
    fn mock_vendor_quote_gets_marked_up_display_price() {
        let offers = tokio_test::block_on(MockVendor.request_bids(&bid_request())).unwrap();
        let cheapest = offers
            .into_iter()
            .min_by_key(|o| o.fare.total_price)
            .unwrap();
        assert_eq!(cheapest.fare.total_price, Pence(2300));

        // 2300p quoted, 25% markup: the user sees GBP 28.75
        let offer = normalize_offer(cheapest, &PricingConfig::default());
        assert_eq!(offer.fare.display_price, Decimal::new(2875, 2));
        assert_eq!(offer.fare.total_price, Pence(2300));
    }

    #[test]
    fn normalization_does_not_touch_vendor_pence_amounts() {
        let offers = tokio_test::block_on(MockVendor.request_bids(&bid_request())).unwrap();
        for raw in offers {
            let total = raw.fare.total_price;
            let offer = normalize_offer(raw, &PricingConfig::default());
            assert_eq!(offer.fare.total_price, total);
        }
    }
}
