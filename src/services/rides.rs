//! Ride operations
//!
//! Reads and user-facing mutations of the ride aggregate. All mutations go
//! through guarded single-row updates so concurrent requests and webhook
//! deliveries cannot double-apply a side effect.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::api::pagination::{Paginated, PaginationParams};
use crate::app::AppState;
use crate::domain::bid::{Location, Passenger, PaymentPoint, PricingModel};
use crate::domain::money::{split_commission, Pence};
use crate::domain::ride::{
    check_cancellable, BillDetails, CommissionDetails, PaymentStatus, Ride, RideStatus,
    SettlementDetails,
};
use crate::error::{ApiError, ApiResult};
use crate::services::notifications::{send_detached, NotificationTemplate};

/// Database row for a ride
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RideRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub pickup_location: serde_json::Value,
    pub dropoff_location: serde_json::Value,
    pub pickup_time: DateTime<Utc>,
    pub vehicle_type: String,
    pub vendor_id: String,
    pub vendor_name: String,
    pub fare: Decimal,
    pub original_fare: i64,
    pub final_fare: Option<i64>,
    pub status: String,
    pub pricing_model: String,
    pub payment_point: String,
    pub igo_booking_id: String,
    pub igo_availability_reference: String,
    pub igo_authorization_reference: String,
    pub passengers: serde_json::Value,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub vehicle_arrived_at: Option<DateTime<Utc>>,
    pub passenger_on_board_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub payment_status: String,
    pub payment_reference: Option<String>,
    pub transaction_reference: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,
    pub commission_details: Option<serde_json::Value>,
    pub bill_details: Option<serde_json::Value>,
    pub settlement_details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const RIDE_COLUMNS: &str = "id, user_id, pickup_location, dropoff_location, \
     pickup_time, vehicle_type, vendor_id, vendor_name, fare, original_fare, final_fare, \
     status, pricing_model, payment_point, igo_booking_id, igo_availability_reference, \
     igo_authorization_reference, passengers, dispatched_at, vehicle_arrived_at, \
     passenger_on_board_at, completed_at, cancelled_at, cancellation_reason, payment_status, \
     payment_reference, transaction_reference, payment_date, commission_details, bill_details, \
     settlement_details, created_at, updated_at";

impl TryFrom<RideRow> for Ride {
    type Error = ApiError;

    fn try_from(row: RideRow) -> Result<Self, Self::Error> {
        fn decode<T: serde::de::DeserializeOwned>(
            what: &str,
            value: serde_json::Value,
        ) -> ApiResult<T> {
            serde_json::from_value(value)
                .map_err(|e| ApiError::internal(format!("corrupt {what} on ride: {e}")))
        }

        let pickup_location: Location = decode("pickup location", row.pickup_location)?;
        let dropoff_location: Location = decode("dropoff location", row.dropoff_location)?;
        let passengers: Vec<Passenger> = decode("passengers", row.passengers)?;
        let commission_details: Option<CommissionDetails> = row
            .commission_details
            .map(|v| decode("commission details", v))
            .transpose()?;
        let bill_details: Option<BillDetails> = row
            .bill_details
            .map(|v| decode("bill details", v))
            .transpose()?;
        let settlement_details: Option<SettlementDetails> = row
            .settlement_details
            .map(|v| decode("settlement details", v))
            .transpose()?;

        Ok(Ride {
            id: row.id,
            user_id: row.user_id,
            pickup_location,
            dropoff_location,
            pickup_time: row.pickup_time,
            vehicle_type: row.vehicle_type,
            vendor_id: row.vendor_id,
            vendor_name: row.vendor_name,
            fare: row.fare,
            original_fare: Pence(row.original_fare),
            final_fare: row.final_fare.map(Pence),
            status: RideStatus::from(row.status),
            pricing_model: PricingModel::from(row.pricing_model),
            payment_point: PaymentPoint::from(row.payment_point),
            igo_booking_id: row.igo_booking_id,
            igo_availability_reference: row.igo_availability_reference,
            igo_authorization_reference: row.igo_authorization_reference,
            passengers,
            dispatched_at: row.dispatched_at,
            vehicle_arrived_at: row.vehicle_arrived_at,
            passenger_on_board_at: row.passenger_on_board_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
            cancellation_reason: row.cancellation_reason,
            payment_status: PaymentStatus::from(row.payment_status),
            payment_reference: row.payment_reference,
            transaction_reference: row.transaction_reference,
            payment_date: row.payment_date,
            commission_details,
            bill_details,
            settlement_details,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Fetch a ride scoped to its owner.
pub async fn get_ride(state: &AppState, user_id: Uuid, ride_id: Uuid) -> ApiResult<Ride> {
    let row = sqlx::query_as::<_, RideRow>(&format!(
        "SELECT {RIDE_COLUMNS} FROM rides WHERE id = $1 AND user_id = $2"
    ))
    .bind(ride_id)
    .bind(user_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found(format!("no ride found with id {ride_id}")))?;

    Ride::try_from(row)
}

/// Fetch a ride by vendor authorization reference. Webhook matching is
/// deliberately not user-scoped: the vendor does not know our users.
pub(crate) async fn find_by_authorization(
    db: &PgPool,
    authorization_reference: &str,
) -> ApiResult<Option<Ride>> {
    let row = sqlx::query_as::<_, RideRow>(&format!(
        "SELECT {RIDE_COLUMNS} FROM rides WHERE igo_authorization_reference = $1"
    ))
    .bind(authorization_reference)
    .fetch_optional(db)
    .await?;

    row.map(Ride::try_from).transpose()
}

/// Query parameters for the ride history listing.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RideHistoryQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    /// `date` (default) or `price`.
    #[serde(default)]
    pub sort: Option<String>,
    /// `asc` or `desc` (default).
    #[serde(default)]
    pub order: Option<String>,
}

/// List a user's rides, filterable by status and pickup-time window.
#[instrument(skip(state, query, pagination))]
pub async fn list_rides(
    state: &AppState,
    user_id: Uuid,
    query: RideHistoryQuery,
    pagination: PaginationParams,
) -> ApiResult<Paginated<Ride>> {
    let status_filter = match query.status.as_deref() {
        None => None,
        Some(s)
            if matches!(
                s,
                "pending"
                    | "booked"
                    | "dispatched"
                    | "vehicle_arrived"
                    | "passenger_on_board"
                    | "completed"
                    | "cancelled"
            ) =>
        {
            Some(s.to_string())
        }
        Some(other) => {
            return Err(ApiError::validation(format!(
                "unknown ride status filter '{other}'"
            )))
        }
    };

    let sort_column = match query.sort.as_deref() {
        None | Some("date") => "pickup_time",
        Some("price") => "fare",
        Some(other) => {
            return Err(ApiError::validation(format!(
                "unknown sort key '{other}', expected 'date' or 'price'"
            )))
        }
    };
    let sort_order = match query.order.as_deref() {
        None | Some("desc") => "DESC",
        Some("asc") => "ASC",
        Some(other) => {
            return Err(ApiError::validation(format!(
                "unknown sort order '{other}', expected 'asc' or 'desc'"
            )))
        }
    };

    let filter = "user_id = $1 \
         AND ($2::text IS NULL OR status = $2) \
         AND ($3::timestamptz IS NULL OR pickup_time >= $3) \
         AND ($4::timestamptz IS NULL OR pickup_time <= $4)";

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM rides WHERE {filter}"))
        .bind(user_id)
        .bind(&status_filter)
        .bind(query.from)
        .bind(query.to)
        .fetch_one(&state.db)
        .await?;

    let rows = sqlx::query_as::<_, RideRow>(&format!(
        "SELECT {RIDE_COLUMNS} FROM rides WHERE {filter} \
         ORDER BY {sort_column} {sort_order} LIMIT $5 OFFSET $6"
    ))
    .bind(user_id)
    .bind(&status_filter)
    .bind(query.from)
    .bind(query.to)
    .bind(pagination.limit() as i64)
    .bind(pagination.offset() as i64)
    .fetch_all(&state.db)
    .await?;

    let rides = rows
        .into_iter()
        .map(Ride::try_from)
        .collect::<ApiResult<Vec<_>>>()?;

    Ok(Paginated::new(rides, &pagination, total as u64))
}

/// Request DTO for user cancellation
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CancelRideRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// User-initiated cancellation. Legal only before dispatch. The vendor is
/// told first; if the vendor call fails the local cancel still goes ahead,
/// because the user's intent is authoritative and the vendor side is
/// reconciled out of band.
#[instrument(skip(state, req))]
pub async fn cancel_ride(
    state: &AppState,
    user_id: Uuid,
    ride_id: Uuid,
    req: CancelRideRequest,
) -> ApiResult<Ride> {
    let ride = get_ride(state, user_id, ride_id).await?;
    check_cancellable(ride.status)?;

    let reason = req
        .reason
        .unwrap_or_else(|| "cancelled by passenger".to_string());

    if let Err(e) = state
        .vendor
        .cancel_booking(&ride.igo_authorization_reference, &reason)
        .await
    {
        warn!(
            ride_id = %ride.id,
            authorization_reference = %ride.igo_authorization_reference,
            error = %e,
            "Vendor cancellation failed, cancelling locally anyway"
        );
    }

    let now = Utc::now();
    let updated = sqlx::query(
        r#"
        UPDATE rides
        SET status = 'cancelled', cancelled_at = $2, cancellation_reason = $3, updated_at = $2
        WHERE id = $1 AND status IN ('pending', 'booked')
        "#,
    )
    .bind(ride.id)
    .bind(now)
    .bind(&reason)
    .execute(&state.db)
    .await?;

    // A concurrent webhook may have moved the ride on since the guard check.
    if updated.rows_affected() == 0 {
        let current = get_ride(state, user_id, ride_id).await?;
        check_cancellable(current.status)?;
        return Err(ApiError::internal(format!(
            "cancellation lost a race on ride {ride_id}"
        )));
    }

    tracing::info!(ride_id = %ride.id, reason = %reason, "Ride cancelled by user");

    send_detached(
        state.notifier.clone(),
        user_id,
        NotificationTemplate::RideCancelled,
        serde_json::json!({ "ride_id": ride.id, "reason": reason }),
    );

    get_ride(state, user_id, ride_id).await
}

/// Request DTO for paying a completed ride
#[derive(Debug, Clone, Deserialize)]
pub struct PayRideRequest {
    pub payment_token: String,
}

/// Charge the fare for a completed ride (time-of-drop-off payment point, or
/// recovery after a failed booking-time charge). Idempotent: the payment
/// flags on the row are the source of truth, so a repeated call is rejected
/// as a duplicate rather than charged twice.
#[instrument(skip(state, req))]
pub async fn pay_ride(
    state: &AppState,
    user_id: Uuid,
    ride_id: Uuid,
    req: PayRideRequest,
) -> ApiResult<Ride> {
    let ride = get_ride(state, user_id, ride_id).await?;

    if ride.status != RideStatus::Completed {
        return Err(ApiError::InvalidTransition(format!(
            "cannot take payment for a ride in status '{}'",
            ride.status
        )));
    }
    if ride.payment_status == PaymentStatus::Paid {
        return Err(ApiError::duplicate("ride is already paid"));
    }

    // The charged amount is the ride's marked-up fare, which the event gate
    // refreshed from the final metered fare at completion time.
    let amount = ride.fare;
    let transaction_id = state
        .payments
        .authorize_hold(amount, &req.payment_token)
        .await?;
    state.payments.capture(&transaction_id).await?;

    let now = Utc::now();
    let split = split_commission(amount, state.pricing.commission_rate);
    let commission =
        CommissionDetails::from_split(split, state.pricing.commission_rate, now);
    let payment_reference = format!("PAY-{}", Uuid::new_v4());

    let updated = sqlx::query(
        r#"
        UPDATE rides
        SET payment_status = 'paid', payment_reference = $2, transaction_reference = $3,
            payment_date = $4, commission_details = $5, updated_at = $4
        WHERE id = $1 AND payment_status <> 'paid'
        "#,
    )
    .bind(ride.id)
    .bind(&payment_reference)
    .bind(&transaction_id)
    .bind(now)
    .bind(serde_json::to_value(&commission).unwrap_or_default())
    .execute(&state.db)
    .await?;

    if updated.rows_affected() == 0 {
        // Lost the race to another payment request; release our charge.
        if let Err(e) = state.payments.cancel_hold(&transaction_id).await {
            warn!(ride_id = %ride.id, error = %e, "Failed to release duplicate charge");
        }
        return Err(ApiError::duplicate("ride is already paid"));
    }

    tracing::info!(
        ride_id = %ride.id,
        amount = %amount,
        payment_reference = %payment_reference,
        "Ride payment captured"
    );

    // Tell the vendor a payment was recorded. Failure here is logged, not
    // surfaced: the charge already happened and must not be rolled back.
    let vendor_amount = ride.final_fare.unwrap_or(ride.original_fare);
    if let Err(e) = state
        .vendor
        .record_payment(
            &ride.igo_authorization_reference,
            vendor_amount,
            &transaction_id,
        )
        .await
    {
        warn!(
            ride_id = %ride.id,
            error = %e,
            "Vendor payment record failed after successful charge"
        );
    }

    send_detached(
        state.notifier.clone(),
        user_id,
        NotificationTemplate::PaymentReceipt,
        serde_json::json!({
            "ride_id": ride.id,
            "amount": amount,
            "payment_reference": payment_reference,
        }),
    );

    get_ride(state, user_id, ride_id).await
}

/// Fetch the vendor's itemized bill for a completed ride, caching it on the
/// row after the first successful fetch.
#[instrument(skip(state))]
pub async fn get_bill(state: &AppState, user_id: Uuid, ride_id: Uuid) -> ApiResult<BillDetails> {
    let ride = get_ride(state, user_id, ride_id).await?;

    if ride.status != RideStatus::Completed {
        return Err(ApiError::InvalidTransition(format!(
            "no bill before completion, ride is '{}'",
            ride.status
        )));
    }

    if let Some(bill) = ride.bill_details {
        return Ok(bill);
    }

    let bill = state
        .vendor
        .request_bill(&ride.igo_authorization_reference)
        .await?;

    sqlx::query("UPDATE rides SET bill_details = $2, updated_at = now() WHERE id = $1")
        .bind(ride.id)
        .bind(serde_json::to_value(&bill).unwrap_or_default())
        .execute(&state.db)
        .await?;

    Ok(bill)
}

/// A passenger-facing receipt for a completed, paid ride.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Receipt {
    pub ride_id: Uuid,
    pub vendor_name: String,
    pub pickup_address: String,
    pub dropoff_address: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub fare: Decimal,
    pub payment_reference: Option<String>,
    pub payment_date: Option<DateTime<Utc>>,
    pub line_items: Vec<crate::domain::ride::BillLineItem>,
}

pub async fn get_receipt(state: &AppState, user_id: Uuid, ride_id: Uuid) -> ApiResult<Receipt> {
    let ride = get_ride(state, user_id, ride_id).await?;

    if ride.status != RideStatus::Completed {
        return Err(ApiError::InvalidTransition(format!(
            "no receipt before completion, ride is '{}'",
            ride.status
        )));
    }
    if ride.payment_status != PaymentStatus::Paid {
        return Err(ApiError::validation("ride has not been paid yet"));
    }

    let line_items = ride
        .bill_details
        .map(|b| b.line_items)
        .unwrap_or_default();

    Ok(Receipt {
        ride_id: ride.id,
        vendor_name: ride.vendor_name,
        pickup_address: ride.pickup_location.address,
        dropoff_address: ride.dropoff_location.address,
        completed_at: ride.completed_at,
        fare: ride.fare,
        payment_reference: ride.payment_reference,
        payment_date: ride.payment_date,
        line_items,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::domain::money::PricingConfig;

    /// Insert a ride row in the given state and return its id. Paid rides get
    /// a payment date and a frozen commission split, matching what the
    /// payment path writes.
    pub(crate) async fn insert_ride(
        db: &PgPool,
        status: &str,
        payment_status: &str,
        authorization_reference: &str,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let fare = Decimal::new(2875, 2);
        let location = serde_json::json!({
            "address": "1 Station Road",
            "latitude": 51.5,
            "longitude": -0.12,
        });

        let (payment_date, commission) = if payment_status == "paid" {
            let pricing = PricingConfig::default();
            let commission = CommissionDetails::from_split(
                split_commission(fare, pricing.commission_rate),
                pricing.commission_rate,
                now,
            );
            (
                Some(now),
                Some(serde_json::to_value(&commission).unwrap_or_default()),
            )
        } else {
            (None, None)
        };

        sqlx::query(
            r#"
            INSERT INTO rides (id, user_id, pickup_location, dropoff_location, pickup_time,
                               vehicle_type, vendor_id, vendor_name, fare, original_fare, status,
                               pricing_model, payment_point, igo_booking_id,
                               igo_availability_reference, igo_authorization_reference,
                               payment_status, payment_date, commission_details)
            VALUES ($1, $2, $3, $3, $4, 'saloon', 'v1', 'Vendor One', $5, 2300, $6, 'fixed',
                    'time_of_drop_off', 'BKG-1', 'AVL-1', $7, $8, $9, $10)
            "#,
        )
        .bind(id)
        .bind(Uuid::new_v4())
        .bind(&location)
        .bind(now)
        .bind(fare)
        .bind(status)
        .bind(authorization_reference)
        .bind(payment_status)
        .bind(payment_date)
        .bind(commission)
        .execute(db)
        .await
        .expect("ride fixture insert failed");

        id
    }
}
