//! Settlement batcher
//!
//! Pays vendors their share of completed, paid, not-yet-settled rides over a
//! period. The run is at-least-once: a crash mid-batch leaves the remaining
//! rides unsettled and the next run picks them up, while the payout
//! idempotency key keeps repeated transfers for the same ride harmless.
//! Amounts come from the commission split frozen at payment time; nothing is
//! repriced here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{error, info, instrument, warn};

use crate::app::AppState;
use crate::domain::refs;
use crate::domain::ride::{CommissionDetails, Ride, SettlementDetails};
use crate::domain::settlement::{SettlementReport, SettlementRunRequest, VendorSettlement};
use crate::error::{ApiError, ApiResult};
use crate::services::payments::PaymentGateway;
use crate::services::rides::{RideRow, RIDE_COLUMNS};

/// Run one settlement batch over the requested period.
#[instrument(skip(state, req), fields(dry_run = req.dry_run))]
pub async fn run_settlement(
    state: &AppState,
    req: SettlementRunRequest,
) -> ApiResult<SettlementReport> {
    if req.period_end <= req.period_start {
        return Err(ApiError::validation(
            "settlement period end must be after its start",
        ));
    }

    let settlement_id = refs::new_settlement_id();
    let rides = settlement_candidates(&state.db, req.period_start, req.period_end).await?;

    info!(
        settlement_id = %settlement_id,
        candidates = rides.len(),
        "Settlement run started"
    );

    let mut vendors: BTreeMap<String, VendorSettlement> = BTreeMap::new();
    let mut rides_processed = 0usize;

    for ride in &rides {
        let Some(commission) = &ride.commission_details else {
            // Paid without a frozen split should not happen; skip rather
            // than guess an amount.
            warn!(ride_id = %ride.id, "Paid ride has no commission details, skipped");
            continue;
        };

        if !req.dry_run
            && !settle_ride(
                &state.db,
                state.payments.as_ref(),
                ride,
                commission,
                &settlement_id,
            )
            .await
        {
            continue;
        }

        let entry = vendors
            .entry(ride.vendor_id.clone())
            .or_insert_with(|| VendorSettlement {
                vendor_id: ride.vendor_id.clone(),
                vendor_name: ride.vendor_name.clone(),
                ride_ids: Vec::new(),
                vendor_payment: Decimal::ZERO,
                commission_retained: Decimal::ZERO,
            });
        entry.ride_ids.push(ride.id);
        entry.vendor_payment += commission.vendor_amount;
        entry.commission_retained += commission.commission_amount;
        rides_processed += 1;
    }

    let report = SettlementReport {
        settlement_id: settlement_id.clone(),
        period_start: req.period_start,
        period_end: req.period_end,
        dry_run: req.dry_run,
        rides_processed,
        total_vendor_payments: vendors.values().map(|v| v.vendor_payment).sum(),
        total_commission: vendors.values().map(|v| v.commission_retained).sum(),
        vendors: vendors.into_values().collect(),
        generated_at: Utc::now(),
    };

    if !req.dry_run {
        write_report(state, &report).await;
    }

    info!(
        settlement_id = %settlement_id,
        rides_processed = report.rides_processed,
        total_vendor_payments = %report.total_vendor_payments,
        total_commission = %report.total_commission,
        "Settlement run finished"
    );

    Ok(report)
}

/// Completed, paid, not-yet-settled rides whose payment fell in the period.
async fn settlement_candidates(
    db: &PgPool,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> ApiResult<Vec<Ride>> {
    let rows = sqlx::query_as::<_, RideRow>(&format!(
        r#"
        SELECT {RIDE_COLUMNS} FROM rides
        WHERE status = 'completed'
          AND payment_status = 'paid'
          AND settlement_details IS NULL
          AND payment_date >= $1 AND payment_date < $2
        ORDER BY payment_date
        "#
    ))
    .bind(period_start)
    .bind(period_end)
    .fetch_all(db)
    .await?;

    rows.into_iter().map(Ride::try_from).collect()
}

/// Pay out one ride and mark it settled. Returns whether the ride counts
/// toward this run. The payout goes first: if the transfer fails the row
/// stays unsettled and the next run retries it under the same idempotency
/// key.
async fn settle_ride(
    db: &PgPool,
    payments: &dyn PaymentGateway,
    ride: &Ride,
    commission: &CommissionDetails,
    settlement_id: &str,
) -> bool {
    let idempotency_key = format!("settle-{}", ride.id);
    if let Err(e) = payments
        .payout(&ride.vendor_id, commission.vendor_amount, &idempotency_key)
        .await
    {
        error!(
            ride_id = %ride.id,
            vendor_id = %ride.vendor_id,
            error = %e,
            "Vendor payout failed, ride stays unsettled"
        );
        return false;
    }

    let now = Utc::now();
    let details = SettlementDetails {
        settled: true,
        settled_at: now,
        settlement_id: settlement_id.to_string(),
        vendor_amount: commission.vendor_amount,
        commission_amount: commission.commission_amount,
    };

    let updated = sqlx::query(
        "UPDATE rides SET settlement_details = $2, updated_at = $3 \
         WHERE id = $1 AND settlement_details IS NULL",
    )
    .bind(ride.id)
    .bind(serde_json::to_value(&details).unwrap_or_default())
    .bind(now)
    .execute(db)
    .await;

    match updated {
        Ok(result) if result.rows_affected() == 1 => true,
        Ok(_) => {
            // A concurrent run got there first; the payout was idempotent.
            warn!(ride_id = %ride.id, "Ride was settled concurrently, not counted");
            false
        }
        Err(e) => {
            error!(ride_id = %ride.id, error = %e, "Failed to mark ride settled");
            false
        }
    }
}

/// Write the report artifact for operators. A write failure is logged, not
/// fatal: the settlement state of record is on the ride rows.
async fn write_report(state: &AppState, report: &SettlementReport) {
    let dir = state.settings.settlement_report_dir.clone();
    let path = format!("{}/{}.json", dir.trim_end_matches('/'), report.settlement_id);
    let body = match serde_json::to_vec_pretty(report) {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "Failed to encode settlement report");
            return;
        }
    };

    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        error!(dir = %dir, error = %e, "Failed to create settlement report directory");
        return;
    }
    match tokio::fs::write(&path, body).await {
        Ok(()) => info!(path = %path, "Settlement report written"),
        Err(e) => error!(path = %path, error = %e, "Failed to write settlement report"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::payments::MockPaymentGateway;
    use crate::services::rides::fixtures;
    use chrono::Duration;

    #[sqlx::test]
    #[ignore = "needs a postgres instance via DATABASE_URL"]
    async fn settled_rides_are_not_candidates(pool: PgPool) {
        let now = Utc::now();
        let unsettled = fixtures::insert_ride(&pool, "completed", "paid", "AUTH-S1").await;
        let settled = fixtures::insert_ride(&pool, "completed", "paid", "AUTH-S2").await;
        sqlx::query("UPDATE rides SET settlement_details = '{}'::jsonb WHERE id = $1")
            .bind(settled)
            .execute(&pool)
            .await
            .unwrap();

        let candidates =
            settlement_candidates(&pool, now - Duration::days(1), now + Duration::days(1))
                .await
                .unwrap();
        let ids: Vec<_> = candidates.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![unsettled]);
    }

    #[sqlx::test]
    #[ignore = "needs a postgres instance via DATABASE_URL"]
    async fn a_ride_settles_once_across_repeated_runs(pool: PgPool) {
        let now = Utc::now();
        fixtures::insert_ride(&pool, "completed", "paid", "AUTH-S3").await;
        let ride = settlement_candidates(&pool, now - Duration::days(1), now + Duration::days(1))
            .await
            .unwrap()
            .pop()
            .unwrap();
        let commission = ride.commission_details.clone().unwrap();

        assert!(settle_ride(&pool, &MockPaymentGateway, &ride, &commission, "STL-1").await);
        // A crashed batch rerunning over the same period finds nothing to pay.
        assert!(!settle_ride(&pool, &MockPaymentGateway, &ride, &commission, "STL-2").await);

        let remaining =
            settlement_candidates(&pool, now - Duration::days(1), now + Duration::days(1))
                .await
                .unwrap();
        assert!(remaining.is_empty());
    }
}
