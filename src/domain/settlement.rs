//! Settlement domain types
//!
//! A settlement run pays vendors their share of completed, paid rides over a
//! period. Amounts were frozen into `commission_details` at payment time;
//! settlement only aggregates and marks, never reprices.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-vendor group inside a settlement run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorSettlement {
    pub vendor_id: String,
    pub vendor_name: String,
    pub ride_ids: Vec<Uuid>,
    pub vendor_payment: Decimal,
    pub commission_retained: Decimal,
}

/// The report artifact produced by one settlement run. Persisted as JSON for
/// operators; no other component reads its numbers back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementReport {
    pub settlement_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub dry_run: bool,
    pub rides_processed: usize,
    pub total_vendor_payments: Decimal,
    pub total_commission: Decimal,
    pub vendors: Vec<VendorSettlement>,
    pub generated_at: DateTime<Utc>,
}

/// Request DTO for triggering a settlement run.
#[derive(Debug, Clone, Deserialize)]
pub struct SettlementRunRequest {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    #[serde(default)]
    pub dry_run: bool,
}
