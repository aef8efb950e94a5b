//! Payment-hold capability
//!
//! The actual processor integration lives in a separate payment service;
//! this client only knows how to place, capture and release a hold for an
//! amount and a payment token. Amounts are pounds, 2dp.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Place a hold for `amount` against `payment_token`. Returns the
    /// processor's transaction id.
    async fn authorize_hold(&self, amount: Decimal, payment_token: &str) -> ApiResult<String>;

    /// Capture a previously placed hold.
    async fn capture(&self, transaction_id: &str) -> ApiResult<()>;

    /// Release a previously placed hold without capturing.
    async fn cancel_hold(&self, transaction_id: &str) -> ApiResult<()>;

    /// Transfer a vendor their settlement share. `idempotency_key` must make
    /// the transfer safe to repeat: settlement is at-least-once and a crash
    /// mid-batch will retry unsettled rides on the next run.
    async fn payout(
        &self,
        vendor_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> ApiResult<String>;
}

/// Client for the payment service.
#[derive(Clone)]
pub struct PaymentClient {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct PaymentErrorResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
struct HoldResponse {
    transaction_id: String,
}

impl PaymentClient {
    pub fn new(base_url: &str, token: &str, timeout_seconds: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn post<B: serde::Serialize>(&self, path: &str, body: &B) -> ApiResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .header("X-Internal-Token", &self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Payment service request failed");
                ApiError::Internal(anyhow::anyhow!("payment service unavailable: {e}"))
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .json::<PaymentErrorResponse>()
            .await
            .map(|e| e.message)
            .unwrap_or_else(|_| format!("payment service error: {status}"));

        match status {
            StatusCode::BAD_REQUEST | StatusCode::PAYMENT_REQUIRED => {
                Err(ApiError::Validation(message))
            }
            StatusCode::CONFLICT => Err(ApiError::Duplicate(message)),
            _ => {
                error!(status = %status, message = %message, "Payment service error");
                Err(ApiError::Internal(anyhow::anyhow!(message)))
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for PaymentClient {
    #[instrument(skip(self, payment_token))]
    async fn authorize_hold(&self, amount: Decimal, payment_token: &str) -> ApiResult<String> {
        #[derive(serde::Serialize)]
        struct Request<'a> {
            amount: Decimal,
            currency: &'static str,
            payment_token: &'a str,
        }

        let response = self
            .post(
                "/v1/holds",
                &Request {
                    amount,
                    currency: "GBP",
                    payment_token,
                },
            )
            .await?;

        let hold: HoldResponse = response.json().await.map_err(|e| {
            ApiError::Internal(anyhow::anyhow!("invalid payment service response: {e}"))
        })?;
        Ok(hold.transaction_id)
    }

    #[instrument(skip(self))]
    async fn capture(&self, transaction_id: &str) -> ApiResult<()> {
        #[derive(serde::Serialize)]
        struct Empty {}

        self.post(&format!("/v1/holds/{transaction_id}/capture"), &Empty {})
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn cancel_hold(&self, transaction_id: &str) -> ApiResult<()> {
        #[derive(serde::Serialize)]
        struct Empty {}

        self.post(&format!("/v1/holds/{transaction_id}/cancel"), &Empty {})
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn payout(
        &self,
        vendor_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> ApiResult<String> {
        #[derive(serde::Serialize)]
        struct Request<'a> {
            vendor_id: &'a str,
            amount: Decimal,
            currency: &'static str,
            idempotency_key: &'a str,
        }

        let response = self
            .post(
                "/v1/payouts",
                &Request {
                    vendor_id,
                    amount,
                    currency: "GBP",
                    idempotency_key,
                },
            )
            .await?;

        let hold: HoldResponse = response.json().await.map_err(|e| {
            ApiError::Internal(anyhow::anyhow!("invalid payment service response: {e}"))
        })?;
        Ok(hold.transaction_id)
    }
}

/// Always-approving gateway for dev environments and tests.
#[derive(Debug, Clone, Default)]
pub struct MockPaymentGateway;

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn authorize_hold(&self, _amount: Decimal, _payment_token: &str) -> ApiResult<String> {
        Ok(format!("txn-{}", Uuid::new_v4()))
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
        idempotency_key: &str,
    ) -> ApiResult<String> {
        Ok(format!("payout-{idempotency_key}"))
    }
}
