//! Notification dispatcher
//!
//! Outbound user notifications are fire-and-forget: content and transport
//! live in a separate delivery pipeline, this side only records what should
//! be sent. A failed send is logged and swallowed; it must never fail the
//! operation that triggered it.

#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// The notification templates this backend can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationTemplate {
    QuotesReady,
    RideBooked,
    RideCancelled,
    RideCompleted,
    PaymentReceipt,
}

impl std::fmt::Display for NotificationTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QuotesReady => write!(f, "quotes_ready"),
            Self::RideBooked => write!(f, "ride_booked"),
            Self::RideCancelled => write!(f, "ride_cancelled"),
            Self::RideCompleted => write!(f, "ride_completed"),
            Self::PaymentReceipt => write!(f, "payment_receipt"),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        user_id: Uuid,
        template: NotificationTemplate,
        data: serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Queue a notification without blocking or failing the caller.
pub fn send_detached(
    notifier: Arc<dyn Notifier>,
    user_id: Uuid,
    template: NotificationTemplate,
    data: serde_json::Value,
) {
    tokio::spawn(async move {
        if let Err(e) = notifier.send(user_id, template, data).await {
            tracing::warn!(
                user_id = %user_id,
                template = %template,
                error = %e,
                "Notification send failed"
            );
        }
    });
}

/// Default dispatcher: writes the pending notification to the outbox table,
/// where the delivery pipeline picks it up.
#[derive(Clone)]
pub struct OutboxNotifier {
    db: PgPool,
}

impl OutboxNotifier {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn send(
        &self,
        user_id: Uuid,
        template: NotificationTemplate,
        data: serde_json::Value,
    ) -> anyhow::Result<()> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO notification_outbox (id, user_id, template, data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(template.to_string())
        .bind(&data)
        .execute(&self.db)
        .await?;

        tracing::info!(
            user_id = %user_id,
            template = %template,
            notification_id = %id,
            "Notification queued"
        );
        Ok(())
    }
}
