//! Real-time push channel
//!
//! Ride-room subscribers (keyed by booking/authorization reference) get live
//! status updates. The transport is injected so the event gate and state
//! machine can be exercised without a live socket layer; nothing here is a
//! process-global singleton.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn emit(&self, room: &str, event: &str, payload: serde_json::Value);
}

/// Emits into the tracing stream only. Stands in where no push transport is
/// configured.
#[derive(Debug, Clone, Default)]
pub struct LogBroadcaster;

#[async_trait]
impl Broadcaster for LogBroadcaster {
    async fn emit(&self, room: &str, event: &str, payload: serde_json::Value) {
        tracing::debug!(room = room, event = event, payload = %payload, "Broadcast");
    }
}

/// Captures emissions for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    pub emitted: Mutex<Vec<(String, String, serde_json::Value)>>,
}

#[async_trait]
impl Broadcaster for RecordingBroadcaster {
    async fn emit(&self, room: &str, event: &str, payload: serde_json::Value) {
        self.emitted
            .lock()
            .push((room.to_string(), event.to_string(), payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_broadcaster_captures_emissions_in_order() {
        let broadcaster = RecordingBroadcaster::default();
        tokio_test::block_on(async {
            broadcaster
                .emit("AUTH-1", "ride_status", serde_json::json!({"status": "dispatched"}))
                .await;
            broadcaster
                .emit("AUTH-1", "ride_status", serde_json::json!({"status": "completed"}))
                .await;
        });

        let emitted = broadcaster.emitted.lock();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].0, "AUTH-1");
        assert_eq!(emitted[1].2["status"], "completed");
    }
}
