// =============================================================================
// NOTIFY MODULE
// =============================================================================
// Fire-and-forget notification publishing. This core only decides WHEN
// a user should hear about something; delivery is the dispatcher's
// problem. Events go out as JSON on a per-user Redis channel
// (notifications:<user_id>), and publish failures are logged, never
// propagated into the request path.
// =============================================================================

use serde_json::json;
use uuid::Uuid;

/// Notification kinds this core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    DiscountIncreased,
    DropEnding,
    DropCancelled,
    CaptureSucceeded,
    CaptureFailed,
    ReservationRefunded,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::DiscountIncreased => "discount_increased",
            Kind::DropEnding => "drop_ending",
            Kind::DropCancelled => "drop_cancelled",
            Kind::CaptureSucceeded => "capture_succeeded",
            Kind::CaptureFailed => "capture_failed",
            Kind::ReservationRefunded => "reservation_refunded",
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    redis: redis::aio::ConnectionManager,
}

impl Notifier {
    pub fn new(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }

    /// Publish one event to the user's channel. Spawned so the caller
    /// never waits on Redis; a lost notification is acceptable, a
    /// blocked reservation is not.
    pub fn notify(&self, user_id: Uuid, kind: Kind, payload: serde_json::Value) {
        let mut conn = self.redis.clone();
        let channel = format!("notifications:{}", user_id);
        let message = json!({
            "kind": kind.as_str(),
            "payload": payload,
        })
        .to_string();

        tokio::spawn(async move {
            let result: Result<(), redis::RedisError> = redis::cmd("PUBLISH")
                .arg(&channel)
                .arg(&message)
                .query_async(&mut conn)
                .await;

            if let Err(e) = result {
                tracing::warn!(channel = %channel, error = %e, "Failed to publish notification");
            }
        });
    }
}
