// =============================================================================
// SCHEDULER MODULE
// =============================================================================
// The clock collaborator: a background task that periodically evaluates
// active drops against their end_time and drives the completion/expiry
// transitions.
//
// Per tick:
// - active drops past end_time with at least one live reservation are
//   closed (which settles them); drops with none are expired,
// - completed drops whose settlement never finalized are resumed,
// - drops entering their final hour get one "ending soon" announcement.
//
// Every action is guarded by the same locks and idempotency checks the
// HTTP path uses, so a duplicate tick (or a second instance of the
// service) cannot double-settle a drop.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::db::Database;
use crate::lifecycle::{Actor, DropAction};
use crate::notify::{Kind, Notifier};
use crate::payment::PaymentGateway;
use crate::transitions;

/// Window before end_time in which the "ending soon" notification goes
/// out (once per drop).
const ENDING_SOON_WINDOW_HOURS: i64 = 1;

pub struct Scheduler {
    pub db: Database,
    pub redis: redis::aio::ConnectionManager,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Notifier,
    pub payment_timeout: Duration,
    pub drop_duration: chrono::Duration,
    pub interval: Duration,
}

impl Scheduler {
    /// Run forever. Spawned from main; errors are logged per item and
    /// never kill the loop.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        // A missed tick (slow settlement) should not cause a burst
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Same key the HTTP read path caches under; deletion is best-effort
    /// because the entry expires on its own TTL anyway.
    async fn invalidate_drop_cache(&self, id: uuid::Uuid) {
        let result: Result<(), _> = redis::cmd("DEL")
            .arg(crate::handlers::drop_cache_key(id))
            .query_async(&mut self.redis.clone())
            .await;
        if let Err(e) = result {
            tracing::warn!(drop_id = %id, error = %e, "Drop cache invalidation failed");
        }
    }

    async fn tick(&self) {
        let now = Utc::now();

        // ----- Close or expire due drops -----
        match self.db.due_active_drops(now).await {
            Ok(due) => {
                for drop in due {
                    let has_reservations = match self.db.has_authorized_reservations(drop.id).await
                    {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::error!(drop_id = %drop.id, error = %e, "Reservation check failed");
                            continue;
                        }
                    };

                    let action = if has_reservations {
                        DropAction::Close
                    } else {
                        DropAction::Expire
                    };

                    tracing::info!(
                        drop_id = %drop.id,
                        action = %action,
                        "Drop reached end_time"
                    );

                    match transitions::apply(
                        &self.db,
                        &self.gateway,
                        &self.notifier,
                        self.payment_timeout,
                        self.drop_duration,
                        drop.id,
                        action,
                        Actor::Scheduler,
                    )
                    .await
                    {
                        // The cached copy still says active; drop it so
                        // readers see the new status immediately
                        Ok(_) => self.invalidate_drop_cache(drop.id).await,
                        Err(e) => {
                            tracing::error!(drop_id = %drop.id, error = %e, "Scheduled transition failed")
                        }
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Due-drop query failed"),
        }

        // ----- Resume settlements that died mid-pass -----
        match self.db.unsettled_completed_drops().await {
            Ok(drops) => {
                for drop in drops {
                    tracing::warn!(drop_id = %drop.id, "Resuming unfinished settlement");
                    if let Err(e) = crate::settlement::settle(
                        &self.db,
                        &self.gateway,
                        &self.notifier,
                        self.payment_timeout,
                        drop.id,
                        drop.current_discount,
                    )
                    .await
                    {
                        tracing::error!(drop_id = %drop.id, error = %e, "Settlement resume failed");
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Unsettled-drop query failed"),
        }

        // ----- Announce drops entering their final hour -----
        let window = chrono::Duration::hours(ENDING_SOON_WINDOW_HOURS);
        match self.db.claim_ending_soon_drops(now, window).await {
            Ok(ending) => {
                for drop in ending {
                    match self.db.users_with_authorized_reservations(drop.id).await {
                        Ok(user_ids) => {
                            for uid in user_ids {
                                self.notifier.notify(
                                    uid,
                                    Kind::DropEnding,
                                    json!({
                                        "drop_id": drop.id,
                                        "end_time": drop.end_time,
                                        "current_discount": drop.current_discount,
                                    }),
                                );
                            }
                        }
                        Err(e) => {
                            tracing::warn!(drop_id = %drop.id, error = %e, "Ending-soon fan-out failed")
                        }
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "Ending-soon query failed"),
        }
    }
}
