// =============================================================================
// TRANSITIONS MODULE
// =============================================================================
// Orchestration around the pure state machine in lifecycle.rs: the row
// lock, the time gate for scheduler actions, and the side effects each
// target state carries.
//
// Side effects:
// - entering `active` stamps start/end times and initializes the
//   discount to the bottom of the band,
// - entering `completed` runs settlement immediately after the status
//   commit (the status flip stops new reservations; the report appears
//   once the capture pass finishes),
// - entering `cancelled` refunds every live reservation.
//
// The FOR UPDATE lock means two concurrent transitions on one drop
// serialize: the loser re-reads the new status and fails cleanly in the
// state machine instead of clobbering.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::lifecycle::{self, Actor, DropAction};
use crate::models::{Drop, DropStatus};
use crate::notify::{Kind, Notifier};
use crate::payment::{with_timeout, PaymentGateway};
use crate::settlement;

/// Apply a lifecycle action to a drop and run its side effects.
/// Returns the drop as it stands afterwards.
#[allow(clippy::too_many_arguments)]
pub async fn apply(
    db: &Database,
    gateway: &Arc<dyn PaymentGateway>,
    notifier: &Notifier,
    payment_timeout: Duration,
    drop_duration: chrono::Duration,
    drop_id: Uuid,
    action: DropAction,
    actor: Actor,
) -> AppResult<Drop> {
    let now = Utc::now();

    let mut tx = db.begin().await?;
    let drop = db
        .lock_drop(&mut tx, drop_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("drop {}", drop_id)))?;

    let target = lifecycle::transition(drop.status, action, actor)?;

    // The scheduler acts on the clock alone: it may only close or
    // expire a drop whose window has actually ended. Admins may close
    // early ("manual close").
    if actor == Actor::Scheduler
        && matches!(action, DropAction::Close | DropAction::Expire)
        && !drop.is_past_end(now)
    {
        return Err(AppError::State(format!(
            "drop {} has not reached its end_time",
            drop_id
        )));
    }

    match (action, target) {
        (DropAction::Activate, DropStatus::Active) => {
            db.activate_drop(&mut tx, drop_id, now, now + drop_duration)
                .await?;
        }
        _ => {
            db.set_drop_status(&mut tx, drop_id, target).await?;
        }
    }

    tx.commit().await?;

    crate::metrics::record_transition(action, target);
    tracing::info!(
        drop_id = %drop_id,
        from = drop.status.as_str(),
        to = target.as_str(),
        actor = %actor,
        "Drop transition applied"
    );

    match target {
        DropStatus::Completed => {
            // Settle before answering; the settlement guard makes a
            // duplicate close (or a retried request) a no-op
            settlement::settle(
                db,
                gateway,
                notifier,
                payment_timeout,
                drop_id,
                drop.current_discount,
            )
            .await?;
        }
        DropStatus::Cancelled => {
            refund_all_reservations(db, gateway, notifier, payment_timeout, drop_id).await;
        }
        _ => {}
    }

    db.get_drop(drop_id)
        .await?
        .ok_or_else(|| AppError::Internal(format!("drop {} vanished after transition", drop_id)))
}

/// Drop cancelled before capture: every live hold is released and its
/// reservation refunded. Per-reservation failures are logged and the
/// pass continues; a stuck hold expires at the processor eventually.
async fn refund_all_reservations(
    db: &Database,
    gateway: &Arc<dyn PaymentGateway>,
    notifier: &Notifier,
    payment_timeout: Duration,
    drop_id: Uuid,
) {
    let reservations = match db.settlement_candidates(drop_id).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(drop_id = %drop_id, error = %e, "Refund pass query failed");
            return;
        }
    };

    for reservation in reservations {
        let claimed = match db
            .claim_reservation_refund(reservation.id, reservation.user_id)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(reservation_id = %reservation.id, error = %e, "Refund claim failed");
                continue;
            }
        };
        if !claimed {
            continue;
        }

        if let Some(hold_id) = reservation.payment_hold_id.as_deref() {
            let key = format!("release-{}", reservation.id);
            if let Err(e) = with_timeout(payment_timeout, gateway.release(hold_id, &key)).await {
                tracing::error!(
                    reservation_id = %reservation.id,
                    hold_id = %hold_id,
                    error = %e,
                    "Hold release failed during drop cancellation; needs reconciliation"
                );
            }
        }

        if let Err(e) = db.restore_stock(reservation.product_id).await {
            tracing::error!(reservation_id = %reservation.id, error = %e, "Stock restore failed");
        }

        notifier.notify(
            reservation.user_id,
            Kind::DropCancelled,
            json!({
                "drop_id": drop_id,
                "reservation_id": reservation.id,
                "refunded_hold": reservation.authorized_amount,
            }),
        );
    }

    tracing::info!(drop_id = %drop_id, "Drop cancellation refund pass finished");
}
