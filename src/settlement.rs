// =============================================================================
// SETTLEMENT MODULE
// =============================================================================
// The settlement engine: at drop close, capture every live hold at the
// discount frozen when settlement begins.
//
// At-most-once protocol:
// - A guard row in `settlements` (unique per drop) freezes the discount
//   the first time settle runs; a later call finds the stored report
//   and returns it without touching the processor.
// - Each reservation is claimed (`authorized` -> `pending`) before its
//   capture, which locks out user cancellation, and marked
//   (`captured`/`failed`) after. A pass that dies mid-way leaves
//   `pending` rows; the resumed pass re-claims them, and the capture
//   idempotency key (the reservation id) makes the redo safe at the
//   processor.
// - One reservation's failure never blocks the rest: failures become
//   reconciliation entries in the report, not errors.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use crate::db::{Database, SettledRow};
use crate::discount::final_price;
use crate::error::{AppError, AppResult};
use crate::models::{CaptureOutcome, PaymentStatus, Reservation, SettlementReport};
use crate::notify::{Kind, Notifier};
use crate::payment::{with_timeout, PaymentGateway};

/// Settle a drop. Invoked by the close transition (admin or scheduler)
/// and by the scheduler's crash-recovery sweep; all paths are
/// idempotent.
pub async fn settle(
    db: &Database,
    gateway: &Arc<dyn PaymentGateway>,
    notifier: &Notifier,
    payment_timeout: Duration,
    drop_id: Uuid,
    current_discount: Decimal,
) -> AppResult<SettlementReport> {
    let started = Instant::now();

    // Freeze the discount, or discover a previous settlement
    let discount = if db.try_begin_settlement(drop_id, current_discount).await? {
        current_discount
    } else {
        if let Some(report) = db.get_settlement_report(drop_id).await? {
            tracing::info!(drop_id = %drop_id, "Settlement already finished; returning stored report");
            return Ok(report);
        }
        // An earlier pass started but never finalized; resume under the
        // discount it froze, not today's
        db.get_settlement_discount(drop_id).await?.ok_or_else(|| {
            AppError::Internal(format!("settlement guard missing for drop {}", drop_id))
        })?
    };

    tracing::info!(
        drop_id = %drop_id,
        discount = %discount,
        "Starting settlement capture pass"
    );

    let candidates = db.settlement_candidates(drop_id).await?;
    for reservation in candidates {
        // Claiming moves the row out of the user-cancellable state
        if !db.claim_for_capture(reservation.id).await? {
            continue;
        }

        let outcome = capture_one(gateway, payment_timeout, &reservation, discount).await;

        if outcome.captured {
            db.mark_reservation_captured(reservation.id, discount, outcome.final_price)
                .await?;
            crate::metrics::record_capture(drop_id, true);
            notifier.notify(
                reservation.user_id,
                Kind::CaptureSucceeded,
                json!({
                    "reservation_id": reservation.id,
                    "drop_id": drop_id,
                    "final_price": outcome.final_price,
                    "discount": discount,
                }),
            );
        } else {
            let reason = outcome
                .failure_reason
                .clone()
                .unwrap_or_else(|| "capture failed".to_string());
            db.mark_reservation_capture_failed(reservation.id, discount, &reason)
                .await?;
            crate::metrics::record_capture(drop_id, false);
            tracing::warn!(
                reservation_id = %reservation.id,
                drop_id = %drop_id,
                reason = %reason,
                "Capture failed; recorded for reconciliation"
            );
            notifier.notify(
                reservation.user_id,
                Kind::CaptureFailed,
                json!({
                    "reservation_id": reservation.id,
                    "drop_id": drop_id,
                }),
            );
        }
    }

    // Rebuild the report from durable state so a resumed pass still
    // reports the reservations an earlier pass already handled
    let rows = db.settled_reservations(drop_id).await?;
    let report = build_report(drop_id, discount, &rows);

    db.finalize_settlement(drop_id, &report).await?;

    crate::metrics::record_settlement_duration(started.elapsed().as_secs_f64());
    tracing::info!(
        drop_id = %drop_id,
        captured = report.captured_count,
        failed = report.failed_count,
        total = %report.total_captured,
        "Settlement finished"
    );

    Ok(report)
}

/// Capture a single reservation at the frozen discount. Timeouts and
/// transport errors are failures; the capture amount can never exceed
/// the authorized hold because the discount lies in [0, 100].
pub async fn capture_one(
    gateway: &Arc<dyn PaymentGateway>,
    payment_timeout: Duration,
    reservation: &Reservation,
    discount: Decimal,
) -> CaptureOutcome {
    let price = final_price(reservation.original_price, discount);
    debug_assert!(price <= reservation.authorized_amount);

    let hold_id = match reservation.payment_hold_id.as_deref() {
        Some(h) => h,
        None => {
            return CaptureOutcome {
                reservation_id: reservation.id,
                user_id: reservation.user_id,
                final_price: price,
                captured: false,
                failure_reason: Some("reservation has no payment hold".to_string()),
            }
        }
    };

    let key = format!("capture-{}", reservation.id);
    let result = with_timeout(
        payment_timeout,
        gateway.capture(hold_id, price, &key),
    )
    .await;

    match result {
        Ok(()) => CaptureOutcome {
            reservation_id: reservation.id,
            user_id: reservation.user_id,
            final_price: price,
            captured: true,
            failure_reason: None,
        },
        Err(e) => CaptureOutcome {
            reservation_id: reservation.id,
            user_id: reservation.user_id,
            final_price: price,
            captured: false,
            failure_reason: Some(e.to_string()),
        },
    }
}

/// Aggregate per-reservation rows into the report.
pub fn build_report(drop_id: Uuid, discount: Decimal, rows: &[SettledRow]) -> SettlementReport {
    let outcomes: Vec<CaptureOutcome> = rows
        .iter()
        .map(|row| {
            let captured = row.payment_status == PaymentStatus::Captured;
            CaptureOutcome {
                reservation_id: row.id,
                user_id: row.user_id,
                final_price: row
                    .final_price
                    .unwrap_or_else(|| final_price(row.original_price, discount)),
                captured,
                failure_reason: row.failure_reason.clone(),
            }
        })
        .collect();

    let captured_count = outcomes.iter().filter(|o| o.captured).count();
    let failed_count = outcomes.len() - captured_count;
    let total_captured = outcomes
        .iter()
        .filter(|o| o.captured)
        .map(|o| o.final_price)
        .sum();

    SettlementReport {
        drop_id,
        discount_percentage: discount,
        settled_at: Utc::now(),
        outcomes,
        total_captured,
        captured_count,
        failed_count,
    }
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReservationStatus;
    use crate::payment::testing::MockGateway;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    fn reservation(price: Decimal, hold: &str) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            drop_id: Uuid::new_v4(),
            original_price: price,
            authorized_amount: price,
            discount_percentage: None,
            final_price: None,
            payment_status: PaymentStatus::Authorized,
            payment_hold_id: Some(hold.to_string()),
            status: ReservationStatus::Active,
            picked_up_at: None,
            returned_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn gateway() -> Arc<dyn PaymentGateway> {
        Arc::new(MockGateway::new())
    }

    #[tokio::test]
    async fn captures_at_the_frozen_discount() {
        let gw = gateway();
        let r = reservation(dec!(400), "hold-a");

        let outcome = capture_one(&gw, Duration::from_secs(1), &r, dec!(30)).await;

        assert!(outcome.captured);
        assert_eq!(outcome.final_price, dec!(280.00));
        assert!(outcome.final_price <= r.authorized_amount);
    }

    #[tokio::test]
    async fn one_failed_capture_does_not_block_the_rest() {
        let mock = MockGateway::new();
        mock.fail_capture_for("hold-bad");
        let gw: Arc<dyn PaymentGateway> = Arc::new(mock);

        let good_a = reservation(dec!(400), "hold-a");
        let bad = reservation(dec!(100), "hold-bad");
        let good_b = reservation(dec!(600), "hold-b");

        let mut outcomes = Vec::new();
        for r in [&good_a, &bad, &good_b] {
            outcomes.push(capture_one(&gw, Duration::from_secs(1), r, dec!(30)).await);
        }

        assert!(outcomes[0].captured);
        assert!(!outcomes[1].captured);
        assert!(outcomes[1].failure_reason.is_some());
        assert!(outcomes[2].captured);
    }

    #[tokio::test]
    async fn capture_timeout_is_a_failure_not_a_success() {
        let mock = MockGateway::new();
        mock.set_delay(Duration::from_millis(200));
        let gw: Arc<dyn PaymentGateway> = Arc::new(mock);

        let r = reservation(dec!(100), "hold-slow");
        let outcome = capture_one(&gw, Duration::from_millis(20), &r, dec!(10)).await;

        assert!(!outcome.captured);
        assert_eq!(outcome.failure_reason.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn missing_hold_fails_without_calling_the_processor() {
        let mock = Arc::new(MockGateway::new());
        let gw: Arc<dyn PaymentGateway> = mock.clone();

        let mut r = reservation(dec!(100), "unused");
        r.payment_hold_id = None;

        let outcome = capture_one(&gw, Duration::from_secs(1), &r, dec!(10)).await;
        assert!(!outcome.captured);
        assert_eq!(mock.capture_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn report_totals_follow_the_reference_scenario() {
        // target 1000, band 10-30%: 400 + 600 filled the drop to 30%
        let drop_id = Uuid::new_v4();
        let rows = vec![
            SettledRow {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                original_price: dec!(400),
                final_price: Some(dec!(280.00)),
                payment_status: PaymentStatus::Captured,
                failure_reason: None,
            },
            SettledRow {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                original_price: dec!(600),
                final_price: Some(dec!(420.00)),
                payment_status: PaymentStatus::Captured,
                failure_reason: None,
            },
        ];

        let report = build_report(drop_id, dec!(30), &rows);

        assert_eq!(report.captured_count, 2);
        assert_eq!(report.failed_count, 0);
        assert_eq!(report.total_captured, dec!(700.00));
        assert_eq!(report.discount_percentage, dec!(30));
    }

    #[test]
    fn failed_rows_appear_as_reconciliation_entries() {
        let rows = vec![
            SettledRow {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                original_price: dec!(100),
                final_price: Some(dec!(82.00)),
                payment_status: PaymentStatus::Captured,
                failure_reason: None,
            },
            SettledRow {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                original_price: dec!(50),
                final_price: None,
                payment_status: PaymentStatus::Failed,
                failure_reason: Some("unavailable: capture rejected by processor".to_string()),
            },
        ];

        let report = build_report(Uuid::new_v4(), dec!(18), &rows);

        assert_eq!(report.captured_count, 1);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.total_captured, dec!(82.00));
        // The failed entry still shows what would have been charged
        assert_eq!(report.outcomes[1].final_price, dec!(41.00));
        assert!(report.outcomes[1].failure_reason.is_some());
    }

    // -------------------------------------------------------------------------
    // INTEGRATION (run with --ignored against live Postgres + Redis)
    // -------------------------------------------------------------------------

    async fn test_backends() -> (Database, Notifier) {
        let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");

        let db = Database::connect(&db_url).await.expect("connect");
        db.run_migrations().await.expect("migrations");

        let client = redis::Client::open(redis_url.as_str()).expect("redis client");
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .expect("redis connect");

        (db, Notifier::new(conn))
    }

    /// Seed a filled, active drop with one product and one profile;
    /// returns (drop_id, product_id, user_id).
    async fn seed_settleable_drop(db: &Database) -> (Uuid, Uuid, Uuid) {
        let pool = db.pool();

        let (list_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO supplier_lists (name, min_discount, max_discount)
            VALUES ('Settlement test list', 10, 30)
            RETURNING id
            "#,
        )
        .fetch_one(pool)
        .await
        .expect("seed list");

        let (product_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO products (supplier_list_id, name, price, stock)
            VALUES ($1, 'Settlement test box', 400, 10)
            RETURNING id
            "#,
        )
        .bind(list_id)
        .fetch_one(pool)
        .await
        .expect("seed product");

        let (user_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO profiles (id, payment_method_ref, payment_method_expires_at)
            VALUES (gen_random_uuid(), 'pm_settle_test', NOW() + INTERVAL '1 year')
            RETURNING id
            "#,
        )
        .fetch_one(pool)
        .await
        .expect("seed profile");

        let (drop_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO drops (name, pickup_point_id, supplier_list_id, status,
                               current_discount, current_value, target_value,
                               min_discount, max_discount, start_time, end_time)
            VALUES ('Settlement test drop', gen_random_uuid(), $1, 'active',
                    30, 1000, 1000, 10, 30, NOW(), NOW() + INTERVAL '1 day')
            RETURNING id
            "#,
        )
        .bind(list_id)
        .fetch_one(pool)
        .await
        .expect("seed drop");

        (drop_id, product_id, user_id)
    }

    #[tokio::test]
    #[ignore = "needs Postgres (DATABASE_URL) and Redis (REDIS_URL)"]
    async fn resettling_a_drop_issues_no_second_capture() {
        let (db, notifier) = test_backends().await;
        let (drop_id, product_id, user_id) = seed_settleable_drop(&db).await;

        db.insert_reservation(Uuid::new_v4(), user_id, product_id, drop_id, dec!(400), "hold-once")
            .await
            .expect("insert reservation");

        let mock = Arc::new(MockGateway::new());
        let gw: Arc<dyn PaymentGateway> = mock.clone();

        let first = settle(&db, &gw, &notifier, Duration::from_secs(1), drop_id, dec!(30))
            .await
            .expect("first settlement");
        assert_eq!(first.captured_count, 1);
        assert_eq!(mock.capture_calls.load(Ordering::SeqCst), 1);

        // Re-entry finds the stored report and never reaches the processor
        let second = settle(&db, &gw, &notifier, Duration::from_secs(1), drop_id, dec!(30))
            .await
            .expect("second settlement");
        assert_eq!(mock.capture_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.captured_count, 1);
        assert_eq!(second.total_captured, first.total_captured);
    }

    #[tokio::test]
    #[ignore = "needs Postgres (DATABASE_URL) and Redis (REDIS_URL)"]
    async fn refunded_reservations_are_excluded_from_settlement() {
        let (db, notifier) = test_backends().await;
        let (drop_id, product_id, user_id) = seed_settleable_drop(&db).await;

        let kept = db
            .insert_reservation(Uuid::new_v4(), user_id, product_id, drop_id, dec!(400), "hold-kept")
            .await
            .expect("insert kept reservation");
        let refunded = db
            .insert_reservation(Uuid::new_v4(), user_id, product_id, drop_id, dec!(600), "hold-gone")
            .await
            .expect("insert refunded reservation");
        assert!(db
            .claim_reservation_refund(refunded.id, user_id)
            .await
            .expect("refund claim"));

        let candidates = db.settlement_candidates(drop_id).await.expect("candidates");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, kept.id);

        let mock = Arc::new(MockGateway::new());
        let gw: Arc<dyn PaymentGateway> = mock.clone();

        let report = settle(&db, &gw, &notifier, Duration::from_secs(1), drop_id, dec!(30))
            .await
            .expect("settlement");

        assert_eq!(mock.capture_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.captured_count, 1);
        assert_eq!(report.total_captured, dec!(280.00));
        assert!(report.outcomes.iter().all(|o| o.reservation_id != refunded.id));
    }
}
