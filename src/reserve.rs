// =============================================================================
// RESERVE MODULE
// =============================================================================
// The reservation/authorization manager: turning "user wants product in
// drop" into a payment hold plus a ledger update plus a persisted
// reservation, or into nothing at all.
//
// Order of operations and compensations:
//   1. preconditions (pure, no side effects)
//   2. authorize hold for the FULL original price (discount unknown
//      until close)
//   3. take one unit of stock (on failure: release hold)
//   4. ledger compare-and-set, retried a bounded number of times
//      (on failure: restore stock, release hold)
//   5. persist the reservation
// No failure path leaves a partial reservation or a partial ledger
// update behind. The ledger itself is never compensated: the discount
// ratchet is one-way.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use crate::db::Database;
use crate::discount::discount_for;
use crate::error::{AppError, AppResult};
use crate::models::{Drop, DropStatus, PaymentStatus, Product, Reservation, UserProfile};
use crate::notify::{Kind, Notifier};
use crate::payment::{with_timeout, DeclineReason, GatewayError, PaymentGateway};

/// How many times the ledger compare-and-set is retried from a fresh
/// read before the whole reserve fails with a concurrency error.
const LEDGER_RETRY_LIMIT: u32 = 3;

// =============================================================================
// PRECONDITIONS
// =============================================================================
/// Pure precondition check; everything that can be rejected before
/// touching the payment processor.
pub fn check_preconditions(
    drop: &Drop,
    product: &Product,
    profile: &UserProfile,
    now: chrono::DateTime<chrono::Utc>,
) -> AppResult<()> {
    if profile.suspended {
        return Err(AppError::Suspension);
    }

    if drop.status != DropStatus::Active {
        return Err(AppError::State(format!(
            "drop {} is {}, not active",
            drop.id,
            drop.status.as_str()
        )));
    }

    if product.supplier_list_id != drop.supplier_list_id {
        return Err(AppError::Validation(format!(
            "product {} is not part of drop {}'s supplier list",
            product.id, drop.id
        )));
    }

    if product.stock <= 0 {
        return Err(AppError::OutOfStock(product.id));
    }

    match &profile.payment_method_ref {
        None => {
            return Err(AppError::Validation(
                "no default payment method on file".to_string(),
            ))
        }
        Some(_) if !profile.has_usable_payment_method(now) => {
            // Rejected locally; no point asking the processor
            return Err(AppError::PaymentDeclined(DeclineReason::ExpiredCard));
        }
        Some(_) => {}
    }

    Ok(())
}

fn map_authorize_error(err: GatewayError) -> AppError {
    match err {
        GatewayError::Declined(reason) => AppError::PaymentDeclined(reason),
        // Timeouts and transport failures are failures of this
        // authorization, surfaced as a processing error
        GatewayError::Timeout | GatewayError::Unavailable(_) => {
            AppError::PaymentDeclined(DeclineReason::ProcessingError)
        }
    }
}

// =============================================================================
// RESERVE
// =============================================================================
/// Create a reservation: hold the full original price, apply the amount
/// to the drop ledger, persist. All-or-nothing.
pub async fn reserve(
    db: &Database,
    gateway: &Arc<dyn PaymentGateway>,
    notifier: &Notifier,
    payment_timeout: Duration,
    user_id: Uuid,
    product_id: Uuid,
    drop_id: Uuid,
) -> AppResult<Reservation> {
    let now = Utc::now();

    let drop = db
        .get_drop(drop_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("drop {}", drop_id)))?;
    let product = db
        .get_product(product_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("product {}", product_id)))?;
    let profile = db
        .get_profile(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))?;

    check_preconditions(&drop, &product, &profile, now)?;

    let original_price = product.price;
    let payment_method = profile
        .payment_method_ref
        .as_deref()
        .ok_or_else(|| AppError::Internal("payment method vanished after precondition check".into()))?;

    // The reservation id doubles as the idempotency key root, so a
    // client retry of this exact reservation cannot double-hold
    let reservation_id = Uuid::new_v4();
    let auth_key = format!("auth-{}", reservation_id);

    tracing::info!(
        user_id = %user_id,
        drop_id = %drop_id,
        product_id = %product_id,
        amount = %original_price,
        "Authorizing payment hold"
    );

    let hold_id = with_timeout(
        payment_timeout,
        gateway.authorize(original_price, payment_method, &auth_key),
    )
    .await
    .map_err(map_authorize_error)?;

    // From here on every failure must release the hold
    if !db.try_decrement_stock(product_id).await? {
        release_best_effort(gateway, payment_timeout, &hold_id, &reservation_id).await;
        return Err(AppError::OutOfStock(product_id));
    }

    let applied = apply_to_ledger(db, &drop, original_price).await;
    let (new_discount, discount_moved) = match applied {
        Ok(result) => result,
        Err(e) => {
            // Both compensations are best-effort: neither can early-
            // return past the other, so the hold is always addressed
            release_best_effort(gateway, payment_timeout, &hold_id, &reservation_id).await;
            restore_stock_best_effort(db, product_id).await;
            return Err(e);
        }
    };

    let reservation = match db
        .insert_reservation(
            reservation_id,
            user_id,
            product_id,
            drop_id,
            original_price,
            &hold_id,
        )
        .await
    {
        Ok(r) => r,
        Err(e) => {
            // The ledger value stays (one-way by design); stock and the
            // hold are compensated, and the orphaned amount is flagged
            // for reconciliation
            tracing::error!(
                drop_id = %drop_id,
                amount = %original_price,
                error = %e,
                "Reservation insert failed after ledger update; amount orphaned in ledger"
            );
            release_best_effort(gateway, payment_timeout, &hold_id, &reservation_id).await;
            restore_stock_best_effort(db, product_id).await;
            return Err(e.into());
        }
    };

    crate::metrics::record_reservation(drop_id, "authorized");

    if discount_moved {
        crate::metrics::set_drop_discount(drop_id, new_discount);
        fan_out_discount_increase(db, notifier, drop_id, new_discount).await;
    }

    tracing::info!(
        reservation_id = %reservation.id,
        hold_id = %hold_id,
        new_discount = %new_discount,
        "Reservation authorized"
    );

    Ok(reservation)
}

/// Read-compute-CAS loop against the drop ledger. Returns the discount
/// after this reservation and whether it moved.
async fn apply_to_ledger(
    db: &Database,
    initial: &Drop,
    amount: Decimal,
) -> AppResult<(Decimal, bool)> {
    if amount <= Decimal::ZERO {
        return Err(AppError::Validation("reservation amount must be positive".into()));
    }

    let mut drop = initial.clone();
    for attempt in 0..LEDGER_RETRY_LIMIT {
        if drop.status != DropStatus::Active {
            return Err(AppError::State(format!(
                "drop {} closed while reserving",
                drop.id
            )));
        }

        let new_value = drop.current_value + amount;
        let new_discount = discount_for(
            new_value,
            drop.target_value,
            drop.min_discount,
            drop.max_discount,
        );

        if db
            .apply_reservation_cas(drop.id, amount, drop.current_value, new_discount)
            .await?
        {
            // The ratchet means the effective discount is at least what
            // we computed; a racing writer can only have pushed it up
            let moved = new_discount > drop.current_discount;
            return Ok((new_discount.max(drop.current_discount), moved));
        }

        tracing::debug!(
            drop_id = %drop.id,
            attempt = attempt + 1,
            "Ledger CAS lost the race; re-reading"
        );

        drop = db
            .get_drop(drop.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("drop {}", drop.id)))?;
    }

    Err(AppError::Concurrency)
}

/// Compensating stock restore. Like the hold release, a failure here is
/// logged for reconciliation instead of masking the error (or success)
/// the caller is about to report.
async fn restore_stock_best_effort(db: &Database, product_id: Uuid) {
    if let Err(e) = db.restore_stock(product_id).await {
        tracing::error!(
            product_id = %product_id,
            error = %e,
            "Compensating stock restore failed; needs reconciliation"
        );
    }
}

/// Compensating release of a hold. Failures are logged for
/// reconciliation, not propagated: the user-facing error is whatever
/// caused the compensation in the first place.
async fn release_best_effort(
    gateway: &Arc<dyn PaymentGateway>,
    payment_timeout: Duration,
    hold_id: &str,
    reservation_id: &Uuid,
) {
    let key = format!("release-{}", reservation_id);
    if let Err(e) = with_timeout(payment_timeout, gateway.release(hold_id, &key)).await {
        tracing::error!(
            hold_id = %hold_id,
            error = %e,
            "Compensating hold release failed; needs reconciliation"
        );
    }
}

/// Everyone with a live reservation in the drop hears about a discount
/// increase, not just the reserver who caused it.
async fn fan_out_discount_increase(
    db: &Database,
    notifier: &Notifier,
    drop_id: Uuid,
    new_discount: Decimal,
) {
    match db.users_with_authorized_reservations(drop_id).await {
        Ok(user_ids) => {
            for uid in user_ids {
                notifier.notify(
                    uid,
                    Kind::DiscountIncreased,
                    json!({ "drop_id": drop_id, "discount": new_discount }),
                );
            }
        }
        Err(e) => {
            tracing::warn!(drop_id = %drop_id, error = %e, "Discount fan-out query failed");
        }
    }
}

// =============================================================================
// CANCEL
// =============================================================================
/// User-initiated cancellation of their own reservation. Legal only
/// while the payment is still a hold and the drop hasn't completed.
/// Releases the hold and returns the unit to stock; the drop's
/// accumulated value and discount are left untouched.
pub async fn cancel_reservation(
    db: &Database,
    gateway: &Arc<dyn PaymentGateway>,
    notifier: &Notifier,
    payment_timeout: Duration,
    reservation_id: Uuid,
    user_id: Uuid,
) -> AppResult<Reservation> {
    let reservation = db
        .get_reservation(reservation_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("reservation {}", reservation_id)))?;

    if reservation.user_id != user_id {
        return Err(AppError::State(
            "reservation belongs to a different user".to_string(),
        ));
    }

    if reservation.payment_status != PaymentStatus::Authorized {
        return Err(AppError::State(format!(
            "only authorized reservations can be cancelled (payment is {:?})",
            reservation.payment_status
        )));
    }

    let drop = db
        .get_drop(reservation.drop_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("drop {}", reservation.drop_id)))?;
    if drop.status == DropStatus::Completed {
        return Err(AppError::State(
            "drop already completed; reservation was settled".to_string(),
        ));
    }

    // Claim first: once the row says refunded, settlement can no longer
    // pick it up, so releasing the hold afterwards cannot race a capture
    if !db.claim_reservation_refund(reservation_id, user_id).await? {
        return Err(AppError::State(
            "reservation is no longer cancellable".to_string(),
        ));
    }

    let hold_id = reservation
        .payment_hold_id
        .clone()
        .ok_or_else(|| AppError::Internal("authorized reservation without hold id".into()))?;

    let key = format!("release-{}", reservation_id);
    if let Err(e) = with_timeout(payment_timeout, gateway.release(&hold_id, &key)).await {
        // The hold is still live at the processor; put the reservation
        // back so settlement can still capture it
        db.revert_reservation_refund(reservation_id).await?;
        return Err(AppError::PaymentUnavailable(e.to_string()));
    }

    // The cancellation itself succeeded (hold released, row refunded);
    // a failed stock restore must not turn that into a 500
    restore_stock_best_effort(db, reservation.product_id).await;

    crate::metrics::record_reservation(reservation.drop_id, "refunded");

    notifier.notify(
        user_id,
        Kind::ReservationRefunded,
        json!({
            "reservation_id": reservation_id,
            "drop_id": reservation.drop_id,
            "amount": reservation.authorized_amount,
        }),
    );

    tracing::info!(
        reservation_id = %reservation_id,
        user_id = %user_id,
        "Reservation cancelled, hold released"
    );

    db.get_reservation(reservation_id)
        .await?
        .ok_or_else(|| AppError::Internal("reservation vanished after cancel".into()))
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RATING_MAX;
    use crate::payment::testing::MockGateway;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    fn test_drop(status: DropStatus) -> Drop {
        let now = Utc::now();
        Drop {
            id: Uuid::new_v4(),
            name: "Test drop".into(),
            pickup_point_id: Uuid::new_v4(),
            supplier_list_id: Uuid::new_v4(),
            status,
            current_discount: dec!(10),
            current_value: dec!(0),
            target_value: dec!(1000),
            min_discount: dec!(10),
            max_discount: dec!(30),
            start_time: Some(now),
            end_time: Some(now + ChronoDuration::days(5)),
            created_at: now,
            updated_at: now,
        }
    }

    fn test_product(drop: &Drop, stock: i32) -> Product {
        Product {
            id: Uuid::new_v4(),
            supplier_list_id: drop.supplier_list_id,
            name: "Veggie box".into(),
            price: dec!(49.00),
            stock,
        }
    }

    fn test_profile() -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            rating: RATING_MAX,
            lifetime_returns_count: 0,
            suspended: false,
            payment_method_ref: Some("pm_ok".into()),
            payment_method_expires_at: Some(Utc::now() + ChronoDuration::days(365)),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn preconditions_pass_for_a_healthy_request() {
        let drop = test_drop(DropStatus::Active);
        let product = test_product(&drop, 5);
        let profile = test_profile();
        assert!(check_preconditions(&drop, &product, &profile, Utc::now()).is_ok());
    }

    #[test]
    fn suspended_user_cannot_reserve() {
        let drop = test_drop(DropStatus::Active);
        let product = test_product(&drop, 5);
        let mut profile = test_profile();
        profile.suspended = true;

        let err = check_preconditions(&drop, &product, &profile, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::Suspension));
    }

    #[test]
    fn reserve_requires_an_active_drop() {
        for status in [
            DropStatus::PendingApproval,
            DropStatus::Approved,
            DropStatus::Inactive,
            DropStatus::Completed,
            DropStatus::Expired,
            DropStatus::Cancelled,
        ] {
            let drop = test_drop(status);
            let product = test_product(&drop, 5);
            let profile = test_profile();
            let err = check_preconditions(&drop, &product, &profile, Utc::now()).unwrap_err();
            assert!(matches!(err, AppError::State(_)), "status {:?}", status);
        }
    }

    #[test]
    fn sold_out_product_is_rejected() {
        let drop = test_drop(DropStatus::Active);
        let product = test_product(&drop, 0);
        let profile = test_profile();

        let err = check_preconditions(&drop, &product, &profile, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::OutOfStock(_)));
    }

    #[test]
    fn expired_card_is_declined_without_a_gateway_call() {
        let drop = test_drop(DropStatus::Active);
        let product = test_product(&drop, 5);
        let mut profile = test_profile();
        profile.payment_method_expires_at = Some(Utc::now() - ChronoDuration::days(1));

        let err = check_preconditions(&drop, &product, &profile, Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            AppError::PaymentDeclined(DeclineReason::ExpiredCard)
        ));
    }

    #[test]
    fn missing_payment_method_is_a_validation_error() {
        let drop = test_drop(DropStatus::Active);
        let product = test_product(&drop, 5);
        let mut profile = test_profile();
        profile.payment_method_ref = None;

        let err = check_preconditions(&drop, &product, &profile, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn product_from_another_supplier_list_is_rejected() {
        let drop = test_drop(DropStatus::Active);
        let mut product = test_product(&drop, 5);
        product.supplier_list_id = Uuid::new_v4();
        let profile = test_profile();

        let err = check_preconditions(&drop, &product, &profile, Utc::now()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn decline_timeouts_map_to_processing_error() {
        assert!(matches!(
            map_authorize_error(GatewayError::Timeout),
            AppError::PaymentDeclined(DeclineReason::ProcessingError)
        ));
        assert!(matches!(
            map_authorize_error(GatewayError::Declined(DeclineReason::InsufficientFunds)),
            AppError::PaymentDeclined(DeclineReason::InsufficientFunds)
        ));
    }

    #[tokio::test]
    async fn compensating_release_swallows_gateway_failures() {
        // The compensation path must be infallible: a gateway timeout
        // during release is logged, never propagated, so no later
        // compensation step can be skipped by an early return
        let mock = Arc::new(MockGateway::new());
        mock.set_delay(Duration::from_millis(200));
        let gw: Arc<dyn PaymentGateway> = mock.clone();

        release_best_effort(&gw, Duration::from_millis(10), "hold-x", &Uuid::new_v4()).await;

        assert_eq!(mock.release_calls.load(Ordering::SeqCst), 1);
    }

    // -------------------------------------------------------------------------
    // INTEGRATION (run with --ignored against a live database)
    // -------------------------------------------------------------------------

    async fn test_database() -> Database {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    async fn seed_active_drop(db: &Database) -> Uuid {
        let pool = db.pool();
        let (list_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO supplier_lists (name, min_discount, max_discount)
            VALUES ('Race test list', 10, 30)
            RETURNING id
            "#,
        )
        .fetch_one(pool)
        .await
        .expect("seed list");

        let (drop_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO drops (name, pickup_point_id, supplier_list_id, status,
                               current_discount, current_value, target_value,
                               min_discount, max_discount, start_time, end_time)
            VALUES ('Race test drop', gen_random_uuid(), $1, 'active',
                    10, 0, 1000, 10, 30, NOW(), NOW() + INTERVAL '1 day')
            RETURNING id
            "#,
        )
        .bind(list_id)
        .fetch_one(pool)
        .await
        .expect("seed drop");

        drop_id
    }

    #[tokio::test]
    #[ignore = "needs a running Postgres (DATABASE_URL)"]
    async fn ledger_retry_recovers_from_a_lost_race() {
        let db = test_database().await;
        let drop_id = seed_active_drop(&db).await;

        // Snapshot the drop, then let a racing writer win the first CAS
        let stale = db.get_drop(drop_id).await.unwrap().unwrap();
        assert!(db
            .apply_reservation_cas(drop_id, dec!(400), dec!(0), dec!(18))
            .await
            .unwrap());

        // The stale snapshot loses its CAS, re-reads, and lands the
        // amount on top of the racing writer's
        let (discount, moved) = apply_to_ledger(&db, &stale, dec!(600)).await.unwrap();
        assert_eq!(discount, dec!(30.00));
        assert!(moved);

        let fresh = db.get_drop(drop_id).await.unwrap().unwrap();
        assert_eq!(fresh.current_value, dec!(1000.00));
        assert_eq!(fresh.current_discount, dec!(30.00));
    }
}
