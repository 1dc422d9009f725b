// =============================================================================
// DATABASE MODULE
// =============================================================================
// All PostgreSQL access for the drop core.
//
// Concurrency primitives used here:
// - FOR UPDATE row locks serialize lifecycle transitions on one drop.
// - The ledger update is a compare-and-set: the UPDATE carries the
//   previously read current_value in its WHERE clause, so two racing
//   reservations can never both apply against the same stale read.
// - GREATEST() makes the discount a one-way ratchet at the schema level.
// - rows_affected checks turn every conditional update into an explicit
//   claimed/lost-the-race signal instead of a silent overwrite.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{
    CreateDropRequest, Drop, DropStatus, PaymentStatus, Product, Reservation, SettlementReport,
    SupplierList, UserProfile,
};

/// Projection of a reservation after the settlement pass, used to
/// rebuild the report from durable state (resume-safe).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SettledRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub original_price: Decimal,
    pub final_price: Option<Decimal>,
    pub payment_status: PaymentStatus,
    pub failure_reason: Option<String>,
}

/// Wrapper around the connection pool with typed methods for every
/// operation the domain modules need.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    /// Begin an explicit transaction (lifecycle transitions and return
    /// recording need multi-statement atomicity).
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Raw pool access for integration tests that seed fixtures.
    #[cfg(test)]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Create enum types and tables if they don't exist, then seed
    /// sample data. Idempotent: safe to run on every startup.
    pub async fn run_migrations(&self) -> Result<()> {
        // Postgres has no CREATE TYPE IF NOT EXISTS; swallow the
        // duplicate_object error instead
        for ddl in [
            r#"
            DO $$ BEGIN
                CREATE TYPE drop_status AS ENUM (
                    'pending_approval', 'approved', 'active', 'inactive',
                    'completed', 'expired', 'cancelled'
                );
            EXCEPTION WHEN duplicate_object THEN NULL; END $$
            "#,
            r#"
            DO $$ BEGIN
                CREATE TYPE payment_status AS ENUM (
                    'pending', 'authorized', 'captured', 'failed', 'refunded'
                );
            EXCEPTION WHEN duplicate_object THEN NULL; END $$
            "#,
            r#"
            DO $$ BEGIN
                CREATE TYPE reservation_status AS ENUM (
                    'active', 'confirmed', 'cancelled', 'completed'
                );
            EXCEPTION WHEN duplicate_object THEN NULL; END $$
            "#,
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("Failed to create enum type")?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS supplier_lists (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                name VARCHAR(255) NOT NULL,

                -- Discount band for drops built from this list
                min_discount NUMERIC(5,2) NOT NULL,
                max_discount NUMERIC(5,2) NOT NULL,

                CONSTRAINT valid_band CHECK (
                    min_discount >= 0 AND max_discount <= 100
                    AND min_discount <= max_discount
                )
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create supplier_lists table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS products (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                supplier_list_id UUID NOT NULL REFERENCES supplier_lists(id),
                name VARCHAR(255) NOT NULL,
                price NUMERIC(12,2) NOT NULL,
                stock INTEGER NOT NULL DEFAULT 0,

                CONSTRAINT positive_price CHECK (price > 0),
                CONSTRAINT non_negative_stock CHECK (stock >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create products table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS drops (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                name VARCHAR(255) NOT NULL,
                pickup_point_id UUID NOT NULL,
                supplier_list_id UUID NOT NULL REFERENCES supplier_lists(id),
                status drop_status NOT NULL DEFAULT 'pending_approval',

                current_discount NUMERIC(5,2) NOT NULL DEFAULT 0,
                current_value NUMERIC(12,2) NOT NULL DEFAULT 0,
                target_value NUMERIC(12,2) NOT NULL,
                min_discount NUMERIC(5,2) NOT NULL,
                max_discount NUMERIC(5,2) NOT NULL,

                start_time TIMESTAMPTZ,
                end_time TIMESTAMPTZ,

                -- One "ending soon" notification per drop
                ending_notified BOOLEAN NOT NULL DEFAULT FALSE,

                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                CONSTRAINT positive_target CHECK (target_value > 0),
                CONSTRAINT discount_within_band CHECK (
                    current_discount = 0
                    OR (current_discount >= min_discount AND current_discount <= max_discount)
                )
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create drops table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_drops_status_end_time
            ON drops(status, end_time)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create drops index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                id UUID PRIMARY KEY,
                rating SMALLINT NOT NULL DEFAULT 5,
                lifetime_returns_count INTEGER NOT NULL DEFAULT 0,
                suspended BOOLEAN NOT NULL DEFAULT FALSE,
                payment_method_ref VARCHAR(255),
                payment_method_expires_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                CONSTRAINT rating_in_range CHECK (rating >= 1 AND rating <= 5)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create profiles table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reservations (
                id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                user_id UUID NOT NULL REFERENCES profiles(id),
                product_id UUID NOT NULL REFERENCES products(id),
                drop_id UUID NOT NULL REFERENCES drops(id),

                original_price NUMERIC(12,2) NOT NULL,
                authorized_amount NUMERIC(12,2) NOT NULL,
                discount_percentage NUMERIC(5,2),
                final_price NUMERIC(12,2),

                payment_status payment_status NOT NULL DEFAULT 'pending',
                payment_hold_id VARCHAR(255),
                status reservation_status NOT NULL DEFAULT 'active',

                picked_up_at TIMESTAMPTZ,
                returned_at TIMESTAMPTZ,

                -- Processor detail when a capture failed, for the report
                failure_reason TEXT,

                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

                -- The capture can never exceed the hold
                CONSTRAINT capture_within_hold CHECK (
                    final_price IS NULL OR final_price <= authorized_amount
                )
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create reservations table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_reservations_drop_payment
            ON reservations(drop_id, payment_status)
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create reservations index")?;

        // One settlement per drop; the row doubles as the at-most-once
        // guard (inserted before the capture pass, report filled after)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlements (
                drop_id UUID PRIMARY KEY REFERENCES drops(id),
                discount_percentage NUMERIC(5,2) NOT NULL,
                started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ,
                report JSONB
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create settlements table")?;

        self.seed_sample_data().await?;

        Ok(())
    }

    /// Seed a supplier list, products and consumer profiles for local
    /// development. No-op once data exists.
    async fn seed_sample_data(&self) -> Result<()> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM supplier_lists")
            .fetch_one(&self.pool)
            .await?;
        if count.0 > 0 {
            return Ok(());
        }

        let list_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO supplier_lists (name, min_discount, max_discount)
            VALUES ('Riverside Farm Collective', 10.00, 30.00)
            RETURNING id
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let sample_products = vec![
            ("Veggie box, large", "89.50", 40),
            ("Veggie box, small", "49.00", 60),
            ("Raw honey 500g", "12.90", 120),
            ("Free-range eggs, 12", "6.40", 200),
            ("Sourdough loaf", "5.80", 80),
        ];
        for (name, price, stock) in sample_products {
            sqlx::query(
                r#"
                INSERT INTO products (supplier_list_id, name, price, stock)
                VALUES ($1, $2, $3::numeric, $4)
                "#,
            )
            .bind(list_id.0)
            .bind(name)
            .bind(price)
            .bind(stock)
            .execute(&self.pool)
            .await?;
        }

        for _ in 0..3 {
            sqlx::query(
                r#"
                INSERT INTO profiles (id, payment_method_ref, payment_method_expires_at)
                VALUES (gen_random_uuid(), 'pm_seed', NOW() + INTERVAL '2 years')
                "#,
            )
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // LOOKUPS
    // -------------------------------------------------------------------------

    pub async fn get_drop(&self, id: Uuid) -> Result<Option<Drop>, sqlx::Error> {
        sqlx::query_as::<_, Drop>(
            r#"
            SELECT id, name, pickup_point_id, supplier_list_id, status,
                   current_discount, current_value, target_value,
                   min_discount, max_discount, start_time, end_time,
                   created_at, updated_at
            FROM drops
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_drops(
        &self,
        page: i32,
        per_page: i32,
    ) -> Result<(Vec<Drop>, i64), sqlx::Error> {
        let offset = (page - 1) * per_page;

        let drops = sqlx::query_as::<_, Drop>(
            r#"
            SELECT id, name, pickup_point_id, supplier_list_id, status,
                   current_discount, current_value, target_value,
                   min_discount, max_discount, start_time, end_time,
                   created_at, updated_at
            FROM drops
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM drops")
            .fetch_one(&self.pool)
            .await?;

        Ok((drops, total.0))
    }

    pub async fn get_supplier_list(&self, id: Uuid) -> Result<Option<SupplierList>, sqlx::Error> {
        sqlx::query_as::<_, SupplierList>(
            "SELECT id, name, min_discount, max_discount FROM supplier_lists WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_product(&self, id: Uuid) -> Result<Option<Product>, sqlx::Error> {
        sqlx::query_as::<_, Product>(
            "SELECT id, supplier_list_id, name, price, stock FROM products WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>, sqlx::Error> {
        sqlx::query_as::<_, UserProfile>(
            r#"
            SELECT id, rating, lifetime_returns_count, suspended,
                   payment_method_ref, payment_method_expires_at, created_at
            FROM profiles
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_reservation(&self, id: Uuid) -> Result<Option<Reservation>, sqlx::Error> {
        sqlx::query_as::<_, Reservation>(
            r#"
            SELECT id, user_id, product_id, drop_id, original_price,
                   authorized_amount, discount_percentage, final_price,
                   payment_status, payment_hold_id, status,
                   picked_up_at, returned_at, created_at, updated_at
            FROM reservations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    // -------------------------------------------------------------------------
    // DROP LIFECYCLE
    // -------------------------------------------------------------------------

    pub async fn create_drop(
        &self,
        req: &CreateDropRequest,
        list: &SupplierList,
    ) -> Result<Drop, sqlx::Error> {
        sqlx::query_as::<_, Drop>(
            r#"
            INSERT INTO drops (name, pickup_point_id, supplier_list_id,
                               target_value, min_discount, max_discount)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, name, pickup_point_id, supplier_list_id, status,
                      current_discount, current_value, target_value,
                      min_discount, max_discount, start_time, end_time,
                      created_at, updated_at
            "#,
        )
        .bind(&req.name)
        .bind(req.pickup_point_id)
        .bind(req.supplier_list_id)
        .bind(req.target_value)
        .bind(list.min_discount)
        .bind(list.max_discount)
        .fetch_one(&self.pool)
        .await
    }

    /// Lock the drop row for the duration of a transition transaction.
    /// Concurrent transitions on the same drop serialize here.
    pub async fn lock_drop(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        id: Uuid,
    ) -> Result<Option<Drop>, sqlx::Error> {
        sqlx::query_as::<_, Drop>(
            r#"
            SELECT id, name, pickup_point_id, supplier_list_id, status,
                   current_discount, current_value, target_value,
                   min_discount, max_discount, start_time, end_time,
                   created_at, updated_at
            FROM drops
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
    }

    pub async fn set_drop_status(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        id: Uuid,
        status: DropStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE drops SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Entering `active`: stamp the window and initialize the discount
    /// to the bottom of the band.
    pub async fn activate_drop(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        id: Uuid,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE drops
            SET status = 'active',
                start_time = $1,
                end_time = $2,
                current_discount = min_discount,
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(start_time)
        .bind(end_time)
        .bind(id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // LEDGER (compare-and-set)
    // -------------------------------------------------------------------------

    /// Apply a reservation amount to the drop ledger.
    ///
    /// The WHERE clause carries the caller's previously read
    /// `current_value`: if another reservation got in between, zero rows
    /// match and the caller must re-read and retry. GREATEST keeps the
    /// discount ratchet one-way even if a racing writer computed a
    /// higher discount first. Returns true when the update applied.
    pub async fn apply_reservation_cas(
        &self,
        drop_id: Uuid,
        amount: Decimal,
        expected_value: Decimal,
        new_discount: Decimal,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE drops
            SET current_value = current_value + $1,
                current_discount = GREATEST(current_discount, $2),
                updated_at = NOW()
            WHERE id = $3
              AND status = 'active'
              AND current_value = $4
            "#,
        )
        .bind(amount)
        .bind(new_discount)
        .bind(drop_id)
        .bind(expected_value)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // -------------------------------------------------------------------------
    // PRODUCT STOCK
    // -------------------------------------------------------------------------

    /// Take one unit of stock; false means sold out.
    pub async fn try_decrement_stock(&self, product_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE products SET stock = stock - 1 WHERE id = $1 AND stock > 0",
        )
        .bind(product_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Give a unit back (compensation and user cancellation).
    pub async fn restore_stock(&self, product_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE products SET stock = stock + 1 WHERE id = $1")
            .bind(product_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // RESERVATIONS
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_reservation(
        &self,
        id: Uuid,
        user_id: Uuid,
        product_id: Uuid,
        drop_id: Uuid,
        original_price: Decimal,
        payment_hold_id: &str,
    ) -> Result<Reservation, sqlx::Error> {
        sqlx::query_as::<_, Reservation>(
            r#"
            INSERT INTO reservations (id, user_id, product_id, drop_id,
                                      original_price, authorized_amount,
                                      payment_status, payment_hold_id, status)
            VALUES ($1, $2, $3, $4, $5, $5, 'authorized', $6, 'active')
            RETURNING id, user_id, product_id, drop_id, original_price,
                      authorized_amount, discount_percentage, final_price,
                      payment_status, payment_hold_id, status,
                      picked_up_at, returned_at, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(product_id)
        .bind(drop_id)
        .bind(original_price)
        .bind(payment_hold_id)
        .fetch_one(&self.pool)
        .await
    }

    /// Claim a reservation for refund. Only an authorized reservation
    /// can be claimed, so a settlement that already moved it wins the
    /// race and this returns false.
    pub async fn claim_reservation_refund(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE reservations
            SET payment_status = 'refunded', status = 'cancelled', updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND payment_status = 'authorized'
            "#,
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Undo a refund claim when the hold release failed; the hold is
    /// still live at the processor, so the reservation must stay
    /// authorized and capturable.
    pub async fn revert_reservation_refund(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE reservations
            SET payment_status = 'authorized', status = 'active', updated_at = NOW()
            WHERE id = $1 AND payment_status = 'refunded'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reservations a settlement pass still has to handle: authorized
    /// rows, plus `pending` rows claimed by an earlier pass that died
    /// before marking an outcome (capture is idempotent, so redoing
    /// them is safe).
    pub async fn settlement_candidates(
        &self,
        drop_id: Uuid,
    ) -> Result<Vec<Reservation>, sqlx::Error> {
        sqlx::query_as::<_, Reservation>(
            r#"
            SELECT id, user_id, product_id, drop_id, original_price,
                   authorized_amount, discount_percentage, final_price,
                   payment_status, payment_hold_id, status,
                   picked_up_at, returned_at, created_at, updated_at
            FROM reservations
            WHERE drop_id = $1 AND payment_status IN ('authorized', 'pending')
            ORDER BY created_at ASC
            "#,
        )
        .bind(drop_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Claim a reservation for capture by moving it to `pending`. A
    /// claimed row can no longer be cancelled by the user, which closes
    /// the release-vs-capture race. `pending` also matches, so a resumed
    /// pass can re-claim its own rows.
    pub async fn claim_for_capture(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE reservations
            SET payment_status = 'pending', updated_at = NOW()
            WHERE id = $1 AND payment_status IN ('authorized', 'pending')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_reservation_captured(
        &self,
        id: Uuid,
        discount_percentage: Decimal,
        final_price: Decimal,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE reservations
            SET payment_status = 'captured', status = 'completed',
                discount_percentage = $1, final_price = $2, updated_at = NOW()
            WHERE id = $3 AND payment_status = 'pending'
            "#,
        )
        .bind(discount_percentage)
        .bind(final_price)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_reservation_capture_failed(
        &self,
        id: Uuid,
        discount_percentage: Decimal,
        failure_reason: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE reservations
            SET payment_status = 'failed', status = 'cancelled',
                discount_percentage = $1, failure_reason = $2, updated_at = NOW()
            WHERE id = $3 AND payment_status = 'pending'
            "#,
        )
        .bind(discount_percentage)
        .bind(failure_reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Post-pass view for the report: every reservation the settlement
    /// moved to a terminal payment state.
    pub async fn settled_reservations(
        &self,
        drop_id: Uuid,
    ) -> Result<Vec<SettledRow>, sqlx::Error> {
        sqlx::query_as::<_, SettledRow>(
            r#"
            SELECT id, user_id, original_price, final_price,
                   payment_status, failure_reason
            FROM reservations
            WHERE drop_id = $1 AND payment_status IN ('captured', 'failed')
            ORDER BY created_at ASC
            "#,
        )
        .bind(drop_id)
        .fetch_all(&self.pool)
        .await
    }

    // -------------------------------------------------------------------------
    // SETTLEMENT GUARD
    // -------------------------------------------------------------------------

    /// Insert the at-most-once guard row with the frozen discount.
    /// Returns false when a settlement for this drop already started.
    pub async fn try_begin_settlement(
        &self,
        drop_id: Uuid,
        discount_percentage: Decimal,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO settlements (drop_id, discount_percentage)
            VALUES ($1, $2)
            ON CONFLICT (drop_id) DO NOTHING
            "#,
        )
        .bind(drop_id)
        .bind(discount_percentage)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// The discount frozen when settlement began, if one began.
    pub async fn get_settlement_discount(
        &self,
        drop_id: Uuid,
    ) -> Result<Option<Decimal>, sqlx::Error> {
        let row: Option<(Decimal,)> = sqlx::query_as(
            "SELECT discount_percentage FROM settlements WHERE drop_id = $1",
        )
        .bind(drop_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    /// The stored report of a finished settlement. None while the
    /// capture pass is still (or was left) in progress.
    pub async fn get_settlement_report(
        &self,
        drop_id: Uuid,
    ) -> Result<Option<SettlementReport>, sqlx::Error> {
        let row: Option<(Option<serde_json::Value>,)> =
            sqlx::query_as("SELECT report FROM settlements WHERE drop_id = $1")
                .bind(drop_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .and_then(|r| r.0)
            .and_then(|json| serde_json::from_value(json).ok()))
    }

    /// Store the report and stamp the drop completed, atomically. The
    /// transition normally set the status already; re-asserting it here
    /// covers resumed passes that finish after a crash.
    pub async fn finalize_settlement(
        &self,
        drop_id: Uuid,
        report: &SettlementReport,
    ) -> Result<(), sqlx::Error> {
        let json = serde_json::to_value(report)
            .map_err(|e| sqlx::Error::Protocol(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE settlements
            SET report = $1, completed_at = NOW()
            WHERE drop_id = $2
            "#,
        )
        .bind(json)
        .bind(drop_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE drops SET status = 'completed', updated_at = NOW() WHERE id = $1",
        )
        .bind(drop_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }

    // -------------------------------------------------------------------------
    // SCHEDULER QUERIES
    // -------------------------------------------------------------------------

    /// Active drops whose window has closed.
    pub async fn due_active_drops(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Drop>, sqlx::Error> {
        sqlx::query_as::<_, Drop>(
            r#"
            SELECT id, name, pickup_point_id, supplier_list_id, status,
                   current_discount, current_value, target_value,
                   min_discount, max_discount, start_time, end_time,
                   created_at, updated_at
            FROM drops
            WHERE status = 'active' AND end_time <= $1
            ORDER BY end_time ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }

    /// Completed drops whose settlement never finalized (a close died
    /// between the status flip and the report). The scheduler resumes
    /// these; the per-reservation idempotency keys make that safe.
    pub async fn unsettled_completed_drops(&self) -> Result<Vec<Drop>, sqlx::Error> {
        sqlx::query_as::<_, Drop>(
            r#"
            SELECT d.id, d.name, d.pickup_point_id, d.supplier_list_id, d.status,
                   d.current_discount, d.current_value, d.target_value,
                   d.min_discount, d.max_discount, d.start_time, d.end_time,
                   d.created_at, d.updated_at
            FROM drops d
            LEFT JOIN settlements s ON s.drop_id = d.id
            WHERE d.status = 'completed'
              AND (s.drop_id IS NULL OR s.completed_at IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn has_authorized_reservations(&self, drop_id: Uuid) -> Result<bool, sqlx::Error> {
        let row: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM reservations
                WHERE drop_id = $1 AND payment_status = 'authorized'
            )
            "#,
        )
        .bind(drop_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Active drops entering their final hour that haven't been
    /// announced yet. The flag flip is part of the query, so each drop
    /// is picked up exactly once across ticks.
    pub async fn claim_ending_soon_drops(
        &self,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<Vec<Drop>, sqlx::Error> {
        sqlx::query_as::<_, Drop>(
            r#"
            UPDATE drops
            SET ending_notified = TRUE, updated_at = NOW()
            WHERE status = 'active'
              AND ending_notified = FALSE
              AND end_time > $1
              AND end_time <= $2
            RETURNING id, name, pickup_point_id, supplier_list_id, status,
                      current_discount, current_value, target_value,
                      min_discount, max_discount, start_time, end_time,
                      created_at, updated_at
            "#,
        )
        .bind(now)
        .bind(now + window)
        .fetch_all(&self.pool)
        .await
    }

    /// Users with an authorized reservation in the drop (notification
    /// fan-out for drop-level events).
    pub async fn users_with_authorized_reservations(
        &self,
        drop_id: Uuid,
    ) -> Result<Vec<Uuid>, sqlx::Error> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT user_id FROM reservations
            WHERE drop_id = $1 AND payment_status = 'authorized'
            "#,
        )
        .bind(drop_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    // -------------------------------------------------------------------------
    // RETURNS / REPUTATION
    // -------------------------------------------------------------------------

    /// Mark a reservation's item as returned. The WHERE clause is the
    /// no-double-count guard: only an item that was neither picked up
    /// nor already returned matches, so a repeated call returns None.
    pub async fn mark_reservation_returned(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        reservation_id: Uuid,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE reservations
            SET returned_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND picked_up_at IS NULL AND returned_at IS NULL
            RETURNING user_id
            "#,
        )
        .bind(reservation_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.map(|r| r.0))
    }

    /// Apply one return to a profile: rating steps down (floor 1),
    /// lifetime count steps up, and crossing the ceiling flips the
    /// suspension flag. One statement, so the counters cannot diverge.
    pub async fn apply_return_to_profile(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        user_id: Uuid,
        suspension_ceiling: i32,
    ) -> Result<UserProfile, sqlx::Error> {
        sqlx::query_as::<_, UserProfile>(
            r#"
            UPDATE profiles
            SET rating = GREATEST(rating - 1, 1),
                lifetime_returns_count = lifetime_returns_count + 1,
                suspended = suspended OR (lifetime_returns_count + 1 >= $1)
            WHERE id = $2
            RETURNING id, rating, lifetime_returns_count, suspended,
                      payment_method_ref, payment_method_expires_at, created_at
            "#,
        )
        .bind(suspension_ceiling)
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
    }

    // -------------------------------------------------------------------------
    // HEALTH CHECK
    // -------------------------------------------------------------------------

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}
