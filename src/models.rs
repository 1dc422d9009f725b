// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures for the drop pricing and payment-authorization core:
// drops, reservations, user reputation profiles, and the API DTOs.
//
// Database records derive FromRow; status fields are real Postgres enums
// (created in db::run_migrations) so illegal states are unrepresentable
// both in Rust and in the schema.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// =============================================================================
// STATUS ENUMS
// =============================================================================

/// Lifecycle status of a drop.
///
/// `Inactive` is a paused sub-state: reachable only from `Active` and
/// returning only to `Active`. `Completed`, `Expired` and `Cancelled`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "drop_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DropStatus {
    PendingApproval,
    Approved,
    Active,
    Inactive,
    Completed,
    Expired,
    Cancelled,
}

impl DropStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DropStatus::Completed | DropStatus::Expired | DropStatus::Cancelled
        )
    }

    /// Stable string form, matching the Postgres enum labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            DropStatus::PendingApproval => "pending_approval",
            DropStatus::Approved => "approved",
            DropStatus::Active => "active",
            DropStatus::Inactive => "inactive",
            DropStatus::Completed => "completed",
            DropStatus::Expired => "expired",
            DropStatus::Cancelled => "cancelled",
        }
    }
}

/// Payment leg of a reservation (two-phase: authorize, then capture).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Authorized,
    Captured,
    Failed,
    Refunded,
}

/// Business status of a reservation, mirroring the payment outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "reservation_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Confirmed,
    Cancelled,
    Completed,
}

// =============================================================================
// DROP
// =============================================================================
/// A time-boxed group-buy event: products from one supplier list sold at
/// a discount that escalates with the accumulated committed value.
///
/// `current_discount` is a deterministic, non-decreasing function of
/// `current_value` while the drop is active (the discount ratchet), and
/// always lies within `[min_discount, max_discount]`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Drop {
    pub id: Uuid,

    /// Display name, e.g. "Week 34 veggie box drop"
    pub name: String,

    /// Pickup point where reserved items are collected
    pub pickup_point_id: Uuid,

    /// Supplier list this drop sells from
    pub supplier_list_id: Uuid,

    pub status: DropStatus,

    /// Current discount percentage. Monotonic non-decreasing while active.
    pub current_discount: Decimal,

    /// Sum of committed reservation amounts, at original (undiscounted) price.
    /// Never decremented, even when a reservation is cancelled.
    pub current_value: Decimal,

    /// Committed value at which the maximum discount is reached
    pub target_value: Decimal,

    /// Discount bounds, copied from the supplier list at creation time
    pub min_discount: Decimal,
    pub max_discount: Decimal,

    /// Set when the drop is activated
    pub start_time: Option<DateTime<Utc>>,
    /// start_time + configured drop duration
    pub end_time: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Drop {
    /// Whether the drop window has closed (only meaningful while active).
    pub fn is_past_end(&self, now: DateTime<Utc>) -> bool {
        self.end_time.map_or(false, |end| now >= end)
    }
}

// =============================================================================
// SUPPLIER LIST & PRODUCT
// =============================================================================

/// A supplier's catalogue; defines the discount band for drops built on it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SupplierList {
    pub id: Uuid,
    pub name: String,

    /// Discount a drop starts at when activated
    pub min_discount: Decimal,
    /// Discount reached when current_value hits target_value
    pub max_discount: Decimal,
}

/// A sellable product. `stock` is the number of units still reservable;
/// it is decremented by reserve and restored on user cancellation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: Uuid,
    pub supplier_list_id: Uuid,
    pub name: String,

    /// Undiscounted unit price; snapshotted onto reservations
    pub price: Decimal,

    pub stock: i32,
}

// =============================================================================
// RESERVATION
// =============================================================================
/// A user's commitment to buy one product in a drop.
///
/// The payment hold is taken for `original_price` (the maximum that can
/// ever be captured); `discount_percentage` and `final_price` stay NULL
/// until settlement freezes the drop's discount and captures the hold.
/// Invariant: `final_price <= authorized_amount` always.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reservation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub drop_id: Uuid,

    /// Product price at reservation time
    pub original_price: Decimal,

    /// Amount of the payment hold; equals original_price
    pub authorized_amount: Decimal,

    /// Frozen at capture time (not at reservation time)
    pub discount_percentage: Option<Decimal>,

    /// original_price × (1 − discount/100), computed at capture
    pub final_price: Option<Decimal>,

    pub payment_status: PaymentStatus,

    /// Processor reference for the hold, present once authorized
    pub payment_hold_id: Option<String>,

    pub status: ReservationStatus,

    /// Set when the user collects the item at the pickup point
    pub picked_up_at: Option<DateTime<Utc>>,
    /// Set when the item is returned at the pickup point
    pub returned_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// USER PROFILE (REPUTATION)
// =============================================================================

/// Rating ceiling on the 5-star scale; loyalty accrual requires it.
pub const RATING_MAX: i16 = 5;
/// Ratings never drop below one star.
pub const RATING_MIN: i16 = 1;

/// The reputation and payment-method state this core maintains per user.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserProfile {
    pub id: Uuid,

    /// 5-star rating; starts at RATING_MAX, decremented per confirmed return
    pub rating: i16,

    /// Total confirmed returns across the account's lifetime
    pub lifetime_returns_count: i32,

    /// Set once lifetime_returns_count crosses the suspension ceiling;
    /// suspended users cannot create new reservations
    pub suspended: bool,

    /// Default payment method reference at the processor
    pub payment_method_ref: Option<String>,
    pub payment_method_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    /// Loyalty points accrue only while the rating is at maximum.
    /// The loyalty collaborator reads this; we only maintain the state.
    pub fn loyalty_eligible(&self) -> bool {
        self.rating == RATING_MAX
    }

    /// A usable default payment method: present and not expired.
    pub fn has_usable_payment_method(&self, now: DateTime<Utc>) -> bool {
        match (&self.payment_method_ref, self.payment_method_expires_at) {
            (Some(_), Some(expires)) => expires > now,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

// =============================================================================
// SETTLEMENT REPORT
// =============================================================================

/// Per-reservation outcome of a settlement capture pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureOutcome {
    pub reservation_id: Uuid,
    pub user_id: Uuid,
    pub final_price: Decimal,

    /// true = captured; false = capture failed, reservation cancelled
    pub captured: bool,

    /// Processor failure detail for reconciliation; None on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// The result of settling a drop: the frozen discount and every
/// reservation's capture outcome. Persisted once per drop; re-settling
/// returns the stored report unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementReport {
    pub drop_id: Uuid,

    /// Drop discount at the instant settlement began
    pub discount_percentage: Decimal,

    pub settled_at: DateTime<Utc>,
    pub outcomes: Vec<CaptureOutcome>,
    pub total_captured: Decimal,
    pub captured_count: usize,
    pub failed_count: usize,
}

// =============================================================================
// REPUTATION UPDATE
// =============================================================================
/// Response after recording a return against a reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationUpdate {
    pub user_id: Uuid,
    pub rating: i16,
    pub lifetime_returns_count: i32,
    pub suspended: bool,
    pub loyalty_eligible: bool,
}

// =============================================================================
// API REQUEST/RESPONSE STRUCTURES
// =============================================================================
// Kept separate from the database records so the API shape can evolve
// without schema changes.

/// Request body for creating a drop (enters pending_approval).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDropRequest {
    pub name: String,
    pub pickup_point_id: Uuid,
    pub supplier_list_id: Uuid,
    pub target_value: Decimal,
}

/// Request body for a lifecycle transition on a drop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub action: crate::lifecycle::DropAction,
    pub actor: crate::lifecycle::Actor,
}

/// Request body for reserving a product in a drop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub drop_id: Uuid,
}

/// Request body for a user cancelling their own reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelReservationRequest {
    pub user_id: Uuid,
}

/// Request body for recording a return at a pickup point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordReturnRequest {
    pub reservation_id: Uuid,
}

/// Paginated drop listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropListResponse {
    pub drops: Vec<Drop>,
    pub total: i64,
    pub page: i32,
    pub per_page: i32,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

/// Simple liveness response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Detailed readiness response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

/// Individual dependency health checks
#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    pub redis: bool,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// Standard API error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error: impl Into<String>,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn profile(rating: i16) -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            rating,
            lifetime_returns_count: 0,
            suspended: false,
            payment_method_ref: Some("pm_test".to_string()),
            payment_method_expires_at: Some(Utc::now() + Duration::days(30)),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn loyalty_requires_max_rating() {
        assert!(profile(RATING_MAX).loyalty_eligible());
        assert!(!profile(RATING_MAX - 1).loyalty_eligible());
    }

    #[test]
    fn expired_payment_method_is_not_usable() {
        let now = Utc::now();
        let mut p = profile(RATING_MAX);
        assert!(p.has_usable_payment_method(now));

        p.payment_method_expires_at = Some(now - Duration::days(1));
        assert!(!p.has_usable_payment_method(now));

        p.payment_method_ref = None;
        assert!(!p.has_usable_payment_method(now));
    }

    #[test]
    fn terminal_statuses() {
        assert!(DropStatus::Completed.is_terminal());
        assert!(DropStatus::Expired.is_terminal());
        assert!(DropStatus::Cancelled.is_terminal());
        assert!(!DropStatus::Active.is_terminal());
        assert!(!DropStatus::Inactive.is_terminal());
        assert!(!DropStatus::PendingApproval.is_terminal());
    }
}
