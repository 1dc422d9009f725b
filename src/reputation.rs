// =============================================================================
// REPUTATION MODULE
// =============================================================================
// Return-based reputation: each confirmed return at a pickup point
// steps the user's rating down and their lifetime return count up;
// crossing the ceiling suspends the account from new reservations.
//
// The no-double-count guarantee comes from the conditional update in
// db::mark_reservation_returned: only an item that was neither picked
// up nor already returned matches, and both updates run in one
// transaction, so a repeated call changes nothing and reports
// AlreadyProcessed.
// =============================================================================

use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::models::{ReputationUpdate, UserProfile};

/// Lifetime returns at which the account is suspended from reserving.
pub const SUSPENSION_CEILING: i32 = 100;

/// Record a return for a reservation's item.
///
/// Preconditions: the item was not picked up and not already returned.
/// Effects: rating steps down (floor 1), lifetime count steps up, and
/// the suspension flag flips when the ceiling is crossed.
pub async fn record_return(db: &Database, reservation_id: Uuid) -> AppResult<ReputationUpdate> {
    // Distinguish "no such reservation" from "already processed" for
    // the caller before taking the transaction
    let existing = db
        .get_reservation(reservation_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("reservation {}", reservation_id)))?;

    if existing.picked_up_at.is_some() {
        return Err(AppError::AlreadyProcessed(
            "item was already picked up".to_string(),
        ));
    }
    if existing.returned_at.is_some() {
        return Err(AppError::AlreadyProcessed(
            "item was already returned".to_string(),
        ));
    }

    let mut tx = db.begin().await?;

    // The conditional update is the authoritative guard; the checks
    // above only shape the error message
    let user_id = match db.mark_reservation_returned(&mut tx, reservation_id).await? {
        Some(user_id) => user_id,
        None => {
            tx.rollback().await?;
            return Err(AppError::AlreadyProcessed(
                "item was already picked up or returned".to_string(),
            ));
        }
    };

    let profile = db
        .apply_return_to_profile(&mut tx, user_id, SUSPENSION_CEILING)
        .await?;

    tx.commit().await?;

    if profile.suspended {
        tracing::warn!(
            user_id = %user_id,
            lifetime_returns = profile.lifetime_returns_count,
            "User crossed the return ceiling; account suspended"
        );
    }

    crate::metrics::record_return_event(profile.suspended);

    tracing::info!(
        user_id = %user_id,
        reservation_id = %reservation_id,
        rating = profile.rating,
        "Return recorded"
    );

    Ok(update_from_profile(&profile))
}

fn update_from_profile(profile: &UserProfile) -> ReputationUpdate {
    ReputationUpdate {
        user_id: profile.id,
        rating: profile.rating,
        lifetime_returns_count: profile.lifetime_returns_count,
        suspended: profile.suspended,
        loyalty_eligible: profile.loyalty_eligible(),
    }
}

/// Fetch a user's current reputation view.
pub async fn get_reputation(db: &Database, user_id: Uuid) -> AppResult<ReputationUpdate> {
    let profile = db
        .get_profile(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))?;
    Ok(update_from_profile(&profile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RATING_MAX, RATING_MIN};
    use chrono::Utc;

    fn profile(rating: i16, returns: i32, suspended: bool) -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            rating,
            lifetime_returns_count: returns,
            suspended,
            payment_method_ref: None,
            payment_method_expires_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn loyalty_eligibility_tracks_max_rating_only() {
        let update = update_from_profile(&profile(RATING_MAX, 0, false));
        assert!(update.loyalty_eligible);

        let update = update_from_profile(&profile(RATING_MAX - 1, 1, false));
        assert!(!update.loyalty_eligible);

        let update = update_from_profile(&profile(RATING_MIN, 50, false));
        assert!(!update.loyalty_eligible);
    }

    #[test]
    fn suspension_is_reflected_in_the_update() {
        let update = update_from_profile(&profile(RATING_MIN, SUSPENSION_CEILING, true));
        assert!(update.suspended);
        assert_eq!(update.lifetime_returns_count, SUSPENSION_CEILING);
    }
}
