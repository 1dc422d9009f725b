// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers (controller layer). The handlers stay thin:
// parse the request, call into the domain modules, record metrics, and
// keep the drop cache honest. Business rules live in reserve.rs,
// transitions.rs, settlement.rs, and reputation.rs.
// =============================================================================

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::*;
use crate::transitions;
use crate::AppState;

/// TTL for cached drop JSON. Short on purpose: the discount moves with
/// every reservation and stale reads here show up in the UI.
const DROP_CACHE_TTL_SECS: u32 = 30;

/// Cache key for a drop's JSON. Shared with the scheduler so its
/// transitions invalidate the same entry the read path populates.
pub(crate) fn drop_cache_key(id: Uuid) -> String {
    format!("drop:{}", id)
}

async fn invalidate_drop_cache(state: &AppState, id: Uuid) {
    let _: Result<(), _> = redis::cmd("DEL")
        .arg(drop_cache_key(id))
        .query_async(&mut state.redis.clone())
        .await;
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe.
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "drop-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe: checks database and Redis connectivity.
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let db_healthy = state.db.health_check().await;

    let redis_healthy = redis::cmd("PING")
        .query_async::<_, String>(&mut state.redis.clone())
        .await
        .is_ok();

    let all_healthy = db_healthy && redis_healthy;
    let status = if all_healthy { "ready" } else { "not_ready" };

    let response = ReadinessResponse {
        status: status.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            redis: redis_healthy,
        },
    };

    if all_healthy {
        Ok(Json(response))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Prometheus metrics in exposition format.
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// DROP ENDPOINTS
// =============================================================================

/// Query parameters for the drop listing.
#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_page")]
    pub page: i32,

    #[serde(default = "default_per_page")]
    pub per_page: i32,
}

fn default_page() -> i32 {
    1
}
fn default_per_page() -> i32 {
    20
}

/// Create a drop. It enters the lifecycle as pending_approval; the
/// discount band is copied from the supplier list at creation time so a
/// later list edit cannot change a running drop.
///
/// POST /api/v1/drops
pub async fn create_drop(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateDropRequest>,
) -> AppResult<(StatusCode, Json<Drop>)> {
    let start = Instant::now();

    if request.name.trim().is_empty() {
        return Err(AppError::Validation("drop name must not be empty".into()));
    }
    if request.target_value <= rust_decimal::Decimal::ZERO {
        return Err(AppError::Validation(
            "target_value must be positive".to_string(),
        ));
    }

    let list = state
        .db
        .get_supplier_list(request.supplier_list_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!("supplier list {}", request.supplier_list_id))
        })?;

    let drop = state.db.create_drop(&request, &list).await?;

    tracing::info!(
        drop_id = %drop.id,
        name = %drop.name,
        target_value = %drop.target_value,
        "Drop created, awaiting approval"
    );

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/drops", 201, duration);

    Ok((StatusCode::CREATED, Json(drop)))
}

/// List drops with pagination.
///
/// GET /api/v1/drops?page=1&per_page=20
pub async fn list_drops(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> AppResult<Json<DropListResponse>> {
    let start = Instant::now();

    let page = params.page.max(1);
    let per_page = params.per_page.clamp(1, 100);

    let (drops, total) = state.db.list_drops(page, per_page).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/drops", 200, duration);

    Ok(Json(DropListResponse {
        drops,
        total,
        page,
        per_page,
    }))
}

/// Get a single drop, cache-aside through Redis.
///
/// GET /api/v1/drops/:id
pub async fn get_drop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Drop>> {
    let start = Instant::now();

    let cache_key = drop_cache_key(id);
    let cached: Option<String> = redis::cmd("GET")
        .arg(&cache_key)
        .query_async(&mut state.redis.clone())
        .await
        .ok();

    if let Some(cached_json) = cached {
        if let Ok(drop) = serde_json::from_str::<Drop>(&cached_json) {
            let duration = start.elapsed().as_secs_f64();
            metrics::record_http_request("GET", "/api/v1/drops/:id", 200, duration);
            return Ok(Json(drop));
        }
    }

    let drop = state
        .db
        .get_drop(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("drop {}", id)))?;

    if let Ok(drop_json) = serde_json::to_string(&drop) {
        let _: Result<(), _> = redis::cmd("SETEX")
            .arg(&cache_key)
            .arg(DROP_CACHE_TTL_SECS)
            .arg(drop_json)
            .query_async(&mut state.redis.clone())
            .await;
    }

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("GET", "/api/v1/drops/:id", 200, duration);

    Ok(Json(drop))
}

/// Apply a lifecycle action to a drop (approve, activate, pause,
/// resume, close, expire, cancel). Closing settles the drop before the
/// response returns.
///
/// POST /api/v1/drops/:id/transition
pub async fn transition_drop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> AppResult<Json<Drop>> {
    let start = Instant::now();

    tracing::info!(
        drop_id = %id,
        action = %request.action,
        actor = %request.actor,
        "Transition requested"
    );

    let drop = transitions::apply(
        &state.db,
        &state.gateway,
        &state.notifier,
        state.config.payment_timeout,
        state.config.drop_duration,
        id,
        request.action,
        request.actor,
    )
    .await?;

    invalidate_drop_cache(&state, id).await;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/drops/:id/transition", 200, duration);

    Ok(Json(drop))
}

/// Fetch the settlement report for a completed drop.
///
/// GET /api/v1/drops/:id/settlement
pub async fn get_settlement(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<SettlementReport>> {
    let start = Instant::now();

    if let Some(report) = state.db.get_settlement_report(id).await? {
        let duration = start.elapsed().as_secs_f64();
        metrics::record_http_request("GET", "/api/v1/drops/:id/settlement", 200, duration);
        return Ok(Json(report));
    }

    // No finalized report: distinguish "not settled yet" from "no such
    // drop" for the caller
    let drop = state
        .db
        .get_drop(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("drop {}", id)))?;

    if drop.status == DropStatus::Completed {
        Err(AppError::State(format!(
            "settlement for drop {} is still in progress",
            id
        )))
    } else {
        Err(AppError::State(format!(
            "drop {} is {}, not settled",
            id,
            drop.status.as_str()
        )))
    }
}

// =============================================================================
// RESERVATION ENDPOINTS
// =============================================================================

/// Reserve a product in an active drop. Authorizes a hold for the full
/// original price and applies the amount to the drop's ledger.
///
/// POST /api/v1/reservations
pub async fn create_reservation(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReserveRequest>,
) -> AppResult<(StatusCode, Json<Reservation>)> {
    let start = Instant::now();

    let result = crate::reserve::reserve(
        &state.db,
        &state.gateway,
        &state.notifier,
        state.config.payment_timeout,
        request.user_id,
        request.product_id,
        request.drop_id,
    )
    .await;

    let duration = start.elapsed().as_secs_f64();

    match result {
        Ok(reservation) => {
            metrics::record_http_request("POST", "/api/v1/reservations", 201, duration);
            // The drop's value and discount moved
            invalidate_drop_cache(&state, request.drop_id).await;
            Ok((StatusCode::CREATED, Json(reservation)))
        }
        Err(e) => {
            metrics::record_http_request(
                "POST",
                "/api/v1/reservations",
                e.status_code().as_u16(),
                duration,
            );
            metrics::record_reservation(request.drop_id, "rejected");
            tracing::warn!(
                user_id = %request.user_id,
                drop_id = %request.drop_id,
                error = %e,
                "Reservation rejected"
            );
            Err(e)
        }
    }
}

/// Fetch a reservation.
///
/// GET /api/v1/reservations/:id
pub async fn get_reservation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Reservation>> {
    let reservation = state
        .db
        .get_reservation(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("reservation {}", id)))?;
    Ok(Json(reservation))
}

/// Cancel one's own reservation before the drop closes. Releases the
/// hold and returns the unit to stock; the drop's accumulated value and
/// discount stay where they are.
///
/// POST /api/v1/reservations/:id/cancel
pub async fn cancel_reservation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelReservationRequest>,
) -> AppResult<Json<Reservation>> {
    let start = Instant::now();

    let reservation = crate::reserve::cancel_reservation(
        &state.db,
        &state.gateway,
        &state.notifier,
        state.config.payment_timeout,
        id,
        request.user_id,
    )
    .await?;

    invalidate_drop_cache(&state, reservation.drop_id).await;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/reservations/:id/cancel", 200, duration);

    Ok(Json(reservation))
}

// =============================================================================
// REPUTATION ENDPOINTS
// =============================================================================

/// Record a return at a pickup point. Idempotent per reservation.
///
/// POST /api/v1/returns
pub async fn record_return(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RecordReturnRequest>,
) -> AppResult<Json<ReputationUpdate>> {
    let start = Instant::now();

    let update = crate::reputation::record_return(&state.db, request.reservation_id).await?;

    let duration = start.elapsed().as_secs_f64();
    metrics::record_http_request("POST", "/api/v1/returns", 200, duration);

    Ok(Json(update))
}

/// Fetch a user's reputation view.
///
/// GET /api/v1/users/:id/reputation
pub async fn get_reputation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ReputationUpdate>> {
    let update = crate::reputation::get_reputation(&state.db, id).await?;
    Ok(Json(update))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_format_is_stable() {
        // The scheduler deletes by this key; a format change here must
        // be matched there or invalidation silently stops working.
        let id = Uuid::parse_str("7f9c24e5-2f8a-4b6e-9d3c-1a5b8e0f4c2d").unwrap();
        assert_eq!(
            drop_cache_key(id),
            "drop:7f9c24e5-2f8a-4b6e-9d3c-1a5b8e0f4c2d"
        );
    }
}
