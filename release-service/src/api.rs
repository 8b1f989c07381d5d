use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use shared::db::DbPool;
use shared::models::TicketRequest;
use shared::{escalate_invariant, RequestDraft, SharedClock, TicketError};

use crate::admitter::RequestAdmitter;
use crate::allocator::{AllocationSummary, Allocator};
use crate::catalog::{self, ReleaseDraft, ReleaseWithTypes};
use crate::promoter::{ReleasePromotion, ReservePromoter};

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub clock: SharedClock,
    pub admitter: Arc<RequestAdmitter>,
    pub allocator: Arc<Allocator>,
    pub promoter: Arc<ReservePromoter>,
    pub default_max_tickets_per_user: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequestsBody {
    pub user_id: Uuid,
    pub requests: Vec<RequestDraft>,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawQuery {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct WithdrawResponse {
    pub request_id: Uuid,
    pub tickets_freed: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct AllocateBody {
    pub seed: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/releases", post(create_release))
        .route("/releases/:release_id/requests", post(submit_requests))
        .route("/releases/:release_id/allocate", post(allocate_release))
        .route("/releases/:release_id/promote", post(promote_release))
        .route("/requests/:request_id", delete(withdraw_request))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                tower_http::cors::CorsLayer::new()
                    .allow_origin(tower_http::cors::Any)
                    .allow_methods(tower_http::cors::Any)
                    .allow_headers(tower_http::cors::Any),
            ),
        )
}

pub fn reject(e: TicketError) -> (StatusCode, Json<ErrorResponse>) {
    escalate_invariant(&e);
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!("request failed: {}", e);
    } else {
        tracing::debug!("request rejected: {}", e);
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.code().to_string(),
        }),
    )
}

pub async fn create_release(
    State(state): State<AppState>,
    Json(draft): Json<ReleaseDraft>,
) -> ApiResult<ReleaseWithTypes> {
    catalog::create_release(&state.pool, &state.clock, draft, state.default_max_tickets_per_user)
        .await
        .map(Json)
        .map_err(reject)
}

pub async fn submit_requests(
    State(state): State<AppState>,
    Path(release_id): Path<Uuid>,
    Json(body): Json<SubmitRequestsBody>,
) -> ApiResult<Vec<TicketRequest>> {
    state
        .admitter
        .submit(release_id, body.user_id, body.requests)
        .await
        .map(Json)
        .map_err(reject)
}

pub async fn withdraw_request(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    Query(query): Query<WithdrawQuery>,
) -> ApiResult<WithdrawResponse> {
    state
        .admitter
        .withdraw(request_id, query.user_id)
        .await
        .map(|tickets_freed| Json(WithdrawResponse { request_id, tickets_freed }))
        .map_err(reject)
}

pub async fn allocate_release(
    State(state): State<AppState>,
    Path(release_id): Path<Uuid>,
    body: Option<Json<AllocateBody>>,
) -> ApiResult<AllocationSummary> {
    let seed = body.and_then(|Json(b)| b.seed);
    state
        .allocator
        .allocate(release_id, seed)
        .await
        .map(Json)
        .map_err(reject)
}

pub async fn promote_release(
    State(state): State<AppState>,
    Path(release_id): Path<Uuid>,
) -> ApiResult<ReleasePromotion> {
    state
        .promoter
        .promote_release(release_id)
        .await
        .map(Json)
        .map_err(reject)
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_keep_their_code() {
        let (status, Json(body)) = reject(TicketError::OverUserCap {
            user_id: Uuid::nil(),
            requested: 11,
            cap: 10,
        });
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.code, "OVER_USER_CAP");

        let (status, _) = reject(TicketError::AlreadyAllocated(Uuid::nil()));
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[test]
    fn submit_body_parses() {
        let body: SubmitRequestsBody = serde_json::from_value(serde_json::json!({
            "user_id": Uuid::nil(),
            "requests": [{"ticket_type_id": Uuid::nil(), "amount": 2}]
        }))
        .unwrap();
        assert_eq!(body.requests[0].amount, 2);
    }
}
