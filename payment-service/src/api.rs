use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};
use uuid::Uuid;

use shared::models::{Merchant, Order};
use shared::{escalate_invariant, TicketError};

use crate::gateway::VoidOutcome;
use crate::merchants::{MerchantApplicationBody, MerchantOnboarding};
use crate::orders::{CheckoutRequest, PaymentOrders};
use crate::webhook::{certificate_matches, OrderWebhookData, CERTIFICATE_HEADER};

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<PaymentOrders>,
    pub onboarding: Arc<MerchantOnboarding>,
    pub webhook_certificate: Arc<str>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct VoidResponse {
    pub order_id: Uuid,
    pub outcome: &'static str,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(checkout))
        .route("/orders/:order_id/void", post(void_order))
        .route("/webhooks/orders", post(order_webhook))
        .route("/networks/:network_id/merchants", post(create_merchant))
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
        error!("request failed: {}", e);
    } else {
        debug!("request rejected: {}", e);
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.code().to_string(),
        }),
    )
}

pub async fn checkout(State(state): State<AppState>, Json(request): Json<CheckoutRequest>) -> ApiResult<Order> {
    state.orders.checkout(request).await.map(Json).map_err(reject)
}

pub async fn void_order(State(state): State<AppState>, Path(order_id): Path<Uuid>) -> ApiResult<VoidResponse> {
    let outcome = state.orders.void(order_id).await.map_err(reject)?;
    Ok(Json(VoidResponse {
        order_id,
        outcome: match outcome {
            VoidOutcome::Voided => "voided",
            VoidOutcome::CannotVoid => "cannot_void",
        },
    }))
}

pub async fn create_merchant(
    State(state): State<AppState>,
    Path(network_id): Path<Uuid>,
    Json(body): Json<MerchantApplicationBody>,
) -> ApiResult<Merchant> {
    state
        .onboarding
        .create_application(network_id, body)
        .await
        .map(Json)
        .map_err(reject)
}

/// Semantic rejections still answer 200 so the gateway stops redelivering.
pub async fn order_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> (StatusCode, Json<Value>) {
    let presented = headers.get(CERTIFICATE_HEADER).and_then(|v| v.to_str().ok());
    if !certificate_matches(presented, &state.webhook_certificate) {
        warn!("webhook with bad certificate refused");
        return (StatusCode::UNAUTHORIZED, Json(json!({"status": "unauthorized"})));
    }

    let incoming = match OrderWebhookData::parse(&body).and_then(|(webhook, event)| webhook.into_incoming(event)) {
        Ok(incoming) => incoming,
        Err(e) => {
            warn!("webhook refused: {}", e);
            return (StatusCode::BAD_REQUEST, Json(json!({"status": "error", "message": e.to_string()})));
        }
    };

    let event_id = incoming.event_id.clone();
    match state.orders.apply_event(incoming).await {
        Ok(outcome) => {
            debug!(event_id = %event_id, ?outcome, "webhook handled");
            (StatusCode::OK, Json(json!({"status": "success"})))
        }
        Err(e) if e.is_semantic_rejection() => {
            warn!(event_id = %event_id, "webhook rejected: {}", e);
            (StatusCode::OK, Json(json!({"status": "success"})))
        }
        Err(e) => {
            let (status, Json(body)) = reject(e);
            (status, Json(json!({"status": "error", "code": body.code})))
        }
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_map_to_bad_gateway() {
        let (status, Json(body)) = reject(TicketError::GatewayFailure("timeout".to_string()));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body.code, "GATEWAY_FAILURE");
    }

    #[test]
    fn terminal_orders_are_conflicts() {
        let (status, _) = reject(TicketError::NotUpdatable {
            order_id: "ord-1".to_string(),
            status: "COMPLETED".to_string(),
        });
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
