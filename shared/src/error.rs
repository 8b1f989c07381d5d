use diesel::result::DatabaseErrorKind;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("release {0} has closed")]
    Closed(Uuid),

    #[error("release {0} is not open yet")]
    NotYetOpen(Uuid),

    #[error("user {user_id} would hold {requested} tickets, cap is {cap}")]
    OverUserCap { user_id: Uuid, requested: i64, cap: i64 },

    #[error("release {0} has already been allocated")]
    AlreadyAllocated(Uuid),

    #[error("release {0} has no ticket requests")]
    NoRequests(Uuid),

    #[error("unknown order {0}")]
    UnknownOrder(String),

    #[error("order {order_id} is {status} and can no longer be updated")]
    NotUpdatable { order_id: String, status: String },

    #[error("event {event} is not allowed while order is {from}")]
    IllegalTransition { from: String, event: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("payment gateway failure: {0}")]
    GatewayFailure(String),

    #[error("transaction conflict")]
    TransactionConflict,

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("database error: {0}")]
    Database(diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),
}

impl TicketError {
    /// Machine readable code exposed to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            TicketError::Closed(_) => "CLOSED",
            TicketError::NotYetOpen(_) => "NOT_YET_OPEN",
            TicketError::OverUserCap { .. } => "OVER_USER_CAP",
            TicketError::AlreadyAllocated(_) => "ALREADY_ALLOCATED",
            TicketError::NoRequests(_) => "NO_REQUESTS",
            TicketError::UnknownOrder(_) => "UNKNOWN_ORDER",
            TicketError::NotUpdatable { .. } => "NOT_UPDATABLE",
            TicketError::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            TicketError::NotFound(_) => "NOT_FOUND",
            TicketError::InvalidRequest(_) => "INVALID_REQUEST",
            TicketError::GatewayFailure(_) => "GATEWAY_FAILURE",
            TicketError::TransactionConflict => "TRANSACTION_CONFLICT",
            TicketError::Invariant(_) => "INVARIANT",
            TicketError::Database(_) => "DATABASE_ERROR",
            TicketError::Pool(_) => "POOL_ERROR",
        }
    }

    /// HTTP status the error surfaces with on request-serving paths.
    pub fn status_code(&self) -> u16 {
        match self {
            TicketError::Closed(_)
            | TicketError::NotYetOpen(_)
            | TicketError::AlreadyAllocated(_)
            | TicketError::NotUpdatable { .. }
            | TicketError::IllegalTransition { .. } => 409,
            TicketError::OverUserCap { .. }
            | TicketError::NoRequests(_)
            | TicketError::InvalidRequest(_) => 422,
            TicketError::UnknownOrder(_) | TicketError::NotFound(_) => 404,
            TicketError::GatewayFailure(_) => 502,
            TicketError::TransactionConflict => 503,
            TicketError::Invariant(_) | TicketError::Database(_) | TicketError::Pool(_) => 500,
        }
    }

    pub fn is_invariant(&self) -> bool {
        matches!(self, TicketError::Invariant(_))
    }

    /// Semantic rejections are answered with 200 on the webhook path.
    pub fn is_semantic_rejection(&self) -> bool {
        matches!(
            self,
            TicketError::UnknownOrder(_)
                | TicketError::NotUpdatable { .. }
                | TicketError::IllegalTransition { .. }
        )
    }
}

/// Corrupted state: page someone. Debug builds abort.
pub fn escalate_invariant(err: &TicketError) {
    if let TicketError::Invariant(detail) = err {
        error!(alert = true, detail = %detail, "ticket invariant violated");
        if cfg!(debug_assertions) {
            std::process::abort();
        }
    }
}

impl From<diesel::result::Error> for TicketError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => {
                TicketError::TransactionConflict
            }
            other => TicketError::Database(other),
        }
    }
}

impl From<bb8::RunError<diesel_async::pooled_connection::PoolError>> for TicketError {
    fn from(err: bb8::RunError<diesel_async::pooled_connection::PoolError>) -> Self {
        TicketError::Pool(err.to_string())
    }
}

impl From<serde_json::Error> for TicketError {
    fn from(err: serde_json::Error) -> Self {
        TicketError::Invariant(format!("serialization: {}", err))
    }
}

pub type TicketResult<T> = Result<T, TicketError>;
