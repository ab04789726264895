use thiserror::Error;

use crate::domain::{
    Actor, Credits, Ineligibility, LedgerError, RequestId, RequestState, ServiceRequest,
    TransitionError, UserId,
};
use crate::storage::VersionConflict;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Insufficient credits for user {user_id}: available {available}, required {required}")]
    InsufficientCredits {
        user_id: UserId,
        available: Credits,
        required: Credits,
    },

    #[error("Invalid reservation for user {user_id}: reserved {reserved}, required {required}")]
    InvalidReservation {
        user_id: UserId,
        reserved: Credits,
        required: Credits,
    },

    #[error("Cannot {event} request {request_id} in state {from}")]
    IllegalTransition {
        request_id: RequestId,
        from: RequestState,
        event: &'static str,
    },

    #[error("No eligible provider for request {0}")]
    NoEligibleProvider(RequestId),

    #[error("Provider {provider_id} is not eligible: {reason}")]
    IneligibleProvider {
        provider_id: UserId,
        reason: Ineligibility,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{actor} is not allowed to {action}")]
    Unauthorized { actor: Actor, action: String },

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Idempotency key {key} was already used for {command}")]
    IdempotencyKeyReused { key: String, command: String },

    #[error("Storage error: {0}")]
    Storage(anyhow::Error),
}

impl EngineError {
    /// Errors that carry no partial side effect and may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict(_) | EngineError::CollaboratorUnavailable(_)
        )
    }

    pub(crate) fn from_transition(request: &ServiceRequest, err: TransitionError) -> Self {
        let request_id = request.id;
        match err {
            TransitionError::Illegal { from, event } => EngineError::IllegalTransition {
                request_id,
                from,
                event,
            },
            TransitionError::Unauthorized { actor, event } => EngineError::Unauthorized {
                actor,
                action: format!("{} request {}", event, request_id),
            },
            TransitionError::SelfMatch => EngineError::IneligibleProvider {
                provider_id: request.requester_id,
                reason: Ineligibility::SelfMatch,
            },
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits {
                user_id,
                available,
                required,
            } => EngineError::InsufficientCredits {
                user_id,
                available,
                required,
            },
            LedgerError::InvalidReservation {
                user_id,
                reserved,
                required,
            } => EngineError::InvalidReservation {
                user_id,
                reserved,
                required,
            },
            overflow @ LedgerError::Overflow { .. } => {
                EngineError::InvalidAmount(overflow.to_string())
            }
        }
    }
}

/// SQLite result codes (primary code in the low byte) that mean another
/// writer got there first.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(conflict) = cause.downcast_ref::<VersionConflict>() {
                return EngineError::Conflict(conflict.to_string());
            }
            if let Some(sql_err) = cause.downcast_ref::<sqlx::Error>() {
                if is_contention(sql_err) {
                    return EngineError::Conflict(sql_err.to_string());
                }
            }
        }
        EngineError::Storage(err)
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::from(anyhow::Error::new(err))
    }
}
