use parley_models::gateway::RejectReason;
use parley_util::validation::ValidationError;
use thiserror::Error;

/// A refusal reported back to the connection that asked for the operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason:?}: {message}")]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
}

impl Rejection {
    pub fn new(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(RejectReason::Validation, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(RejectReason::Authorization, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(RejectReason::Transient, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(RejectReason::Unreachable, message)
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("database error: {0}")]
    Database(#[from] parley_db::DbError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Timeout(_) => true,
            CoreError::Database(err) => err.is_transient(),
            CoreError::Rejected(_) | CoreError::Internal(_) => false,
        }
    }

    /// What the originating connection is told. Anything that is not an
    /// explicit rejection is reported as transient so internals do not leak.
    pub fn to_rejection(&self) -> Rejection {
        match self {
            CoreError::Rejected(rejection) => rejection.clone(),
            _ => Rejection::transient("temporarily unavailable, try again"),
        }
    }
}

impl From<ValidationError> for CoreError {
    fn from(err: ValidationError) -> Self {
        CoreError::Rejected(Rejection::validation(err.to_string()))
    }
}
