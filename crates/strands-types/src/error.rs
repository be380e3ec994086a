use thiserror::Error;

/// Error kinds shared by every service.
///
/// The client-facing layers map these onto HTTP statuses via
/// [`StrandError::http_status`]; internal layers match on the variants.
#[derive(Debug, Error)]
pub enum StrandError {
    #[error("not found")]
    NotFound,

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("not authorized")]
    Unauthorized,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("queue at capacity")]
    QueueFull,

    #[error("request timed out")]
    Timeout,

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("model load failed: {0}")]
    LoadFailed(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl StrandError {
    /// Stable machine-readable kind, used in structured error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::ValidationFailed(_) => "validation_failed",
            Self::Unauthenticated => "unauthenticated",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::QueueFull => "queue_full",
            Self::Timeout => "timeout",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::LoadFailed(_) => "load_failed",
            Self::GenerationFailed(_) => "generation_failed",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::StorageError(_) => "storage_error",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status this kind converts to at the client API layer.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::ValidationFailed(_) => 400,
            Self::Unauthenticated => 401,
            Self::Unauthorized => 403,
            Self::RateLimited => 429,
            Self::QueueFull => 503,
            Self::Timeout => 504,
            Self::InvalidTransition { .. } => 409,
            Self::LoadFailed(_) => 502,
            Self::GenerationFailed(_) => 502,
            Self::ServiceUnavailable(_) => 503,
            Self::StorageError(_) => 500,
            Self::Cancelled => 499,
            Self::Internal(_) => 500,
        }
    }
}

impl From<serde_json::Error> for StrandError {
    fn from(e: serde_json::Error) -> Self {
        Self::ValidationFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_api_contract() {
        assert_eq!(StrandError::NotFound.http_status(), 404);
        assert_eq!(StrandError::Unauthenticated.http_status(), 401);
        assert_eq!(StrandError::Unauthorized.http_status(), 403);
        assert_eq!(StrandError::RateLimited.http_status(), 429);
        assert_eq!(StrandError::Timeout.http_status(), 504);
        assert_eq!(
            StrandError::ServiceUnavailable("chat".into()).http_status(),
            503
        );
    }

    #[test]
    fn kinds_are_snake_case() {
        let err = StrandError::InvalidTransition {
            from: "idle".into(),
            to: "generating".into(),
        };
        assert_eq!(err.kind(), "invalid_transition");
    }
}
