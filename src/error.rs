//! Crate-wide structured error type.
//!
//! Every service operation returns [`Error`], which carries a stable
//! machine-readable code. Boundary layers (RESP/HTTP adapters, RPC
//! handlers) map codes onto their own protocol; the core never formats
//! protocol-specific payloads itself.

/// Structured error for all core services.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("session not found")]
    SessionNotFound,
    #[error("session expired")]
    SessionExpired,
    #[error("session already exists: {0}")]
    SessionConflict(String),
    #[error("version conflict: expected {expected}, stored {stored}")]
    VersionConflict { expected: u64, stored: u64 },
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("malformed token")]
    TokenMalformed,
    #[error("invalid token")]
    TokenInvalid,
    #[error("nonce replayed")]
    NonceReplay,
    #[error("timestamp outside acceptance window")]
    TimestampSkew,
    #[error("api key not found")]
    ApiKeyNotFound,
    #[error("api key is disabled")]
    ApiKeyDisabled,
    #[error("invalid api key")]
    ApiKeyInvalid,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("client ip not allowed")]
    IpNotAllowed,
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: std::time::Duration },
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not the cluster leader")]
    NotLeader,
    #[error("rebalance already running")]
    AlreadyRunning,
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
}

impl Error {
    /// Stable machine-readable code for this error.
    ///
    /// Codes are part of the wire contract: adapters key off them, so
    /// renaming one is a breaking change.
    pub fn code(&self) -> &'static str {
        match self {
            Error::MissingArgument(_) => "MISSING_ARGUMENT",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::SessionNotFound => "SESSION_NOT_FOUND",
            Error::SessionExpired => "SESSION_EXPIRED",
            Error::SessionConflict(_) => "SESSION_CONFLICT",
            Error::VersionConflict { .. } => "VERSION_CONFLICT",
            Error::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Error::TokenMalformed => "TOKEN_MALFORMED",
            Error::TokenInvalid => "TOKEN_INVALID",
            Error::NonceReplay => "NONCE_REPLAY",
            Error::TimestampSkew => "TIMESTAMP_SKEW",
            Error::ApiKeyNotFound => "API_KEY_NOT_FOUND",
            Error::ApiKeyDisabled => "API_KEY_DISABLED",
            Error::ApiKeyInvalid => "API_KEY_INVALID",
            Error::PermissionDenied(_) => "PERMISSION_DENIED",
            Error::IpNotAllowed => "IP_NOT_ALLOWED",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::Storage(_) => "STORAGE",
            Error::Internal(_) => "INTERNAL",
            Error::NotLeader => "NOT_LEADER",
            Error::AlreadyRunning => "ALREADY_RUNNING",
            Error::FailedPrecondition(_) => "FAILED_PRECONDITION",
            Error::Unauthenticated(_) => "UNAUTHENTICATED",
        }
    }

    /// Wrap an arbitrary storage failure.
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Error::Storage(err.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::SessionNotFound.code(), "SESSION_NOT_FOUND");
        assert_eq!(
            Error::VersionConflict {
                expected: 1,
                stored: 2
            }
            .code(),
            "VERSION_CONFLICT"
        );
        assert_eq!(Error::NonceReplay.code(), "NONCE_REPLAY");
    }

    #[test]
    fn storage_wraps_source() {
        let err = Error::storage(anyhow::anyhow!("disk on fire"));
        assert_eq!(err.code(), "STORAGE");
        assert!(err.to_string().contains("disk on fire"));
    }
}
