use thiserror::Error;

/// Unified error type for the engine.
///
/// Every variant maps to a stable API code and HTTP status; handlers
/// normalize into the JSON envelope without inspecting error strings.
#[derive(Debug, Error)]
pub enum Error {
    /// A user-scoped row does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing resource, e.g. "article 42".
        what: String,
    },

    /// Shape or domain-rule violation in caller input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    /// Unique-constraint violation, e.g. duplicate source URL for a user.
    #[error("conflict: {0}")]
    Conflict(String),

    /// One of the per-user caps would be violated.
    #[error("quota exceeded: {which}")]
    QuotaExceeded {
        /// Which quota: "feeds", "articles", "storage", "ai_tokens".
        which: &'static str,
    },

    /// Translation/AI upstream could not be reached (network-level).
    #[error("provider unreachable: {0}")]
    ProviderUnreachable(String),

    /// Translation/AI upstream rejected the request (4xx).
    #[error("provider rejected request: {0}")]
    ProviderRejected(String),

    /// No known response format matched the provider's reply.
    #[error("provider response format unknown: {0}")]
    ProviderFormatUnknown(String),

    /// The internal rate limiter refused within the configured wait budget.
    #[error("rate limited")]
    RateLimited,

    /// Unexpected storage engine error.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Everything else.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    /// Stable machine-readable code used in the API envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NOT_FOUND",
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::Unauthorized => "UNAUTHORIZED",
            Error::Forbidden => "FORBIDDEN",
            Error::Conflict(_) => "CONFLICT",
            Error::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Error::ProviderUnreachable(_) => "PROVIDER_UNREACHABLE",
            Error::ProviderRejected(_) => "PROVIDER_REJECTED",
            Error::ProviderFormatUnknown(_) => "PROVIDER_REJECTED",
            Error::RateLimited => "RATE_LIMITED",
            Error::Db(_) => "DB_ERROR",
            Error::Internal(_) => "INTERNAL",
        }
    }

    /// Detail string safe to show to end users.
    pub fn detail(&self) -> Option<String> {
        match self {
            Error::QuotaExceeded { which } => Some((*which).to_string()),
            Error::NotFound { what } => Some(what.clone()),
            Error::Conflict(msg) | Error::InvalidInput(msg) => Some(msg.clone()),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::not_found("x").code(), "NOT_FOUND");
        assert_eq!(Error::QuotaExceeded { which: "feeds" }.code(), "QUOTA_EXCEEDED");
        assert_eq!(
            Error::QuotaExceeded { which: "feeds" }.detail().as_deref(),
            Some("feeds")
        );
        assert_eq!(Error::RateLimited.code(), "RATE_LIMITED");
    }
}
