//! Error taxonomy for the ingestion and answering engine.
//!
//! Every external collaborator (commit source, embedding provider, language
//! model) reports failures as an [`UpstreamError`]. The public operations
//! return [`LoreError`], which tells the caller *which stage* failed so it can
//! decide between surfacing, retrying, or fixing configuration.

use thiserror::Error;

/// Failure reported by an external HTTP collaborator.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// The service rejected our credentials (HTTP 401).
    #[error("{service} rejected the configured credentials (HTTP 401); refresh the token")]
    AuthExpired { service: &'static str },

    /// Non-success HTTP status other than 401.
    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// Connection, timeout, or body-read failure.
    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The service answered but the payload was not what we expected.
    #[error("{service} response could not be parsed: {reason}")]
    Malformed {
        service: &'static str,
        reason: String,
    },

    /// The provider is switched off in configuration.
    #[error("{service} is disabled in configuration")]
    Disabled { service: &'static str },
}

impl UpstreamError {
    /// Maps a non-success HTTP status to the matching variant.
    pub fn from_status(service: &'static str, status: u16, body: String) -> Self {
        if status == 401 {
            UpstreamError::AuthExpired { service }
        } else {
            UpstreamError::Status {
                service,
                status,
                body,
            }
        }
    }

    pub fn transport(service: &'static str, source: reqwest::Error) -> Self {
        UpstreamError::Transport { service, source }
    }

    pub fn malformed(service: &'static str, reason: impl Into<String>) -> Self {
        UpstreamError::Malformed {
            service,
            reason: reason.into(),
        }
    }

    /// Whether a retry could plausibly succeed (rate limits, 5xx, network).
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Status { status, .. } => *status == 429 || *status >= 500,
            UpstreamError::Transport { .. } => true,
            _ => false,
        }
    }
}

/// Error returned by the public operations (`poll_commits`, `ask_question`)
/// and by the storage traits.
#[derive(Error, Debug)]
pub enum LoreError {
    #[error("project {0} not found")]
    ProjectNotFound(String),

    #[error("project {0} has no repository URL")]
    MissingRepository(String),

    #[error("invalid repository URL '{0}': expected .../<owner>/<repo>")]
    InvalidRepositoryUrl(String),

    #[error("failed to list commits: {0}")]
    CommitListing(#[source] UpstreamError),

    #[error("failed to embed question: {0}")]
    Embedding(#[source] UpstreamError),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for LoreError {
    fn from(err: sqlx::Error) -> Self {
        LoreError::Storage(err.to_string())
    }
}

impl LoreError {
    /// Precondition and input failures: the caller must fix data, not retry.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            LoreError::ProjectNotFound(_)
                | LoreError::MissingRepository(_)
                | LoreError::InvalidRepositoryUrl(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_401_maps_to_auth_expired() {
        let err = UpstreamError::from_status("GitHub", 401, "Bad credentials".into());
        assert!(matches!(err, UpstreamError::AuthExpired { service: "GitHub" }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_statuses() {
        assert!(UpstreamError::from_status("x", 429, String::new()).is_transient());
        assert!(UpstreamError::from_status("x", 503, String::new()).is_transient());
        assert!(!UpstreamError::from_status("x", 404, String::new()).is_transient());
        assert!(!UpstreamError::malformed("x", "bad json").is_transient());
    }

    #[test]
    fn test_caller_errors() {
        assert!(LoreError::MissingRepository("p".into()).is_caller_error());
        assert!(LoreError::InvalidRepositoryUrl("u".into()).is_caller_error());
        assert!(!LoreError::Storage("disk full".into()).is_caller_error());
    }
}
