//! Crate-wide structured error type.
//!
//! `anyhow` is used everywhere internally (teacher convention); at the one
//! boundary that must map to a transport status code — the RPC layer — we
//! need a closed set of kinds, so `ErrorKind`/`AppError` sit there, the same
//! way `client-vault-rs`'s `VaultError` sits at the vault's one boundary.

use thiserror::Error;

/// The eight error kinds named by spec.md §7. Distinguished by *kind*, not
/// by Rust type — callers that need detail match `AppError::kind()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Auth,
    RateLimited,
    UpstreamUnavailable,
    NotFound,
    Conflict,
    Integrity,
    Internal,
}

impl ErrorKind {
    /// Transport status code per spec.md §4.9 / §7.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::InvalidInput => 400,
            ErrorKind::Auth => 401,
            ErrorKind::RateLimited => 429,
            ErrorKind::UpstreamUnavailable => 502,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Integrity => 409,
            ErrorKind::Internal => 500,
        }
    }
}

/// The error returned across the RPC boundary. `message` is a free-text
/// string that may carry venue-supplied text (spec.md §7); it still passes
/// through the Redactor before being logged or returned, because free text
/// can accidentally embed a structured-looking fragment.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::internal(e.to_string()).with_source(e)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec() {
        assert_eq!(ErrorKind::InvalidInput.status_code(), 400);
        assert_eq!(ErrorKind::RateLimited.status_code(), 429);
        assert_eq!(ErrorKind::Internal.status_code(), 500);
    }

    #[test]
    fn wraps_anyhow_as_internal() {
        let e: AppError = anyhow::anyhow!("boom").into();
        assert_eq!(e.kind, ErrorKind::Internal);
    }
}
