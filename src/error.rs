// Error handling module
// Defines the gateway error taxonomy and the shareable refresh/CSRF failures

use thiserror::Error;

/// Failure of a session refresh
///
/// Cloneable so that every caller waiting on the same in-flight refresh
/// receives the identical cause.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    /// The refresh call never produced a response
    #[error("refresh request failed: {0}")]
    Transport(String),

    /// The server answered the refresh call with a non-2xx status
    #[error("refresh rejected: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Embedded runtime: the response did not carry an access token
    #[error("refresh response does not contain accessToken")]
    MissingAccessToken,

    /// Embedded runtime: nothing to exchange
    #[error("no refresh token stored")]
    MissingRefreshToken,

    /// Rotated credentials could not be written
    #[error("failed to persist refreshed credentials: {0}")]
    Storage(String),
}

/// Failure of a CSRF token bootstrap
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CsrfError {
    #[error("CSRF bootstrap request failed: {0}")]
    Transport(String),

    #[error("CSRF bootstrap rejected: {status} - {message}")]
    Rejected { status: u16, message: String },

    #[error("CSRF bootstrap response does not contain a token")]
    MissingToken,
}

/// Errors surfaced by [`crate::gateway::ApiGateway`]
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No response reached us; never retried by the gateway
    #[error("Transport error: {0}")]
    Transport(String),

    /// Any non-2xx response the gateway has no opinion on
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Authentication expired and the refresh failed
    #[error("Session terminated after {status}: {cause}")]
    SessionTerminated { status: u16, cause: RefreshError },

    /// Mutating request rejected as a CSRF failure even after a re-bootstrap
    #[error("CSRF token rejected: {status} - {message}")]
    CsrfRejected { status: u16, message: String },

    /// The CSRF token could not be obtained
    #[error("CSRF error: {0}")]
    Csrf(#[from] CsrfError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage or other internal failure
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// HTTP status attached to the error, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Api { status, .. }
            | GatewayError::SessionTerminated { status, .. }
            | GatewayError::CsrfRejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the session is gone and the user must sign in again
    pub fn is_session_terminated(&self) -> bool {
        matches!(self, GatewayError::SessionTerminated { .. })
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
