use reqwest::StatusCode;
use std::fmt;
use thiserror::Error;

/// Classified reason a portal call failed. Drives the retry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCause {
    /// Credentials refused at login. Never retried.
    AuthRejected,
    /// Token went stale or was refused on a data call.
    TransientAuthExpired,
    RateLimited,
    NetworkTimeout,
    /// 5xx from the portal.
    PortalUnavailable,
    /// Application-level refusal for this day, e.g. no data for the station.
    PortalRejectedData,
    MalformedResponse,
}

impl FailureCause {
    pub fn is_auth_related(&self) -> bool {
        matches!(self, FailureCause::TransientAuthExpired)
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureCause::AuthRejected => "auth-rejected",
            FailureCause::TransientAuthExpired => "auth-expired",
            FailureCause::RateLimited => "rate-limited",
            FailureCause::NetworkTimeout => "network",
            FailureCause::PortalUnavailable => "portal-unavailable",
            FailureCause::PortalRejectedData => "portal-rejected",
            FailureCause::MalformedResponse => "malformed-response",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("Portal rejected the credentials for account '{account}': {message}")]
    AuthRejected { account: String, message: String },

    #[error("Session token was refused by {url}: {reason}")]
    AuthExpired { url: String, reason: String },

    #[error("Rate limited by {url}")]
    RateLimited { url: String },

    #[error("Network request failed for {0}")]
    NetworkRequest(String, #[source] reqwest::Error),

    #[error("HTTP request failed for {url} with status {status}")]
    HttpStatus { url: String, status: StatusCode },

    #[error("Portal rejected the request (code {code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Malformed response from {url}: {message}")]
    Malformed { url: String, message: String },

    #[error("Failed to build HTTP client")]
    ClientBuild(#[source] reqwest::Error),
}

impl PortalError {
    pub fn cause(&self) -> FailureCause {
        match self {
            PortalError::AuthRejected { .. } => FailureCause::AuthRejected,
            PortalError::AuthExpired { .. } => FailureCause::TransientAuthExpired,
            PortalError::RateLimited { .. } => FailureCause::RateLimited,
            PortalError::NetworkRequest(_, _) => FailureCause::NetworkTimeout,
            PortalError::HttpStatus { status, .. } => match *status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    FailureCause::TransientAuthExpired
                }
                StatusCode::TOO_MANY_REQUESTS => FailureCause::RateLimited,
                StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                    FailureCause::NetworkTimeout
                }
                s if s.is_server_error() => FailureCause::PortalUnavailable,
                _ => FailureCause::PortalRejectedData,
            },
            PortalError::Rejected { .. } => FailureCause::PortalRejectedData,
            PortalError::Malformed { .. } => FailureCause::MalformedResponse,
            PortalError::ClientBuild(_) => FailureCause::MalformedResponse,
        }
    }
}
