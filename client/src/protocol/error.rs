use thiserror::Error;

/// Failures of the REST half of the protocol client.
///
/// The ConnectionManager only distinguishes two groups: credential errors
/// (drive the login-failure counter) and everything else (go offline, retry).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Local validation failed; nothing was sent
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// Secret, device id, email or password rejected by the server
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("too many devices: {0}")]
    TooManyDevices(String),
    /// DNS, connect or transport failure
    #[error("could not reach Pushover servers: {0}")]
    Unreachable(String),
    /// Body missing, not JSON, or without a status field
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// Refusal with no more specific meaning, including 5xx and 429 replies
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ApiError {
    pub fn is_invalid_credentials(&self) -> bool {
        matches!(self, ApiError::InvalidCredentials(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::MalformedResponse(err.to_string())
        } else {
            ApiError::Unreachable(err.to_string())
        }
    }
}
