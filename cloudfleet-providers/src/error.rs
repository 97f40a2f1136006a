use thiserror::Error;

pub const CODE_INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";
pub const CODE_REQUEST_EXPIRED: &str = "RequestExpired";
pub const CODE_AUTH_FAILURE: &str = "AuthFailure";
pub const CODE_THROTTLED: &str = "RequestLimitExceeded";

/// Coarse classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected to clear up on retry.
    Transient,
    /// The resource is gone.
    NotFound,
    /// Retrying will not help.
    Fatal,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The instance is not visible (yet, or anymore).
    #[error("instance `{0}` not found")]
    InstanceNotFound(String),
    /// Request signature expired or the clock is skewed; the session must be rebuilt.
    #[error("request expired: {0}")]
    RequestExpired(String),
    #[error("authentication failed: {0}")]
    Unauthorized(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider error {code}: {message}")]
    Api { code: String, message: String },
}

impl ProviderError {
    /// Map a provider error code onto a typed error.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            CODE_INSTANCE_NOT_FOUND => ProviderError::InstanceNotFound(message),
            CODE_REQUEST_EXPIRED => ProviderError::RequestExpired(message),
            CODE_AUTH_FAILURE | "UnauthorizedOperation" => ProviderError::Unauthorized(message),
            CODE_THROTTLED | "Throttling" => ProviderError::Throttled(message),
            c if c.starts_with("InvalidParameter") || c.starts_with("MissingParameter") => {
                ProviderError::InvalidRequest(message)
            }
            _ => ProviderError::Api {
                code: code.to_string(),
                message,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::InstanceNotFound(_) => ErrorKind::NotFound,
            ProviderError::RequestExpired(_)
            | ProviderError::Throttled(_)
            | ProviderError::Transport(_) => ErrorKind::Transient,
            ProviderError::Unauthorized(_)
            | ProviderError::InvalidRequest(_)
            | ProviderError::Api { .. } => ErrorKind::Fatal,
        }
    }

    /// The two eventual-consistency conditions the describe path retries on.
    pub fn is_eventually_consistent(&self) -> bool {
        matches!(
            self,
            ProviderError::InstanceNotFound(_) | ProviderError::RequestExpired(_)
        )
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, ProviderError::RequestExpired(_))
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}
