use serde::{Deserialize, Serialize};

/// Failure categories surfaced by the data layer.
///
/// Errors are `Clone` because a single in-flight fetch is shared by every
/// requester attached to it.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum LiftError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl LiftError {
    pub fn network(detail: impl ToString) -> Self {
        Self::Network(detail.to_string())
    }

    pub fn storage(detail: impl ToString) -> Self {
        Self::Storage(detail.to_string())
    }

    pub fn unknown(detail: impl ToString) -> Self {
        Self::Unknown(detail.to_string())
    }

    /// Whether a query may retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server(_))
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Short text suitable for a non-blocking error indicator.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network(_) => "You appear to be offline. Showing saved data.".to_string(),
            Self::Auth(_) => "Your session has expired. Please sign in again.".to_string(),
            Self::Validation(detail) => detail.clone(),
            Self::Server(_) => "Something went wrong on our side. Try again shortly.".to_string(),
            Self::Storage(_) | Self::Unknown(_) => "Something went wrong.".to_string(),
        }
    }
}

impl From<serde_json::Error> for LiftError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unknown(format!("payload decode failed: {err}"))
    }
}

impl From<std::io::Error> for LiftError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

pub type LiftResult<T> = Result<T, LiftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_and_server_are_transient() {
        assert!(LiftError::network("timeout").is_transient());
        assert!(LiftError::Server("502".into()).is_transient());
        assert!(!LiftError::Auth("expired".into()).is_transient());
        assert!(!LiftError::Validation("bad otp".into()).is_transient());
        assert!(!LiftError::unknown("?").is_transient());
    }

    #[test]
    fn validation_message_is_shown_verbatim() {
        let err = LiftError::Validation("Username already taken".into());
        assert_eq!(err.user_message(), "Username already taken");
    }
}
