use serde::{Deserialize, Serialize};

/// Errors surfaced by every dloop crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum DloopError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("remote: HTTP {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type DloopResult<T> = Result<T, DloopError>;

impl DloopError {
    pub fn not_found(msg: impl Into<String>) -> Self { Self::NotFound(msg.into()) }
    pub fn validation(msg: impl Into<String>) -> Self { Self::Validation(msg.into()) }
    pub fn conflict(msg: impl Into<String>) -> Self { Self::Conflict(msg.into()) }
    pub fn internal(msg: impl Into<String>) -> Self { Self::Internal(msg.into()) }

    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        Self::Remote { status, message: message.into() }
    }

    /// True for local "not found" and for remote 404 responses.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Remote { status: 404, .. })
    }
}

impl From<serde_json::Error> for DloopError {
    fn from(e: serde_json::Error) -> Self {
        // Syntax/EOF errors mean the bytes were not JSON; data errors mean the shape was wrong.
        if e.is_data() {
            Self::Validation(e.to_string())
        } else {
            Self::Parse(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_split_into_parse_and_validation() {
        let syntax = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        assert!(matches!(DloopError::from(syntax), DloopError::Parse(_)));

        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Needs { name: String }
        let shape = serde_json::from_str::<Needs>("{}").unwrap_err();
        assert!(matches!(DloopError::from(shape), DloopError::Validation(_)));
    }

    #[test]
    fn remote_404_counts_as_not_found() {
        assert!(DloopError::remote(404, "gone").is_not_found());
        assert!(!DloopError::remote(500, "boom").is_not_found());
        assert_eq!(DloopError::remote(503, "down").to_string(), "remote: HTTP 503: down");
    }
}
