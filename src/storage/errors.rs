//! Storage collaborator errors

use thiserror::Error;

/// Errors reported by a [`DocumentStore`](super::DocumentStore)
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("invalid document JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid collection name '{0}'")]
    InvalidCollectionName(String),

    #[error("document for '{0}' is not a JSON object")]
    NotAnObject(String),

    /// An error raised from inside a query through `aero_raise`
    #[error("{code}: {message}")]
    Raised { code: String, message: String },

    /// The engine refused the statement because of a size or depth limit
    #[error("engine limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("connection lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// True for engine limits that a slower tier can work around
    pub fn is_limit(&self) -> bool {
        matches!(self, StoreError::LimitExceeded(_))
    }
}

/// Prefix of every code raised through `aero_raise`
pub(crate) const RAISED_CODE_PREFIX: &str = "AERO_";

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &err {
            let message = message.as_deref().unwrap_or_default();

            if let Some(start) = message.find(RAISED_CODE_PREFIX) {
                if let Some((code, text)) = message[start..].split_once(": ") {
                    return StoreError::Raised {
                        code: code.to_string(),
                        message: text.to_string(),
                    };
                }
            }

            let lowered = message.to_ascii_lowercase();
            if failure.code == rusqlite::ErrorCode::TooBig
                || lowered.contains("too many")
                || lowered.contains("too large")
                || lowered.contains("too deep")
                || lowered.contains("integer overflow")
            {
                return StoreError::LimitExceeded(message.to_string());
            }
        }
        StoreError::Sqlite(err)
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(message: &str) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(1),
            Some(message.to_string()),
        )
    }

    #[test]
    fn test_raised_message_is_parsed() {
        let err = StoreError::from(failure("AERO_EXPR_TYPE_MISMATCH: $add: non-numeric operand"));
        match err {
            StoreError::Raised { code, message } => {
                assert_eq!(code, "AERO_EXPR_TYPE_MISMATCH");
                assert_eq!(message, "$add: non-numeric operand");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_limit_is_classified() {
        let err = StoreError::from(failure("Expression tree is too large (maximum depth 1000)"));
        assert!(err.is_limit());

        let err = StoreError::from(failure("integer overflow"));
        assert!(err.is_limit());

        let err = StoreError::from(failure("no such table: missing"));
        assert!(!err.is_limit());
    }
}
