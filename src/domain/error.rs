use std::fmt;

use thiserror::Error;

/// Status of the last cache operation, as reported by a backend or the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResultCode {
    #[default]
    Success,
    /// Key exists on add, or missing on replace
    NotStored,
    NotFound,
    /// Concurrency token no longer matches the stored entry
    Exists,
    /// Value type not accepted by the operation
    Rejected,
    /// No server is configured for the key
    NoServers,
    /// Any other backend failure
    Failure,
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success)
    }

    /// Human readable description of the code
    pub fn message(&self) -> &'static str {
        match self {
            ResultCode::Success => "SUCCESS",
            ResultCode::NotStored => "NOT STORED",
            ResultCode::NotFound => "NOT FOUND",
            ResultCode::Exists => "CONNECTION DATA EXISTS",
            ResultCode::Rejected => "INVALID ARGUMENTS",
            ResultCode::NoServers => "NO SERVERS DEFINED",
            ResultCode::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Cache operation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    #[error("Not stored: {message}")]
    NotStored { message: String },

    #[error("Not found: {key}")]
    NotFound { key: String },

    #[error("Concurrency token mismatch for key '{key}'")]
    Exists { key: String },

    #[error("Rejected: {message}")]
    Rejected { message: String },

    #[error("Backend failure: {message}")]
    BackendFailure { message: String },

    #[error("Partial batch: {} key(s) failed", failed.len())]
    PartialBatch { failed: Vec<String> },

    #[error("No servers available")]
    NoServers,

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl CacheError {
    pub fn not_stored(message: impl Into<String>) -> Self {
        Self::NotStored {
            message: message.into(),
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self::Exists { key: key.into() }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::BackendFailure {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// The status code a caller observes for this error
    pub fn code(&self) -> ResultCode {
        match self {
            CacheError::NotStored { .. } => ResultCode::NotStored,
            CacheError::NotFound { .. } => ResultCode::NotFound,
            CacheError::Exists { .. } => ResultCode::Exists,
            CacheError::Rejected { .. } => ResultCode::Rejected,
            CacheError::NoServers => ResultCode::NoServers,
            CacheError::BackendFailure { .. }
            | CacheError::PartialBatch { .. }
            | CacheError::Configuration { .. } => ResultCode::Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_stored_error() {
        let error = CacheError::not_stored("key 'a' already exists");
        assert_eq!(error.to_string(), "Not stored: key 'a' already exists");
        assert_eq!(error.code(), ResultCode::NotStored);
    }

    #[test]
    fn test_partial_batch_error() {
        let error = CacheError::PartialBatch {
            failed: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(error.to_string(), "Partial batch: 2 key(s) failed");
        assert_eq!(error.code(), ResultCode::Failure);
    }

    #[test]
    fn test_result_code_messages() {
        assert!(ResultCode::Success.is_success());
        assert!(!ResultCode::NotFound.is_success());
        assert_eq!(ResultCode::NotFound.to_string(), "NOT FOUND");
        assert_eq!(ResultCode::default(), ResultCode::Success);
    }
}
