//! Error types for Rulegate Core
//!
//! Library-level failures (configuration, registration, storage) are
//! `thiserror` enums. Per-request pipeline outcomes are not errors: they are
//! structured values (`RouteError`, `ErrorKind`) carried on the response.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Rulegate operations
pub type Result<T> = std::result::Result<T, RulegateError>;

/// Main error type for Rulegate operations
#[derive(Error, Debug)]
pub enum RulegateError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Policy store errors
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyStoreError),

    /// Handler registration errors
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// Audit sink errors
    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML decoding errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database errors outside the audit path
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<RulegateError>,
    },
}

/// Errors raised while registering capability handlers at startup
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Handler already registered: {0}")]
    DuplicateHandler(String),

    #[error("Handler id must not be blank")]
    BlankHandlerId,

    #[error("Handler {0} declares no actions")]
    NoDeclaredActions(String),

    #[error("Handler {handler_id} declares a blank action name")]
    BlankAction { handler_id: String },

    #[error("Handler {handler_id} declares action {action} more than once")]
    DuplicateAction { handler_id: String, action: String },
}

/// Errors from an audit sink. Never surfaced to pipeline callers.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("Audit write failed: {0}")]
    WriteFailed(String),

    #[error("Audit query failed: {0}")]
    QueryFailed(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from a policy store lookup
#[derive(Error, Debug, Clone)]
pub enum PolicyStoreError {
    #[error("Policy store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt policy document for subject {subject_id}: {reason}")]
    Corrupt { subject_id: String, reason: String },
}

/// Wire-level error taxonomy reported to the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Handler missing or registered as FAILED
    HandlerUnavailable,
    /// Action not in the handler's declared set
    UnsupportedAction,
    /// Handler exceeded its time budget
    HandlerTimeout,
    /// Handler returned an error or panicked
    HandlerExecutionError,
    /// No handler declares the requested capability
    CapabilityNotFound,
    /// Bias above the configured maximum
    QualityHardFail,
    /// Result violates a compiled rule
    PolicyViolation,
    /// Policy store lookup failed
    PolicyLoadFailure,
    /// Unexpected pipeline failure
    Internal,
}

impl ErrorKind {
    /// Whether this kind represents a deliberate block rather than a fault
    pub fn is_block(&self) -> bool {
        matches!(self, ErrorKind::QualityHardFail | ErrorKind::PolicyViolation)
    }

    /// Stable string form used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::HandlerUnavailable => "HandlerUnavailable",
            ErrorKind::UnsupportedAction => "UnsupportedAction",
            ErrorKind::HandlerTimeout => "HandlerTimeout",
            ErrorKind::HandlerExecutionError => "HandlerExecutionError",
            ErrorKind::CapabilityNotFound => "CapabilityNotFound",
            ErrorKind::QualityHardFail => "QualityHardFail",
            ErrorKind::PolicyViolation => "PolicyViolation",
            ErrorKind::PolicyLoadFailure => "PolicyLoadFailure",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RulegateError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<RulegateError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context() {
        let err = RegistrationError::DuplicateHandler("codegen".to_string());
        let err = RulegateError::from(err);
        let err = err.context("Failed to build registry");

        assert!(err.to_string().contains("Failed to build registry"));
        assert!(err.to_string().contains("codegen"));
    }

    #[test]
    fn test_result_ext() {
        let result: std::result::Result<(), RegistrationError> =
            Err(RegistrationError::BlankHandlerId);
        let result = result.context("Startup failed");

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Startup failed"));
    }

    #[test]
    fn test_error_kind_wire_names() {
        assert_eq!(ErrorKind::HandlerTimeout.to_string(), "HandlerTimeout");
        let json = serde_json::to_string(&ErrorKind::PolicyViolation).unwrap();
        assert_eq!(json, "\"PolicyViolation\"");
        assert!(ErrorKind::QualityHardFail.is_block());
        assert!(!ErrorKind::HandlerUnavailable.is_block());
    }
}
