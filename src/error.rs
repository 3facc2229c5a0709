//! Error types for the channel forwarder.

use std::fmt;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Chat transport errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to fetch message on channel {name}: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Rate limited on channel {name}")]
    RateLimited { name: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// A single rule invariant violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("rule name must not be empty")]
    EmptyRuleName,

    #[error("an enabled rule needs at least one target channel")]
    EmptyTargets,

    #[error("target channel {0} is listed more than once")]
    DuplicateTarget(i64),

    #[error("{field} has an empty find text")]
    EmptyFindText { field: String },

    #[error("invalid regex in {field}: {reason}")]
    InvalidPattern { field: String, reason: String },

    #[error("minimum length {min} exceeds maximum length {max}")]
    LengthBounds { min: usize, max: usize },

    #[error("unknown message kind: {0}")]
    UnknownMessageKind(String),
}

/// Every violation found while validating a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, error: ValidationError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    /// `Ok(value)` when no violation was collected.
    pub fn into_result<T>(self, value: T) -> Result<T, Self> {
        if self.0.is_empty() { Ok(value) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationError> for ValidationErrors {
    fn from(error: ValidationError) -> Self {
        Self(vec![error])
    }
}

/// Rule management errors.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Rule validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Rule {0} already exists")]
    DuplicateName(String),

    #[error("Rule {0} not found")]
    NotFound(String),

    #[error("Rule name in body ({body}) does not match path ({path})")]
    NameMismatch { path: String, body: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors that fail a whole forwarding request.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Message {message_id} not found in channel {channel_id}")]
    MessageNotFound { channel_id: i64, message_id: i64 },

    #[error("Message fetch failed: {0}")]
    Fetch(#[from] ChannelError),

    #[error("Rule lookup failed: {0}")]
    Store(#[from] RuleError),

    #[error("Forwarding cancelled")]
    Cancelled,
}

impl ForwardError {
    /// Whether a job scheduler should try again later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Store(RuleError::Database(_)))
    }
}

/// Work queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job queue is closed")]
    Closed,

    #[error("Job queue is full")]
    Full,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_display_joins_all() {
        let mut errors = ValidationErrors::new();
        errors.push(ValidationError::EmptyRuleName);
        errors.push(ValidationError::DuplicateTarget(7));
        let text = errors.to_string();
        assert!(text.contains("rule name must not be empty"));
        assert!(text.contains("target channel 7"));
    }

    #[test]
    fn into_result_ok_when_empty() {
        assert_eq!(ValidationErrors::new().into_result(5), Ok(5));
        let err = ValidationErrors::from(ValidationError::EmptyTargets).into_result(5);
        assert!(err.is_err());
    }

    #[test]
    fn transient_classification() {
        let fetch = ForwardError::Fetch(ChannelError::Http("timeout".into()));
        assert!(fetch.is_transient());
        let missing = ForwardError::MessageNotFound {
            channel_id: 1,
            message_id: 2,
        };
        assert!(!missing.is_transient());
        assert!(!ForwardError::Cancelled.is_transient());
    }
}
