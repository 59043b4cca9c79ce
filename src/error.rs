//! Error types for the dashboard session layer
//!
//! Every failure in this crate is a [`SessionError`]. Transport failures are
//! recovered by the reconnect loop and only reach command issuers as a
//! "not delivered" signal. The structured [`ErrorCode`] taxonomy feeds the
//! fields emitted by [`ErrorReporter`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Error types for session, protocol and configuration operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// Connection attempt failed or the socket went away
    #[error("Connection error: {0}")]
    Connection(String),

    /// Send attempted while the session is not open
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Low-level WebSocket failures
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// JSON encoding/decoding errors
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Inbound frame that does not match any known message shape
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token/cookie resolution errors
    #[error("Credential error: {0}")]
    Credentials(String),

    /// Invalid input errors (bad target keys, out-of-range positions)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The session actor has stopped
    #[error("Session closed: {0}")]
    Closed(String),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Generic errors
    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Structured error code for machine-readable error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Connection errors (1000-1099)
    ConnectionRefused,
    ConnectionLost,
    NotConnected,
    SessionClosed,

    // Authentication errors (1100-1199)
    InvalidCredentials,

    // Configuration errors (1200-1299)
    ConfigurationInvalid,

    // Data errors (1400-1499)
    ParsingFailed,
    InvalidInput,

    // Protocol errors (1700-1799)
    MessageMalformed,

    // Internal errors (1900-1999)
    InternalError,
}

impl ErrorCode {
    /// Get numeric error code
    pub fn as_number(&self) -> u32 {
        match self {
            ErrorCode::ConnectionRefused => 1002,
            ErrorCode::ConnectionLost => 1003,
            ErrorCode::NotConnected => 1005,
            ErrorCode::SessionClosed => 1006,

            ErrorCode::InvalidCredentials => 1101,

            ErrorCode::ConfigurationInvalid => 1202,

            ErrorCode::ParsingFailed => 1401,
            ErrorCode::InvalidInput => 1402,

            ErrorCode::MessageMalformed => 1703,

            ErrorCode::InternalError => 1901,
        }
    }

    /// Get error category
    pub fn category(&self) -> &'static str {
        match self.as_number() {
            1000..=1099 => "connection",
            1100..=1199 => "authentication",
            1200..=1299 => "configuration",
            1400..=1499 => "data",
            1700..=1799 => "protocol",
            1900..=1999 => "internal",
            _ => "unknown",
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Expected condition, healed silently
    Info,
    /// Recoverable, worth a log line
    Warning,
    /// Caller-visible failure
    Error,
}

impl SessionError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a not-connected error
    pub fn not_connected<S: Into<String>>(msg: S) -> Self {
        Self::NotConnected(msg.into())
    }

    /// Create a malformed message error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedMessage(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a credentials error
    pub fn credentials<S: Into<String>>(msg: S) -> Self {
        Self::Credentials(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a session-closed error
    pub fn closed<S: Into<String>>(msg: S) -> Self {
        Self::Closed(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Generic(anyhow::anyhow!(msg.into()))
    }

    /// Map the error to its structured code
    pub fn to_error_code(&self) -> ErrorCode {
        match self {
            SessionError::Connection(_) => ErrorCode::ConnectionRefused,
            SessionError::WebSocket(_) => ErrorCode::ConnectionLost,
            SessionError::NotConnected(_) => ErrorCode::NotConnected,
            SessionError::Closed(_) => ErrorCode::SessionClosed,
            SessionError::Credentials(_) => ErrorCode::InvalidCredentials,
            SessionError::Config(_) | SessionError::Url(_) => ErrorCode::ConfigurationInvalid,
            SessionError::Json(_) => ErrorCode::ParsingFailed,
            SessionError::MalformedMessage(_) => ErrorCode::MessageMalformed,
            SessionError::InvalidInput(_) => ErrorCode::InvalidInput,
            SessionError::Io(_) | SessionError::Generic(_) => ErrorCode::InternalError,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            SessionError::NotConnected(_) => ErrorSeverity::Info,
            SessionError::Connection(_)
            | SessionError::WebSocket(_)
            | SessionError::MalformedMessage(_)
            | SessionError::Json(_) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    /// Whether the reconnect loop is expected to heal this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Connection(_)
                | SessionError::WebSocket(_)
                | SessionError::NotConnected(_)
        )
    }
}

/// Error logging utilities
pub struct ErrorReporter;

impl ErrorReporter {
    /// Log an error with structured fields at a level matching its severity
    pub fn log_error(error: &SessionError, component: &str, operation: &str) {
        let code = error.to_error_code();

        match error.severity() {
            ErrorSeverity::Error => {
                tracing::error!(
                    error_code = code.as_number(),
                    category = code.category(),
                    component = component,
                    operation = operation,
                    "Error occurred: {}",
                    error
                );
            }
            ErrorSeverity::Warning => {
                tracing::warn!(
                    error_code = code.as_number(),
                    category = code.category(),
                    component = component,
                    operation = operation,
                    "Warning: {}",
                    error
                );
            }
            ErrorSeverity::Info => {
                tracing::info!(
                    error_code = code.as_number(),
                    category = code.category(),
                    component = component,
                    operation = operation,
                    "Info: {}",
                    error
                );
            }
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::WebSocket(err.to_string())
    }
}

impl From<toml::de::Error> for SessionError {
    fn from(err: toml::de::Error) -> Self {
        SessionError::Config(format!("Invalid configuration file: {err}"))
    }
}
