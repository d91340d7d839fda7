//! Error types for the gateway.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error kinds for categorizing gateway errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    // Configuration errors
    /// Invalid configuration.
    InvalidConfiguration,
    /// Requested storage backend is not implemented.
    UnsupportedStorageBackend,
    /// Authentication service constructed without any strategies.
    NoStrategies,

    // Authentication errors
    /// Credentials were rejected by every attempted strategy.
    BadCredentials,
    /// Credential payload does not match the requested method.
    CredentialMismatch,

    // Token storage errors
    /// Token record failed validation before storage.
    InvalidTokenRecord,
    /// Serializing a token record failed.
    SerializationFailed,
    /// Encrypting a token payload failed.
    EncryptionFailed,
    /// Decrypting a token payload failed.
    DecryptionFailed,

    // Admission and resilience errors
    /// Request rejected by the admission rate limiter.
    RateLimitExceeded,
    /// Circuit breaker is open; the downstream call was not attempted.
    CircuitOpen,
    /// The wrapped action exceeded its timeout.
    Timeout,

    // Downstream transport failures recorded by the breaker
    /// Connection to the remote platform failed.
    ConnectionFailed,
    /// Remote platform is unavailable.
    ServiceUnavailable,
    /// Remote platform returned an internal error.
    InternalError,

    /// Unknown error.
    Unknown,
}

impl fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguration => write!(f, "invalid_configuration"),
            Self::UnsupportedStorageBackend => write!(f, "unsupported_storage_backend"),
            Self::NoStrategies => write!(f, "no_strategies"),
            Self::BadCredentials => write!(f, "bad_credentials"),
            Self::CredentialMismatch => write!(f, "credential_mismatch"),
            Self::InvalidTokenRecord => write!(f, "invalid_token_record"),
            Self::SerializationFailed => write!(f, "serialization_failed"),
            Self::EncryptionFailed => write!(f, "encryption_failed"),
            Self::DecryptionFailed => write!(f, "decryption_failed"),
            Self::RateLimitExceeded => write!(f, "rate_limit_exceeded"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::Timeout => write!(f, "timeout"),
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::ServiceUnavailable => write!(f, "service_unavailable"),
            Self::InternalError => write!(f, "internal_error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Gateway error with contextual information.
#[derive(Error, Debug)]
pub struct GatewayError {
    /// Error kind.
    kind: GatewayErrorKind,
    /// Error message.
    message: String,
    /// HTTP-equivalent status code, where one applies.
    status_code: Option<u16>,
    /// Suggested wait before retrying.
    retry_after: Option<Duration>,
    /// Underlying cause.
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(code) = self.status_code {
            write!(f, " (HTTP {})", code)?;
        }
        Ok(())
    }
}

impl GatewayError {
    /// Creates a new gateway error.
    pub fn new(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            retry_after: None,
            cause: None,
        }
    }

    /// Sets the HTTP-equivalent status code.
    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    /// Sets the retry-after hint.
    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Gets the error kind.
    pub fn kind(&self) -> GatewayErrorKind {
        self.kind
    }

    /// Gets the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Gets the HTTP-equivalent status code.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Gets the retry-after hint.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Returns true if the circuit breaker rejected the call without
    /// invoking the downstream action.
    pub fn is_circuit_open(&self) -> bool {
        self.kind == GatewayErrorKind::CircuitOpen
    }

    /// Returns true if the wrapped action timed out.
    pub fn is_timeout(&self) -> bool {
        self.kind == GatewayErrorKind::Timeout
    }

    /// Returns true if the admission rate limiter rejected the request.
    pub fn is_rate_limited(&self) -> bool {
        self.kind == GatewayErrorKind::RateLimitExceeded
    }

    /// Returns true if this error is retryable. Circuit-open rejections are
    /// deliberately not retryable so callers do not cause retry storms.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            GatewayErrorKind::Timeout
                | GatewayErrorKind::ConnectionFailed
                | GatewayErrorKind::ServiceUnavailable
                | GatewayErrorKind::InternalError
        )
    }

    // Convenience constructors

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::InvalidConfiguration, message)
    }

    /// Creates an unsupported storage backend error.
    pub fn unsupported_backend(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::UnsupportedStorageBackend, message)
    }

    /// Creates an authentication failure error.
    pub fn bad_credentials(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::BadCredentials, message).with_status(401)
    }

    /// Creates a rate limit rejection carrying the standard 429 status.
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::new(
            GatewayErrorKind::RateLimitExceeded,
            "Too many requests for this identity",
        )
        .with_status(429)
        .with_retry_after(retry_after)
    }

    /// Creates a circuit-open rejection.
    pub fn circuit_open() -> Self {
        Self::new(
            GatewayErrorKind::CircuitOpen,
            "Circuit breaker is open; request not attempted",
        )
        .with_status(503)
    }

    /// Creates a timeout error.
    pub fn timeout(elapsed: Duration) -> Self {
        Self::new(
            GatewayErrorKind::Timeout,
            format!("Action exceeded timeout of {:?}", elapsed),
        )
    }

    /// Creates an encryption failure error.
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::EncryptionFailed, message)
    }

    /// Creates a decryption failure error.
    pub fn decryption(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::DecryptionFailed, message)
    }

    /// Creates a serialization failure error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(GatewayErrorKind::SerializationFailed, message)
    }
}
