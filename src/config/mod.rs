//! Configuration types for the gateway.

use crate::auth::AuthMethod;
use crate::errors::GatewayError;
use secrecy::SecretString;
use std::time::Duration;

/// Default interval between periodic token cleanup sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Default maximum requests per identity per window.
pub const DEFAULT_RATE_LIMIT_MAX: u32 = 100;

/// Default rate limit window.
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Default per-call timeout enforced by the circuit breaker.
pub const DEFAULT_BREAKER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default failure percentage at which the circuit opens.
pub const DEFAULT_ERROR_THRESHOLD_PERCENTAGE: u8 = 50;

/// Default time the circuit stays open before allowing a probe.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(30);

/// Default minimum calls in the rolling window before the error rate counts.
pub const DEFAULT_VOLUME_THRESHOLD: u32 = 5;

/// Default span of the rolling statistics window.
pub const DEFAULT_ROLLING_COUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of buckets the rolling window is divided into.
pub const DEFAULT_ROLLING_COUNT_BUCKETS: u32 = 10;

/// Storage backend selection for the token store.
///
/// Only the in-memory backend is implemented; the file and database variants
/// are explicit extension points that fail fast at construction time instead
/// of silently degrading to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    /// In-memory storage (implemented).
    Memory,
    /// File-backed storage (not yet implemented).
    File,
    /// Database-backed storage (not yet implemented).
    Database,
}

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Enabled methods in fallback order.
    pub priority: Vec<AuthMethod>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            priority: vec![
                AuthMethod::OAuth2,
                AuthMethod::Bearer,
                AuthMethod::ApiKey,
                AuthMethod::Basic,
            ],
        }
    }
}

/// Token store configuration.
#[derive(Debug, Clone)]
pub struct TokenStoreConfig {
    /// Storage backend selection.
    pub storage: StorageType,
    /// Encrypt token payloads at rest.
    pub encrypt_tokens: bool,
    /// Key material for at-rest encryption; required when `encrypt_tokens`.
    pub encryption_key: Option<SecretString>,
    /// Interval between periodic cleanup sweeps.
    pub cleanup_interval: Duration,
}

impl Default for TokenStoreConfig {
    fn default() -> Self {
        Self {
            storage: StorageType::Memory,
            encrypt_tokens: false,
            encryption_key: None,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// Admission rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum requests per identity within one window.
    pub max: u32,
    /// Fixed window length.
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max: DEFAULT_RATE_LIMIT_MAX,
            window: DEFAULT_RATE_LIMIT_WINDOW,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Per-call timeout; exceeding it counts as a failure.
    pub timeout: Duration,
    /// Failure percentage at which the circuit opens (1-100).
    pub error_threshold_percentage: u8,
    /// Time spent open before transitioning to half-open.
    pub reset_timeout: Duration,
    /// Minimum observed calls in the window before the error rate applies.
    pub volume_threshold: u32,
    /// Span of the rolling statistics window.
    pub rolling_count_timeout: Duration,
    /// Number of buckets in the rolling window.
    pub rolling_count_buckets: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_BREAKER_TIMEOUT,
            error_threshold_percentage: DEFAULT_ERROR_THRESHOLD_PERCENTAGE,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            rolling_count_timeout: DEFAULT_ROLLING_COUNT_TIMEOUT,
            rolling_count_buckets: DEFAULT_ROLLING_COUNT_BUCKETS,
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// Token store configuration.
    pub token_store: TokenStoreConfig,
    /// Admission rate limiter configuration.
    pub rate_limit: RateLimiterConfig,
    /// Circuit breaker configuration.
    pub circuit_breaker: BreakerConfig,
}

impl GatewayConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::new()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.auth.priority.is_empty() {
            return Err(GatewayError::configuration(
                "Authentication priority order cannot be empty",
            ));
        }

        if self.token_store.encrypt_tokens && self.token_store.encryption_key.is_none() {
            return Err(GatewayError::configuration(
                "Token encryption is enabled but no encryption key is configured",
            ));
        }

        if self.token_store.cleanup_interval.is_zero() {
            return Err(GatewayError::configuration(
                "Token cleanup interval must be non-zero",
            ));
        }

        if self.rate_limit.max == 0 {
            return Err(GatewayError::configuration(
                "Rate limit max must be at least 1",
            ));
        }

        if self.rate_limit.window.is_zero() {
            return Err(GatewayError::configuration(
                "Rate limit window must be non-zero",
            ));
        }

        let pct = self.circuit_breaker.error_threshold_percentage;
        if pct == 0 || pct > 100 {
            return Err(GatewayError::configuration(
                "Error threshold percentage must be between 1 and 100",
            ));
        }

        if self.circuit_breaker.rolling_count_buckets == 0 {
            return Err(GatewayError::configuration(
                "Rolling window must have at least one bucket",
            ));
        }

        if self.circuit_breaker.timeout.is_zero() || self.circuit_breaker.reset_timeout.is_zero() {
            return Err(GatewayError::configuration(
                "Breaker timeouts must be non-zero",
            ));
        }

        Ok(())
    }
}

/// Builder for GatewayConfig.
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    auth: Option<AuthConfig>,
    token_store: Option<TokenStoreConfig>,
    rate_limit: Option<RateLimiterConfig>,
    circuit_breaker: Option<BreakerConfig>,
}

impl GatewayConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the authentication configuration.
    pub fn auth(mut self, config: AuthConfig) -> Self {
        self.auth = Some(config);
        self
    }

    /// Sets the authentication priority order.
    pub fn priority(mut self, priority: Vec<AuthMethod>) -> Self {
        self.auth = Some(AuthConfig { priority });
        self
    }

    /// Sets the token store configuration.
    pub fn token_store(mut self, config: TokenStoreConfig) -> Self {
        self.token_store = Some(config);
        self
    }

    /// Sets the rate limiter configuration.
    pub fn rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Sets the circuit breaker configuration.
    pub fn circuit_breaker(mut self, config: BreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Result<GatewayConfig, GatewayError> {
        let config = GatewayConfig {
            auth: self.auth.unwrap_or_default(),
            token_store: self.token_store.unwrap_or_default(),
            rate_limit: self.rate_limit.unwrap_or_default(),
            circuit_breaker: self.circuit_breaker.unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }
}
