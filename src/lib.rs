//! # SCM Gateway
//!
//! The trust-and-resilience gate for outbound calls to a remote
//! source-control platform:
//! - Multi-strategy authentication with priority-ordered fallback
//! - Token store with encryption at rest, expiry, and revocation
//! - Per-identity admission rate limiting
//! - Circuit breaker with rolling error counts and half-open probing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scm_gateway::{AuthMethod, Credential, Gateway, GatewayConfig, RateLimitKey};
//! use std::collections::HashMap;
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::builder()
//!         .priority(vec![AuthMethod::OAuth2])
//!         .build()?;
//!
//!     // With no explicit OAuth2 strategy, gateway-issued tokens
//!     // authenticate through the token store.
//!     let gateway: Gateway<String> = Gateway::new(config, HashMap::new())?;
//!
//!     let mut credentials = HashMap::new();
//!     credentials.insert(AuthMethod::OAuth2, Credential::oauth2("issued-token"));
//!
//!     let key = RateLimitKey::anonymous(IpAddr::V4(Ipv4Addr::LOCALHOST));
//!     let response = gateway
//!         .execute(&key, &credentials, |user| async move {
//!             Ok(format!("calling platform as {}", user.id))
//!         })
//!         .await?;
//!
//!     println!("{}", response);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;

// Authentication
pub mod auth;

// Token lifecycle
pub mod token;

// Admission control
pub mod ratelimit;

// Resilience patterns
pub mod resilience;

// Composition
pub mod gateway;

// Observability
pub mod observability;

// Re-exports for convenience
pub use auth::{AuthMethod, AuthResult, AuthService, AuthStrategy, AuthUser, Credential};
pub use config::{GatewayConfig, GatewayConfigBuilder, StorageType};
pub use errors::{GatewayError, GatewayErrorKind, GatewayResult};
pub use gateway::Gateway;
pub use observability::{Metrics, MetricsSnapshot};
pub use ratelimit::{RateLimitDecision, RateLimitKey, RateLimiter};
pub use resilience::{BreakerEvent, CircuitBreaker, CircuitState};
pub use token::{
    AccessTokenRecord, RefreshTokenRecord, TokenEvent, TokenStore, TokenStoreStats, UserTokens,
};
