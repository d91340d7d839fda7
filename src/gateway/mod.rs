//! Composition of the admission gate, authentication, and circuit breaker.

use crate::auth::{AuthMethod, AuthService, AuthStrategy, AuthUser, Credential, TokenStoreStrategy};
use crate::config::GatewayConfig;
use crate::errors::{GatewayError, GatewayResult};
use crate::observability::Metrics;
use crate::ratelimit::{RateLimitDecision, RateLimitKey, RateLimiter};
use crate::resilience::CircuitBreaker;
use crate::token::TokenStore;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// The gateway every outbound platform call passes through.
///
/// Control flow per request: the rate limiter rejects excess traffic first,
/// then the credential set is resolved to an identity via priority-ordered
/// fallback, and only then is the authorized action executed through the
/// circuit breaker.
pub struct Gateway<R> {
    auth: AuthService,
    limiter: RateLimiter,
    breaker: CircuitBreaker<R>,
    tokens: Arc<TokenStore>,
    priority: Vec<AuthMethod>,
    metrics: Arc<Metrics>,
}

impl<R> Gateway<R> {
    /// Creates a gateway from configuration and a strategy registry.
    ///
    /// When the priority order names `oauth2` and no strategy is registered
    /// for it, the token store itself is wired in as the OAuth2 strategy, so
    /// gateway-issued tokens authenticate out of the box. The store's
    /// periodic cleanup task is started here and cancelled by `shutdown`.
    pub fn new(
        config: GatewayConfig,
        mut strategies: HashMap<AuthMethod, Arc<dyn AuthStrategy>>,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let tokens = Arc::new(TokenStore::new(config.token_store)?);
        tokens.clone().start_cleanup();

        if config.auth.priority.contains(&AuthMethod::OAuth2) {
            strategies
                .entry(AuthMethod::OAuth2)
                .or_insert_with(|| Arc::new(TokenStoreStrategy::new(tokens.clone())));
        }

        Ok(Self {
            auth: AuthService::new(strategies)?,
            limiter: RateLimiter::new(config.rate_limit),
            breaker: CircuitBreaker::new(config.circuit_breaker),
            tokens,
            priority: config.auth.priority,
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Gets the token store.
    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Gets the authentication service.
    pub fn auth_service(&self) -> &AuthService {
        &self.auth
    }

    /// Gets the admission rate limiter.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Gets the circuit breaker.
    pub fn circuit_breaker(&self) -> &CircuitBreaker<R> {
        &self.breaker
    }

    /// Gets the metrics collector.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Runs an authorized action through the full gate.
    ///
    /// Rejections happen in order: rate limit (429, before any strategy is
    /// invoked), authentication (401, before the transport is touched), then
    /// whatever the breaker-wrapped action produces.
    pub async fn execute<F, Fut>(
        &self,
        key: &RateLimitKey,
        credentials: &HashMap<AuthMethod, Credential>,
        action: F,
    ) -> GatewayResult<R>
    where
        F: FnOnce(AuthUser) -> Fut,
        Fut: Future<Output = GatewayResult<R>>,
    {
        let started = Instant::now();
        self.metrics.record_request();

        if let RateLimitDecision::Rejected(rejection) = self.limiter.check(key) {
            self.metrics.record_rate_limited();
            return Err(rejection.into());
        }

        let auth = self
            .auth
            .authenticate_with_fallback(credentials, &self.priority)
            .await;
        if !auth.authenticated {
            self.metrics.record_unauthenticated();
            return Err(GatewayError::bad_credentials(
                "No authentication method accepted the supplied credentials",
            ));
        }
        let user = auth.user.ok_or_else(|| {
            GatewayError::bad_credentials("Authenticated result carried no principal")
        })?;

        let result = self.breaker.fire(|| action(user)).await;

        match &result {
            Ok(_) => self.metrics.record_success(),
            Err(error) if error.is_circuit_open() => self.metrics.record_circuit_broken(),
            Err(_) => self.metrics.record_failure(),
        }
        self.metrics.record_latency(started.elapsed());

        result
    }

    /// Cancels background work (the token cleanup task).
    pub fn shutdown(&self) {
        self.tokens.shutdown();
    }
}
