//! Authentication methods, strategies, and the fallback service.

use crate::errors::{GatewayError, GatewayErrorKind, GatewayResult};
use crate::token::TokenStore;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Authentication method. The set is closed and explicit; a method is never
/// inferred from the shape of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// OAuth2 access token issued by the gateway.
    OAuth2,
    /// Bearer token issued by the remote platform.
    Bearer,
    /// Static API key.
    ApiKey,
    /// Username and password pair.
    Basic,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OAuth2 => write!(f, "oauth2"),
            Self::Bearer => write!(f, "bearer"),
            Self::ApiKey => write!(f, "api_key"),
            Self::Basic => write!(f, "basic"),
        }
    }
}

impl FromStr for AuthMethod {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oauth2" => Ok(Self::OAuth2),
            "bearer" => Ok(Self::Bearer),
            "api_key" => Ok(Self::ApiKey),
            "basic" => Ok(Self::Basic),
            other => Err(GatewayError::configuration(format!(
                "Unknown authentication method: {}",
                other
            ))),
        }
    }
}

/// Per-method credential payload. Multiple credentials may be supplied
/// simultaneously; only the methods named in the priority order are tried.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Opaque access token for the OAuth2 method.
    OAuth2 {
        /// Access token value.
        access_token: SecretString,
    },
    /// Bearer token.
    Bearer {
        /// Token value.
        token: SecretString,
    },
    /// Static API key.
    ApiKey {
        /// Key value.
        key: SecretString,
    },
    /// Username/password pair.
    Basic {
        /// Account username.
        username: String,
        /// Account password.
        password: SecretString,
    },
}

impl Credential {
    /// Creates an OAuth2 credential.
    pub fn oauth2(access_token: impl Into<String>) -> Self {
        Self::OAuth2 {
            access_token: SecretString::new(access_token.into()),
        }
    }

    /// Creates a bearer credential.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: SecretString::new(token.into()),
        }
    }

    /// Creates an API key credential.
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey {
            key: SecretString::new(key.into()),
        }
    }

    /// Creates a basic credential.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// The method this credential belongs to.
    pub fn method(&self) -> AuthMethod {
        match self {
            Self::OAuth2 { .. } => AuthMethod::OAuth2,
            Self::Bearer { .. } => AuthMethod::Bearer,
            Self::ApiKey { .. } => AuthMethod::ApiKey,
            Self::Basic { .. } => AuthMethod::Basic,
        }
    }

    /// Exposes the secret value for strategies that validate it.
    pub fn secret(&self) -> &str {
        match self {
            Self::OAuth2 { access_token } => access_token.expose_secret(),
            Self::Bearer { token } => token.expose_secret(),
            Self::ApiKey { key } => key.expose_secret(),
            Self::Basic { password, .. } => password.expose_secret(),
        }
    }

    /// Gets a redacted prefix for logging.
    pub fn redacted(&self) -> String {
        let secret = self.secret();
        let prefix: String = secret.chars().take(4).collect();
        match self {
            Self::Basic { username, .. } => format!("{}:***", username),
            _ => format!("{}***", prefix),
        }
    }
}

/// Authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// Stable user id.
    pub id: String,
    /// Display name.
    pub name: String,
}

impl AuthUser {
    /// Creates a new user.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Outcome of an authentication attempt.
///
/// Exactly one of two shapes holds: authenticated with `method_used` set, or
/// unauthenticated with `method_used` empty. The constructors maintain this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    /// Whether any strategy accepted the credentials.
    pub authenticated: bool,
    /// The method that succeeded, when one did.
    pub method_used: Option<AuthMethod>,
    /// The authenticated principal, when known.
    pub user: Option<AuthUser>,
}

impl AuthResult {
    /// Creates a successful result.
    pub fn success(method: AuthMethod, user: AuthUser) -> Self {
        Self {
            authenticated: true,
            method_used: Some(method),
            user: Some(user),
        }
    }

    /// Creates an unauthenticated result.
    pub fn failure() -> Self {
        Self {
            authenticated: false,
            method_used: None,
            user: None,
        }
    }
}

/// A pluggable authentication strategy for one method.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Validates a credential and resolves it to an identity.
    ///
    /// Returning `Ok(AuthResult::failure())` means the credential was
    /// examined and rejected; returning `Err` means the strategy itself
    /// failed (the fallback loop folds that into a rejection for the
    /// method, single-method calls propagate it).
    async fn authenticate(&self, credential: &Credential) -> GatewayResult<AuthResult>;
}

/// Multi-strategy authentication service with priority-ordered fallback.
pub struct AuthService {
    strategies: HashMap<AuthMethod, Arc<dyn AuthStrategy>>,
}

impl AuthService {
    /// Creates a new service from a method-to-strategy registry.
    ///
    /// Construction fails when no strategies are registered at all; a
    /// service that can never authenticate anything is a setup error.
    pub fn new(strategies: HashMap<AuthMethod, Arc<dyn AuthStrategy>>) -> GatewayResult<Self> {
        if strategies.is_empty() {
            return Err(GatewayError::new(
                GatewayErrorKind::NoStrategies,
                "Authentication service requires at least one strategy",
            ));
        }
        Ok(Self { strategies })
    }

    /// Returns true if a strategy is registered for the method.
    pub fn supports(&self, method: AuthMethod) -> bool {
        self.strategies.contains_key(&method)
    }

    /// Attempts the supplied credentials in strict priority order.
    ///
    /// For each method present in both the credential map and the strategy
    /// registry, the strategy is awaited; the first success is returned
    /// immediately and no later strategy is invoked. A strategy error is
    /// treated as a rejection for that method and iteration continues. When
    /// nothing succeeds the result is unauthenticated.
    pub async fn authenticate_with_fallback(
        &self,
        credentials: &HashMap<AuthMethod, Credential>,
        priority: &[AuthMethod],
    ) -> AuthResult {
        for &method in priority {
            let credential = match credentials.get(&method) {
                Some(c) => c,
                None => continue,
            };
            let strategy = match self.strategies.get(&method) {
                Some(s) => s,
                None => {
                    tracing::debug!(method = %method, "No strategy registered, skipping");
                    continue;
                }
            };

            match strategy.authenticate(credential).await {
                Ok(result) if result.authenticated => {
                    tracing::debug!(method = %method, "Authentication succeeded");
                    // A strategy that forgot to stamp the method would break
                    // the result invariant; stamp it here.
                    return AuthResult {
                        method_used: result.method_used.or(Some(method)),
                        ..result
                    };
                }
                Ok(_) => {
                    tracing::debug!(method = %method, "Credentials rejected, trying next method");
                }
                Err(error) => {
                    tracing::debug!(method = %method, %error, "Strategy failed, trying next method");
                }
            }
        }

        AuthResult::failure()
    }

    /// Runs a single named strategy with no fallback.
    ///
    /// An unregistered method resolves to unauthenticated rather than an
    /// error; a strategy failure propagates.
    pub async fn authenticate_method(
        &self,
        method: AuthMethod,
        credential: &Credential,
    ) -> GatewayResult<AuthResult> {
        match self.strategies.get(&method) {
            Some(strategy) => strategy.authenticate(credential).await,
            None => Ok(AuthResult::failure()),
        }
    }

    /// Runs the OAuth2 strategy directly.
    pub async fn authenticate_oauth2(&self, credential: &Credential) -> GatewayResult<AuthResult> {
        self.authenticate_method(AuthMethod::OAuth2, credential).await
    }
}

/// OAuth2 strategy backed by the token store: the presented opaque token is
/// resolved through `get_access_token` and authenticates its owner.
pub struct TokenStoreStrategy {
    store: Arc<TokenStore>,
}

impl TokenStoreStrategy {
    /// Creates a new store-backed strategy.
    pub fn new(store: Arc<TokenStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuthStrategy for TokenStoreStrategy {
    async fn authenticate(&self, credential: &Credential) -> GatewayResult<AuthResult> {
        let access_token = match credential {
            Credential::OAuth2 { access_token } => access_token.expose_secret(),
            other => {
                return Err(GatewayError::new(
                    GatewayErrorKind::CredentialMismatch,
                    format!("Expected an oauth2 credential, got {}", other.method()),
                ))
            }
        };

        match self.store.get_access_token(access_token).await? {
            Some(record) => Ok(AuthResult::success(
                AuthMethod::OAuth2,
                AuthUser::new(record.user_id.clone(), record.user_id),
            )),
            None => Ok(AuthResult::failure()),
        }
    }
}

/// Mock strategy for testing: authenticates a fixed set of secrets and
/// records every call.
#[derive(Default)]
pub struct MockStrategy {
    accepted: HashMap<String, AuthUser>,
    fail_with_error: bool,
    call_count: AtomicU32,
    seen_secrets: Mutex<Vec<String>>,
}

impl MockStrategy {
    /// Creates a mock that rejects everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a secret value as the given user.
    pub fn accept(mut self, secret: impl Into<String>, user: AuthUser) -> Self {
        self.accepted.insert(secret.into(), user);
        self
    }

    /// Makes every call return an error instead of a result.
    pub fn failing(mut self) -> Self {
        self.fail_with_error = true;
        self
    }

    /// Number of times `authenticate` was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// The secret values this mock has seen, in call order.
    pub fn seen_secrets(&self) -> Vec<String> {
        self.seen_secrets.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthStrategy for MockStrategy {
    async fn authenticate(&self, credential: &Credential) -> GatewayResult<AuthResult> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.seen_secrets
            .lock()
            .unwrap()
            .push(credential.secret().to_string());

        if self.fail_with_error {
            return Err(GatewayError::new(
                GatewayErrorKind::Unknown,
                "Mock strategy failure",
            ));
        }

        match self.accepted.get(credential.secret()) {
            Some(user) => Ok(AuthResult::success(credential.method(), user.clone())),
            None => Ok(AuthResult::failure()),
        }
    }
}
