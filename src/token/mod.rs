//! Token lifecycle: storage, expiry, revocation, and encryption at rest.

use crate::config::{StorageType, TokenStoreConfig};
use crate::errors::{GatewayError, GatewayErrorKind, GatewayResult};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ring::aead;
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const NONCE_LEN: usize = 12;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// An issued access token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenRecord {
    /// The opaque token value, which is also the record's id.
    pub token: String,
    /// Owning user.
    pub user_id: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Issuance time.
    pub issued_at: DateTime<Utc>,
    /// Expiry time; always after `issued_at`.
    pub expires_at: DateTime<Utc>,
    /// Last successful lookup.
    pub last_used_at: DateTime<Utc>,
}

impl AccessTokenRecord {
    /// Creates a record issued now with the given lifetime.
    pub fn new(
        token: impl Into<String>,
        user_id: impl Into<String>,
        scopes: Vec<String>,
        lifetime: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            token: token.into(),
            user_id: user_id.into(),
            scopes,
            issued_at: now,
            expires_at: now + ChronoDuration::from_std(lifetime).unwrap_or(ChronoDuration::zero()),
            last_used_at: now,
        }
    }

    /// Returns true once the expiry time has passed.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

impl fmt::Debug for AccessTokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenRecord")
            .field("token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("scopes", &self.scopes)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

/// An issued refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    /// Record id.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Revocation flag; a revoked token is never returned by lookup.
    pub is_revoked: bool,
    /// Last successful lookup.
    pub last_used_at: DateTime<Utc>,
}

impl RefreshTokenRecord {
    /// Creates a record with a fresh id, issued now with the given lifetime.
    pub fn new(user_id: impl Into<String>, lifetime: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            expires_at: now + ChronoDuration::from_std(lifetime).unwrap_or(ChronoDuration::zero()),
            is_revoked: false,
            last_used_at: now,
        }
    }

    /// Returns true once the expiry time has passed.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// All live tokens owned by one user.
#[derive(Debug, Clone, Default)]
pub struct UserTokens {
    /// Live access tokens.
    pub access_tokens: Vec<AccessTokenRecord>,
    /// Live, non-revoked refresh tokens.
    pub refresh_tokens: Vec<RefreshTokenRecord>,
}

/// Derived store statistics, recomputed on every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenStoreStats {
    /// Access tokens that have not expired.
    pub live_access_tokens: usize,
    /// Access tokens past their expiry, not yet evicted.
    pub expired_access_tokens: usize,
    /// Refresh tokens that are live and not revoked.
    pub live_refresh_tokens: usize,
    /// Refresh tokens that are expired or revoked, not yet evicted.
    pub expired_refresh_tokens: usize,
    /// Estimated serialized size of the backing maps.
    pub estimated_bytes: usize,
    /// Completion time of the most recent cleanup sweep.
    pub last_cleanup: Option<DateTime<Utc>>,
    /// Number of cleanup sweeps run.
    pub cleanup_runs: u64,
}

/// Lifecycle notification pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    /// An access token was stored.
    AccessTokenStored {
        /// Redacted token reference.
        token_ref: String,
        /// Owning user.
        user_id: String,
    },
    /// A refresh token was stored.
    RefreshTokenStored {
        /// Record id.
        id: String,
        /// Owning user.
        user_id: String,
    },
    /// An access token was removed (explicitly or by eviction).
    AccessTokenRemoved {
        /// Redacted token reference.
        token_ref: String,
    },
    /// A refresh token was removed (explicitly or by eviction).
    RefreshTokenRemoved {
        /// Record id.
        id: String,
    },
    /// A cleanup sweep removed expired or revoked tokens.
    TokensCleaned {
        /// Number of records removed.
        removed: usize,
    },
    /// An internal failure occurred.
    StoreError {
        /// Failure description.
        message: String,
    },
}

fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{}***", prefix)
}

/// Namespace within a storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Access token namespace.
    Access,
    /// Refresh token namespace.
    Refresh,
}

/// Backing storage strategy for the token store.
///
/// Payloads are opaque to the backend: serialized (and, when configured,
/// encrypted) by the store before insertion.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Inserts or overwrites a payload.
    async fn insert(&self, kind: TokenKind, id: &str, payload: String);

    /// Retrieves a payload.
    async fn get(&self, kind: TokenKind, id: &str) -> Option<String>;

    /// Removes a payload; returns whether anything was removed.
    async fn remove(&self, kind: TokenKind, id: &str) -> bool;

    /// Lists all entries in a namespace.
    async fn entries(&self, kind: TokenKind) -> Vec<(String, String)>;
}

/// In-memory storage backend.
#[derive(Default)]
pub struct MemoryBackend {
    access: Mutex<HashMap<String, String>>,
    refresh: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: TokenKind) -> &Mutex<HashMap<String, String>> {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn insert(&self, kind: TokenKind, id: &str, payload: String) {
        self.map(kind).lock().unwrap().insert(id.to_string(), payload);
    }

    async fn get(&self, kind: TokenKind, id: &str) -> Option<String> {
        self.map(kind).lock().unwrap().get(id).cloned()
    }

    async fn remove(&self, kind: TokenKind, id: &str) -> bool {
        self.map(kind).lock().unwrap().remove(id).is_some()
    }

    async fn entries(&self, kind: TokenKind) -> Vec<(String, String)> {
        self.map(kind)
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Opens the configured backend.
///
/// File and database storage are deliberate extension points: selecting one
/// fails fast here instead of silently degrading to memory.
fn open_backend(storage: StorageType) -> GatewayResult<Arc<dyn StorageBackend>> {
    match storage {
        StorageType::Memory => Ok(Arc::new(MemoryBackend::new())),
        StorageType::File => Err(GatewayError::unsupported_backend(
            "File-backed token storage is not implemented",
        )),
        StorageType::Database => Err(GatewayError::unsupported_backend(
            "Database-backed token storage is not implemented",
        )),
    }
}

/// AES-256-GCM sealer for at-rest encryption of token payloads.
///
/// The 256-bit key is derived from the configured key string with SHA-256.
/// Each sealed payload carries its random nonce as a prefix.
struct TokenSealer {
    key: aead::LessSafeKey,
    rng: SystemRandom,
}

impl TokenSealer {
    fn new(key_material: &SecretString) -> GatewayResult<Self> {
        let digest = Sha256::digest(key_material.expose_secret().as_bytes());
        let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, digest.as_slice())
            .map_err(|_| GatewayError::encryption("Failed to derive encryption key"))?;
        Ok(Self {
            key: aead::LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    fn seal(&self, plaintext: &[u8]) -> GatewayResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| GatewayError::encryption("Failed to generate nonce"))?;
        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

        let mut buffer = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut buffer)
            .map_err(|_| GatewayError::encryption("Failed to encrypt token payload"))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&buffer);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> GatewayResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(GatewayError::decryption("Sealed payload is truncated"));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = aead::Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| GatewayError::decryption("Invalid nonce"))?;

        let mut buffer = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, aead::Aad::empty(), &mut buffer)
            .map_err(|_| GatewayError::decryption("Failed to decrypt token payload"))?;
        Ok(plaintext.to_vec())
    }
}

/// Store for issued access and refresh tokens.
///
/// The backing maps are exclusively owned by the store; every read returns a
/// defensive copy, so callers can never mutate internal state through a
/// returned record.
pub struct TokenStore {
    backend: Arc<dyn StorageBackend>,
    sealer: Option<TokenSealer>,
    cleanup_interval: Duration,
    stats: Mutex<TokenStoreStats>,
    events: broadcast::Sender<TokenEvent>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenStore {
    /// Creates a store from configuration.
    ///
    /// Fails fast on an unimplemented storage backend and on encryption
    /// enabled without a key.
    pub fn new(config: TokenStoreConfig) -> GatewayResult<Self> {
        let backend = open_backend(config.storage)?;

        let sealer = if config.encrypt_tokens {
            let key = config.encryption_key.as_ref().ok_or_else(|| {
                GatewayError::configuration(
                    "Token encryption is enabled but no encryption key is configured",
                )
            })?;
            Some(TokenSealer::new(key)?)
        } else {
            None
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            backend,
            sealer,
            cleanup_interval: config.cleanup_interval,
            stats: Mutex::new(TokenStoreStats::default()),
            events,
            cleanup_task: Mutex::new(None),
        })
    }

    /// Subscribes to lifecycle notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: TokenEvent) {
        let _ = self.events.send(event);
    }

    fn encode<T: Serialize>(&self, record: &T) -> GatewayResult<String> {
        let json = serde_json::to_vec(record).map_err(|e| {
            let error = GatewayError::serialization("Failed to serialize token record").with_cause(e);
            self.emit(TokenEvent::StoreError {
                message: error.to_string(),
            });
            error
        })?;

        match &self.sealer {
            Some(sealer) => {
                let sealed = sealer.seal(&json).map_err(|e| {
                    self.emit(TokenEvent::StoreError {
                        message: e.to_string(),
                    });
                    e
                })?;
                Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
            }
            None => String::from_utf8(json).map_err(|e| {
                GatewayError::serialization("Token record is not valid UTF-8").with_cause(e)
            }),
        }
    }

    fn decode<T: for<'de> Deserialize<'de>>(&self, payload: &str) -> GatewayResult<T> {
        let json = match &self.sealer {
            Some(sealer) => {
                let sealed = base64::engine::general_purpose::STANDARD
                    .decode(payload)
                    .map_err(|e| {
                        let error =
                            GatewayError::decryption("Sealed payload is not valid base64")
                                .with_cause(e);
                        self.emit(TokenEvent::StoreError {
                            message: error.to_string(),
                        });
                        error
                    })?;
                sealer.open(&sealed).map_err(|e| {
                    self.emit(TokenEvent::StoreError {
                        message: e.to_string(),
                    });
                    e
                })?
            }
            None => payload.as_bytes().to_vec(),
        };

        serde_json::from_slice(&json).map_err(|e| {
            let error =
                GatewayError::serialization("Failed to deserialize token record").with_cause(e);
            self.emit(TokenEvent::StoreError {
                message: error.to_string(),
            });
            error
        })
    }

    /// Stores an access token, overwriting any record with the same token id.
    pub async fn store_access_token(&self, record: AccessTokenRecord) -> GatewayResult<()> {
        if record.expires_at <= record.issued_at {
            return Err(GatewayError::new(
                GatewayErrorKind::InvalidTokenRecord,
                "Access token expiry must be after issuance",
            ));
        }

        let payload = self.encode(&record)?;
        self.backend
            .insert(TokenKind::Access, &record.token, payload)
            .await;
        self.recompute_stats().await?;
        self.emit(TokenEvent::AccessTokenStored {
            token_ref: redact_token(&record.token),
            user_id: record.user_id.clone(),
        });
        tracing::debug!(user_id = %record.user_id, "Access token stored");
        Ok(())
    }

    /// Looks up an access token by its value.
    ///
    /// An expired record is evicted on read and reported as absent; the next
    /// lookup is also absent. A live record has `last_used_at` advanced and
    /// is returned as a copy.
    pub async fn get_access_token(&self, token: &str) -> GatewayResult<Option<AccessTokenRecord>> {
        let payload = match self.backend.get(TokenKind::Access, token).await {
            Some(p) => p,
            None => return Ok(None),
        };

        let mut record: AccessTokenRecord = self.decode(&payload)?;
        if record.is_expired() {
            if self.backend.remove(TokenKind::Access, token).await {
                self.recompute_stats().await?;
                self.emit(TokenEvent::AccessTokenRemoved {
                    token_ref: redact_token(token),
                });
                tracing::debug!("Expired access token evicted on read");
            }
            return Ok(None);
        }

        record.last_used_at = Utc::now();
        let updated = self.encode(&record)?;
        self.backend.insert(TokenKind::Access, token, updated).await;
        self.recompute_stats().await?;
        Ok(Some(record))
    }

    /// Stores a refresh token, overwriting any record with the same id.
    pub async fn store_refresh_token(&self, record: RefreshTokenRecord) -> GatewayResult<()> {
        let payload = self.encode(&record)?;
        self.backend
            .insert(TokenKind::Refresh, &record.id, payload)
            .await;
        self.recompute_stats().await?;
        self.emit(TokenEvent::RefreshTokenStored {
            id: record.id.clone(),
            user_id: record.user_id.clone(),
        });
        tracing::debug!(user_id = %record.user_id, "Refresh token stored");
        Ok(())
    }

    /// Looks up a refresh token by id.
    ///
    /// Expired or revoked records are evicted on read and reported absent.
    pub async fn get_refresh_token(&self, id: &str) -> GatewayResult<Option<RefreshTokenRecord>> {
        let payload = match self.backend.get(TokenKind::Refresh, id).await {
            Some(p) => p,
            None => return Ok(None),
        };

        let mut record: RefreshTokenRecord = self.decode(&payload)?;
        if record.is_expired() || record.is_revoked {
            if self.backend.remove(TokenKind::Refresh, id).await {
                self.recompute_stats().await?;
                self.emit(TokenEvent::RefreshTokenRemoved { id: id.to_string() });
                tracing::debug!("Dead refresh token evicted on read");
            }
            return Ok(None);
        }

        record.last_used_at = Utc::now();
        let updated = self.encode(&record)?;
        self.backend.insert(TokenKind::Refresh, id, updated).await;
        self.recompute_stats().await?;
        Ok(Some(record))
    }

    /// Marks a refresh token revoked in place. Returns whether a record was
    /// found. Subsequent lookups evict and report absence.
    pub async fn revoke_refresh_token(&self, id: &str) -> GatewayResult<bool> {
        let payload = match self.backend.get(TokenKind::Refresh, id).await {
            Some(p) => p,
            None => return Ok(false),
        };

        let mut record: RefreshTokenRecord = self.decode(&payload)?;
        record.is_revoked = true;
        let updated = self.encode(&record)?;
        self.backend.insert(TokenKind::Refresh, id, updated).await;
        self.recompute_stats().await?;
        tracing::debug!(user_id = %record.user_id, "Refresh token revoked");
        Ok(true)
    }

    /// Removes an access token. Idempotent: removing an absent id is a
    /// no-op, and the removal notification fires only when something was
    /// actually removed.
    pub async fn remove_access_token(&self, token: &str) -> GatewayResult<bool> {
        let removed = self.backend.remove(TokenKind::Access, token).await;
        if removed {
            self.recompute_stats().await?;
            self.emit(TokenEvent::AccessTokenRemoved {
                token_ref: redact_token(token),
            });
        }
        Ok(removed)
    }

    /// Removes a refresh token. Idempotent, as above.
    pub async fn remove_refresh_token(&self, id: &str) -> GatewayResult<bool> {
        let removed = self.backend.remove(TokenKind::Refresh, id).await;
        if removed {
            self.recompute_stats().await?;
            self.emit(TokenEvent::RefreshTokenRemoved { id: id.to_string() });
        }
        Ok(removed)
    }

    /// Enumerates the live, non-revoked tokens owned by a user.
    pub async fn get_user_tokens(&self, user_id: &str) -> GatewayResult<UserTokens> {
        let mut tokens = UserTokens::default();

        for (_, payload) in self.backend.entries(TokenKind::Access).await {
            let record: AccessTokenRecord = self.decode(&payload)?;
            if record.user_id == user_id && !record.is_expired() {
                tokens.access_tokens.push(record);
            }
        }

        for (_, payload) in self.backend.entries(TokenKind::Refresh).await {
            let record: RefreshTokenRecord = self.decode(&payload)?;
            if record.user_id == user_id && !record.is_expired() && !record.is_revoked {
                tokens.refresh_tokens.push(record);
            }
        }

        Ok(tokens)
    }

    /// Sweeps both maps, removing every expired access token and every
    /// expired-or-revoked refresh token. Returns the number removed.
    pub async fn cleanup_expired_tokens(&self) -> GatewayResult<usize> {
        let mut removed = 0;

        for (id, payload) in self.backend.entries(TokenKind::Access).await {
            let record: AccessTokenRecord = self.decode(&payload)?;
            if record.is_expired() && self.backend.remove(TokenKind::Access, &id).await {
                removed += 1;
            }
        }

        for (id, payload) in self.backend.entries(TokenKind::Refresh).await {
            let record: RefreshTokenRecord = self.decode(&payload)?;
            if (record.is_expired() || record.is_revoked)
                && self.backend.remove(TokenKind::Refresh, &id).await
            {
                removed += 1;
            }
        }

        {
            let mut stats = self.stats.lock().unwrap();
            stats.last_cleanup = Some(Utc::now());
            stats.cleanup_runs += 1;
        }
        self.recompute_stats().await?;

        if removed > 0 {
            self.emit(TokenEvent::TokensCleaned { removed });
            tracing::info!(removed, "Token cleanup sweep removed dead records");
        }

        Ok(removed)
    }

    /// Returns a snapshot copy of the store statistics.
    pub fn stats(&self) -> TokenStoreStats {
        self.stats.lock().unwrap().clone()
    }

    async fn recompute_stats(&self) -> GatewayResult<()> {
        let mut live_access = 0;
        let mut expired_access = 0;
        let mut live_refresh = 0;
        let mut expired_refresh = 0;
        let mut bytes = 0;

        for (id, payload) in self.backend.entries(TokenKind::Access).await {
            bytes += id.len() + payload.len();
            let record: AccessTokenRecord = self.decode(&payload)?;
            if record.is_expired() {
                expired_access += 1;
            } else {
                live_access += 1;
            }
        }

        for (id, payload) in self.backend.entries(TokenKind::Refresh).await {
            bytes += id.len() + payload.len();
            let record: RefreshTokenRecord = self.decode(&payload)?;
            if record.is_expired() || record.is_revoked {
                expired_refresh += 1;
            } else {
                live_refresh += 1;
            }
        }

        let mut stats = self.stats.lock().unwrap();
        stats.live_access_tokens = live_access;
        stats.expired_access_tokens = expired_access;
        stats.live_refresh_tokens = live_refresh;
        stats.expired_refresh_tokens = expired_refresh;
        stats.estimated_bytes = bytes;
        Ok(())
    }

    /// Starts the periodic cleanup task. The handle is retained so
    /// `shutdown` can cancel it; this is not a detached timer.
    pub fn start_cleanup(self: Arc<Self>) {
        let mut task = self.cleanup_task.lock().unwrap();
        if task.is_some() {
            return;
        }

        let interval = self.cleanup_interval;
        let store = Arc::downgrade(&self);
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let store = match store.upgrade() {
                    Some(s) => s,
                    None => break,
                };
                if let Err(error) = store.cleanup_expired_tokens().await {
                    tracing::warn!(%error, "Periodic token cleanup failed");
                    store.emit(TokenEvent::StoreError {
                        message: error.to_string(),
                    });
                }
            }
        }));
    }

    /// Cancels the periodic cleanup task, if running.
    pub fn shutdown(&self) {
        if let Some(task) = self.cleanup_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for TokenStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
