//! Bearer token issuance and verification.
//!
//! Tokens are HS256 JWTs carrying `user_id`, `role`, `iat` and `exp`. The
//! service also keeps a per-client velocity window, which is the first line
//! of defense against credential brute-forcing.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::TokenConfig;
use crate::error::{Result, SecurityError};
use crate::rbac::Role;

/// Verified token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub user_id: String,
    /// Caller's role.
    pub role: Role,
    /// Issued at timestamp.
    pub iat: i64,
    /// Expiration timestamp.
    pub exp: i64,
}

impl Claims {
    /// Create new claims for a subject.
    ///
    /// Fails when `ttl` pushes the expiry past the representable range.
    pub fn new(user_id: impl Into<String>, role: Role, ttl: Duration) -> Result<Self> {
        let now = Utc::now();
        let exp = now.checked_add_signed(ttl).ok_or_else(|| {
            SecurityError::ValidationFailed("token lifetime out of range".to_string())
        })?;

        Ok(Self {
            user_id: user_id.into(),
            role,
            iat: now.timestamp(),
            exp: exp.timestamp(),
        })
    }

    /// Check if the claims are expired.
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    /// Get remaining validity duration.
    pub fn remaining_validity(&self) -> Option<Duration> {
        let remaining = self.exp - Utc::now().timestamp();
        if remaining > 0 {
            Some(Duration::seconds(remaining))
        } else {
            None
        }
    }
}

/// Wire form of the claims. The role stays a string until validated so an
/// unknown role is reported as such instead of as a generic decode error.
#[derive(Debug, Deserialize)]
struct RawClaims {
    user_id: String,
    role: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, Copy)]
struct VelocityWindow {
    count: u32,
    window_start: Instant,
    last_seen: Instant,
}

#[derive(Debug, Clone, Copy)]
struct VelocityLimit {
    limit: u32,
    window: StdDuration,
}

#[derive(Debug)]
struct VelocityTable {
    limit: VelocityLimit,
    clients: HashMap<String, VelocityWindow>,
}

/// Token issuance, verification, and request velocity tracking.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    default_ttl: Duration,
    velocity: Arc<RwLock<VelocityTable>>,
}

impl TokenService {
    /// Create a new token service.
    pub fn new(config: &TokenConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "iat"]);

        let default_ttl = Some(config.expiry_hours)
            .filter(|hours| *hours > 0)
            .and_then(Duration::try_hours)
            .unwrap_or_else(|| Duration::hours(24));

        Self {
            encoding_key,
            decoding_key,
            validation,
            default_ttl,
            velocity: Arc::new(RwLock::new(VelocityTable {
                limit: VelocityLimit {
                    limit: config.velocity_limit,
                    window: config.velocity_window,
                },
                clients: HashMap::new(),
            })),
        }
    }

    /// Issue a token. A zero or negative TTL falls back to the default expiry.
    pub fn issue(&self, subject_id: &str, role: &str, ttl: Duration) -> Result<String> {
        if subject_id.trim().is_empty() {
            return Err(SecurityError::ValidationFailed(
                "subject id must not be empty".to_string(),
            ));
        }
        let role: Role = role.parse()?;

        let ttl = if ttl.num_seconds() <= 0 {
            self.default_ttl
        } else {
            ttl
        };

        let claims = Claims::new(subject_id, role, ttl)?;
        let token = self.sign(&claims)?;

        debug!(user_id = %subject_id, role = %role, exp = claims.exp, "Token issued");
        Ok(token)
    }

    /// Sign pre-built claims.
    pub fn sign(&self, claims: &Claims) -> Result<String> {
        if claims.exp <= claims.iat {
            return Err(SecurityError::ValidationFailed(
                "token expiry must be after issue time".to_string(),
            ));
        }
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| SecurityError::Internal(format!("token signing failed: {}", e)))
    }

    /// Verify a token and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data = decode::<RawClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => {
                    debug!("Token rejected: expired");
                    SecurityError::TokenExpired
                }
                ErrorKind::InvalidAlgorithm => {
                    warn!("Token rejected: algorithm mismatch");
                    SecurityError::InvalidToken("algorithm mismatch".to_string())
                }
                ErrorKind::InvalidSignature => {
                    warn!("Token rejected: signature mismatch");
                    SecurityError::InvalidToken("signature mismatch".to_string())
                }
                ErrorKind::MissingRequiredClaim(claim) => {
                    warn!(claim = %claim, "Token rejected: missing claim");
                    SecurityError::InvalidToken(format!("missing claim {}", claim))
                }
                other => {
                    warn!(error = ?other, "Token rejected: malformed");
                    SecurityError::InvalidToken("malformed token".to_string())
                }
            },
        )?;

        let raw = data.claims;
        let role: Role = raw.role.parse().map_err(|_| {
            warn!(role = %raw.role, user_id = %raw.user_id, "Token rejected: invalid role");
            SecurityError::InvalidToken("invalid role claim".to_string())
        })?;

        if raw.user_id.trim().is_empty() {
            warn!("Token rejected: empty subject");
            return Err(SecurityError::InvalidToken("empty subject".to_string()));
        }

        if Utc::now().timestamp() > raw.exp {
            debug!(user_id = %raw.user_id, "Token rejected: expired");
            return Err(SecurityError::TokenExpired);
        }

        Ok(Claims {
            user_id: raw.user_id,
            role,
            iat: raw.iat,
            exp: raw.exp,
        })
    }

    /// Issue a fresh token for the same subject and role with the default expiry.
    pub fn refresh(&self, token: &str) -> Result<String> {
        let claims = self.verify(token)?;
        let refreshed = Claims::new(&claims.user_id, claims.role, self.default_ttl)?;
        let token = self.sign(&refreshed)?;
        info!(user_id = %claims.user_id, "Token refreshed");
        Ok(token)
    }

    /// Inspect the unverified `exp` claim.
    ///
    /// Does not check the signature; only usable as a fast pre-check.
    /// Anything that cannot be decoded counts as expired.
    pub fn is_expired(token: &str) -> bool {
        let Some(payload) = token.split('.').nth(1) else {
            return true;
        };
        let Ok(bytes) = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) else {
            return true;
        };
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
            return true;
        };

        match value.get("exp").and_then(|v| v.as_i64()) {
            Some(exp) => Utc::now().timestamp() > exp,
            None => true,
        }
    }

    /// Check if a client is still within its velocity window.
    pub async fn check_velocity(&self, client_id: &str) -> bool {
        let now = Instant::now();
        let table = self.velocity.read().await;

        match table.clients.get(client_id) {
            Some(entry) if now.duration_since(entry.window_start) < table.limit.window => {
                entry.count < table.limit.limit
            }
            _ => true,
        }
    }

    /// Record one request for a client.
    pub async fn record(&self, client_id: &str) {
        let now = Instant::now();
        let mut table = self.velocity.write().await;
        let window = table.limit.window;

        let entry = table
            .clients
            .entry(client_id.to_string())
            .or_insert(VelocityWindow {
                count: 0,
                window_start: now,
                last_seen: now,
            });

        if now.duration_since(entry.window_start) >= window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count = entry.count.saturating_add(1);
        entry.last_seen = now;
    }

    /// Change the velocity limit at runtime.
    pub async fn set_velocity_limit(&self, limit: u32, window: StdDuration) {
        let mut table = self.velocity.write().await;
        table.limit = VelocityLimit { limit, window };
        info!(limit, window_ms = window.as_millis() as u64, "Velocity limit updated");
    }

    /// Drop velocity entries for clients inactive longer than `horizon`.
    pub async fn purge_inactive(&self, horizon: StdDuration) -> usize {
        let now = Instant::now();
        let mut table = self.velocity.write().await;
        let before = table.clients.len();
        table
            .clients
            .retain(|_, entry| now.duration_since(entry.last_seen) <= horizon);
        let purged = before - table.clients.len();

        if purged > 0 {
            debug!(purged, "Purged inactive velocity entries");
        }
        purged
    }

    /// Number of clients currently tracked.
    pub async fn tracked_clients(&self) -> usize {
        self.velocity.read().await.clients.len()
    }
}
