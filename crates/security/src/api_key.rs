//! API key management for programmatic access.
//!
//! Keys are long-lived opaque secrets. Only a SHA-256 hash and a short
//! display prefix are kept; the plaintext is returned once at generation.
//! The whole key table is persisted as one JSON document and rewritten on
//! every mutation while the table's write lock is held.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ApiKeyConfig, KeyEncoding};
use crate::error::{Result, SecurityError};
use crate::rbac::Role;

/// Number of plaintext characters kept for identification.
const DISPLAY_PREFIX_LEN: usize = 8;

/// Lifecycle state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Revoked,
    Expired,
}

/// An API key record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    /// Hash of the key (actual key is only shown once at creation).
    pub key_hash: String,
    /// Leading characters of the key for identification.
    pub key_prefix: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    /// When the key expires (if ever).
    pub expires_at: Option<DateTime<Utc>>,
    pub description: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub status: KeyStatus,
}

impl ApiKey {
    /// Check if the key is past its expiry.
    pub fn is_past_expiry(&self) -> bool {
        self.expires_at.map(|e| Utc::now() > e).unwrap_or(false)
    }

    /// Check if the key is usable.
    pub fn is_valid(&self) -> bool {
        self.status == KeyStatus::Active && !self.is_past_expiry()
    }

    /// Verify a plain text key against this record.
    pub fn verify(&self, plain_key: &str) -> bool {
        hash_key(plain_key) == self.key_hash
    }
}

/// A freshly generated key together with its plaintext secret.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub key: ApiKey,
    /// The secret, returned exactly once.
    pub secret: String,
}

/// Counts of keys by status and role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStats {
    pub total_keys: usize,
    pub active: usize,
    pub revoked: usize,
    pub expired: usize,
    pub by_role: HashMap<Role, usize>,
}

/// On-disk document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyFile {
    keys: BTreeMap<String, ApiKey>,
}

/// Persistent API key store.
pub struct ApiKeyStore {
    keys: Arc<RwLock<HashMap<String, ApiKey>>>,
    config: ApiKeyConfig,
}

impl ApiKeyStore {
    /// Open the store, loading existing keys from disk.
    ///
    /// A missing file is an empty store; an unreadable or corrupt file is
    /// an error.
    pub async fn open(config: ApiKeyConfig) -> Result<Self> {
        let keys = load_keys(&config.storage_path).await?;
        info!(
            path = %config.storage_path.display(),
            keys = keys.len(),
            "API key store opened"
        );

        Ok(Self {
            keys: Arc::new(RwLock::new(keys)),
            config,
        })
    }

    /// Path of the backing file.
    pub fn storage_path(&self) -> &Path {
        &self.config.storage_path
    }

    /// Generate a new key. A `None` or non-positive TTL means no expiry.
    pub async fn generate(
        &self,
        role: Role,
        ttl: Option<Duration>,
        description: &str,
    ) -> Result<GeneratedKey> {
        self.generate_inner(role, ttl, description, true).await
    }

    async fn generate_inner(
        &self,
        role: Role,
        ttl: Option<Duration>,
        description: &str,
        enforce_quota: bool,
    ) -> Result<GeneratedKey> {
        let now = Utc::now();
        let expires_at = match ttl.filter(|t| *t > Duration::zero()) {
            Some(t) => Some(now.checked_add_signed(t).ok_or_else(|| {
                SecurityError::ValidationFailed("API key lifetime out of range".to_string())
            })?),
            None => None,
        };

        let mut keys = self.keys.write().await;

        if enforce_quota {
            let active = keys
                .values()
                .filter(|k| k.role == role && k.is_valid())
                .count();
            if active >= self.config.max_keys_per_role {
                warn!(role = %role, active, "API key quota exceeded");
                return Err(SecurityError::QuotaExceeded {
                    role: role.to_string(),
                    limit: self.config.max_keys_per_role,
                });
            }
        }

        let secret = self.generate_secret();
        let key = ApiKey {
            id: Uuid::new_v4().to_string(),
            key_hash: hash_key(&secret),
            key_prefix: secret.chars().take(DISPLAY_PREFIX_LEN).collect(),
            role,
            created_at: now,
            expires_at,
            description: description.to_string(),
            last_used_at: None,
            usage_count: 0,
            status: KeyStatus::Active,
        };

        keys.insert(key.id.clone(), key.clone());
        if let Err(e) = self.persist(&keys).await {
            keys.remove(&key.id);
            return Err(e);
        }

        info!(
            key_id = %key.id,
            role = %role,
            prefix = %key.key_prefix,
            "Created new API key"
        );

        Ok(GeneratedKey { key, secret })
    }

    /// Authenticate with a plaintext key.
    pub async fn validate(&self, secret: &str) -> Result<ApiKey> {
        let hash = hash_key(secret);
        let mut keys = self.keys.write().await;

        let Some(key) = keys.values_mut().find(|k| k.key_hash == hash) else {
            warn!("API key authentication failed: unknown key");
            return Err(SecurityError::KeyNotFound("unknown key".to_string()));
        };

        match key.status {
            KeyStatus::Revoked => {
                warn!(key_id = %key.id, "API key authentication failed: revoked");
                return Err(SecurityError::AuthenticationRequired(
                    "revoked API key".to_string(),
                ));
            }
            KeyStatus::Expired => {
                warn!(key_id = %key.id, "API key authentication failed: expired");
                return Err(SecurityError::AuthenticationRequired(
                    "expired API key".to_string(),
                ));
            }
            KeyStatus::Active => {}
        }

        if key.is_past_expiry() {
            key.status = KeyStatus::Expired;
            let key_id = key.id.clone();
            if let Err(e) = self.persist(&keys).await {
                warn!(key_id = %key_id, error = %e, "Failed to persist key expiry");
            }
            warn!(key_id = %key_id, "API key authentication failed: expired");
            return Err(SecurityError::AuthenticationRequired(
                "expired API key".to_string(),
            ));
        }

        if self.config.usage_tracking {
            key.last_used_at = Some(Utc::now());
            key.usage_count = key.usage_count.saturating_add(1);
        }
        let validated = key.clone();

        // Usage counters never roll back; a failed write only costs accounting.
        if self.config.usage_tracking {
            if let Err(e) = self.persist(&keys).await {
                warn!(key_id = %validated.id, error = %e, "Failed to persist key usage");
            }
        }

        debug!(key_id = %validated.id, role = %validated.role, "API key authenticated");
        Ok(validated)
    }

    /// Revoke a key. Revoking an already revoked key is an error.
    pub async fn revoke(&self, id: &str) -> Result<()> {
        let mut keys = self.keys.write().await;

        let previous = match keys.get_mut(id) {
            None => return Err(SecurityError::KeyNotFound(id.to_string())),
            Some(key) if key.status == KeyStatus::Revoked => {
                return Err(SecurityError::KeyAlreadyRevoked(id.to_string()));
            }
            Some(key) => {
                let previous = key.status;
                key.status = KeyStatus::Revoked;
                previous
            }
        };

        if let Err(e) = self.persist(&keys).await {
            if let Some(key) = keys.get_mut(id) {
                key.status = previous;
            }
            return Err(e);
        }

        info!(key_id = %id, "API key revoked");
        Ok(())
    }

    /// Get a key by id.
    pub async fn get(&self, id: &str) -> Result<ApiKey> {
        self.keys
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SecurityError::KeyNotFound(id.to_string()))
    }

    /// List keys, optionally for one role, oldest first.
    pub async fn list(&self, role: Option<Role>) -> Vec<ApiKey> {
        let keys = self.keys.read().await;
        let mut listed: Vec<ApiKey> = keys
            .values()
            .filter(|k| role.map(|r| k.role == r).unwrap_or(true))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        listed
    }

    /// Replace every active key of a role with a new one.
    ///
    /// Each key is generated-then-revoked; individual failures are logged and
    /// skipped. `force` lets replacements exceed the role quota while old and
    /// new keys briefly coexist.
    pub async fn rotate(&self, role: Role, force: bool) -> Result<Vec<GeneratedKey>> {
        let targets: Vec<ApiKey> = self
            .list(Some(role))
            .await
            .into_iter()
            .filter(|k| k.is_valid())
            .collect();

        if targets.is_empty() {
            return Err(SecurityError::KeyNotFound(format!(
                "no active keys to rotate for role {}",
                role
            )));
        }

        let mut rotated = Vec::with_capacity(targets.len());
        for old in targets {
            let ttl = old.expires_at.map(|e| e - old.created_at);
            let description = format!("{} (rotated)", old.description);

            let generated = match self.generate_inner(role, ttl, &description, !force).await {
                Ok(g) => g,
                Err(e) => {
                    warn!(key_id = %old.id, error = %e, "Failed to generate replacement key");
                    continue;
                }
            };

            if let Err(e) = self.revoke(&old.id).await {
                warn!(key_id = %old.id, error = %e, "Failed to revoke rotated key");
            }
            rotated.push(generated);
        }

        info!(role = %role, rotated = rotated.len(), "API keys rotated");
        Ok(rotated)
    }

    /// Mark overdue keys expired and drop expired records.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let mut keys = self.keys.write().await;
        let snapshot = keys.clone();

        for key in keys.values_mut() {
            if key.status == KeyStatus::Active && key.is_past_expiry() {
                key.status = KeyStatus::Expired;
            }
        }
        let before = keys.len();
        keys.retain(|_, k| k.status != KeyStatus::Expired);
        let removed = before - keys.len();

        if removed == 0 {
            return Ok(0);
        }

        if let Err(e) = self.persist(&keys).await {
            *keys = snapshot;
            return Err(e);
        }

        info!(removed, "Expired API keys cleaned up");
        Ok(removed)
    }

    /// Get key counts by status and role.
    pub async fn stats(&self) -> KeyStats {
        let keys = self.keys.read().await;
        let mut stats = KeyStats::default();

        for key in keys.values() {
            stats.total_keys += 1;
            let status = if key.status == KeyStatus::Active && key.is_past_expiry() {
                KeyStatus::Expired
            } else {
                key.status
            };
            match status {
                KeyStatus::Active => stats.active += 1,
                KeyStatus::Revoked => stats.revoked += 1,
                KeyStatus::Expired => stats.expired += 1,
            }
            *stats.by_role.entry(key.role).or_default() += 1;
        }

        stats
    }

    fn generate_secret(&self) -> String {
        let mut bytes = vec![0u8; self.config.key_length];
        rand::rng().fill_bytes(&mut bytes);

        let encoded = match self.config.encoding {
            KeyEncoding::Hex => hex::encode(&bytes),
            KeyEncoding::Base64 => STANDARD.encode(&bytes),
            KeyEncoding::Base64Url => URL_SAFE_NO_PAD.encode(&bytes),
        };

        match &self.config.prefix {
            Some(prefix) => format!("{}{}", prefix, encoded),
            None => encoded,
        }
    }

    async fn persist(&self, keys: &HashMap<String, ApiKey>) -> Result<()> {
        let document = KeyFile {
            keys: keys.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        let content = serde_json::to_vec_pretty(&document)
            .map_err(|e| SecurityError::PersistenceFailure(e.to_string()))?;

        write_atomic(&self.config.storage_path, &content)
            .await
            .map_err(|e| {
                warn!(
                    path = %self.config.storage_path.display(),
                    error = %e,
                    "Failed to persist API keys"
                );
                SecurityError::PersistenceFailure(e.to_string())
            })
    }
}

fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

async fn load_keys(path: &Path) -> Result<HashMap<String, ApiKey>> {
    let content = match tokio::fs::read(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No API key file, starting empty");
            return Ok(HashMap::new());
        }
        Err(e) => return Err(e.into()),
    };

    let document: KeyFile = serde_json::from_slice(&content).map_err(|e| {
        SecurityError::PersistenceFailure(format!(
            "corrupt API key file {}: {}",
            path.display(),
            e
        ))
    })?;

    Ok(document.keys.into_iter().collect())
}

/// Write to a sibling temp file, then rename over the target.
async fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp = PathBuf::from(path);
    tmp.set_extension("json.tmp");

    tokio::fs::write(&tmp, content).await?;
    restrict_permissions(&tmp).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ApiKeyConfig {
        ApiKeyConfig {
            storage_path: dir.path().join("keys").join("api_keys.json"),
            max_keys_per_role: 2,
            ..Default::default()
        }
    }

    async fn open_store(dir: &TempDir) -> ApiKeyStore {
        ApiKeyStore::open(test_config(dir)).await.unwrap()
    }

    fn assert_totals(stats: &KeyStats) {
        assert_eq!(
            stats.active + stats.revoked + stats.expired,
            stats.total_keys,
            "status counts must sum to total: {:?}",
            stats
        );
    }

    #[tokio::test]
    async fn test_generate_and_validate() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let generated = store
            .generate(Role::Operator, None, "camera controller")
            .await
            .unwrap();

        assert!(generated.secret.starts_with("csk_"));
        assert_eq!(generated.secret.len(), 4 + 64);
        assert_eq!(generated.key.status, KeyStatus::Active);
        assert_eq!(generated.key.key_prefix, &generated.secret[..8]);

        let validated = store.validate(&generated.secret).await.unwrap();
        assert_eq!(validated.id, generated.key.id);
        assert_eq!(validated.role, Role::Operator);
        assert_eq!(validated.usage_count, 1);
        assert!(validated.last_used_at.is_some());

        let again = store.validate(&generated.secret).await.unwrap();
        assert_eq!(again.usage_count, 2);
    }

    #[tokio::test]
    async fn test_encodings() {
        let dir = TempDir::new().unwrap();
        for (encoding, expected_len) in [
            (KeyEncoding::Hex, 32),
            (KeyEncoding::Base64, 24),
            (KeyEncoding::Base64Url, 22),
        ] {
            let store = ApiKeyStore::open(ApiKeyConfig {
                storage_path: dir.path().join(format!("{:?}.json", encoding)),
                key_length: 16,
                encoding,
                prefix: None,
                ..Default::default()
            })
            .await
            .unwrap();

            let generated = store.generate(Role::Viewer, None, "enc").await.unwrap();
            assert_eq!(generated.secret.len(), expected_len, "{:?}", encoding);
        }
    }

    #[tokio::test]
    async fn test_unknown_key_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.generate(Role::Viewer, None, "k").await.unwrap();

        let err = store.validate("csk_not-a-real-key").await.unwrap_err();
        assert_eq!(err.code(), "KEY_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_oversized_ttl_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let err = store
            .generate(Role::Viewer, Some(Duration::days(365 * 300_000)), "forever")
            .await
            .unwrap_err();
        assert!(matches!(err, SecurityError::ValidationFailed(_)));

        // Nothing was stored and the table is still usable.
        assert_eq!(store.stats().await.total_keys, 0);
        store.generate(Role::Viewer, None, "k").await.unwrap();
    }

    #[tokio::test]
    async fn test_revoke_twice() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let generated = store.generate(Role::Admin, None, "k").await.unwrap();

        store.revoke(&generated.key.id).await.unwrap();
        let err = store.revoke(&generated.key.id).await.unwrap_err();
        assert!(matches!(err, SecurityError::KeyAlreadyRevoked(_)));

        let key = store.get(&generated.key.id).await.unwrap();
        assert_eq!(key.status, KeyStatus::Revoked);
        assert!(store.validate(&generated.secret).await.is_err());

        let err = store.revoke("missing").await.unwrap_err();
        assert!(matches!(err, SecurityError::KeyNotFound(_)));
    }

    #[tokio::test]
    async fn test_quota_per_role() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let first = store.generate(Role::Viewer, None, "1").await.unwrap();
        store.generate(Role::Viewer, None, "2").await.unwrap();

        let err = store.generate(Role::Viewer, None, "3").await.unwrap_err();
        assert!(matches!(err, SecurityError::QuotaExceeded { limit: 2, .. }));

        // Other roles have their own quota.
        store.generate(Role::Operator, None, "op").await.unwrap();

        store.revoke(&first.key.id).await.unwrap();
        store.generate(Role::Viewer, None, "3").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_key_flips_status() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let generated = store
            .generate(Role::Viewer, Some(Duration::milliseconds(30)), "short")
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        assert!(store.validate(&generated.secret).await.is_err());
        let key = store.get(&generated.key.id).await.unwrap();
        assert_eq!(key.status, KeyStatus::Expired);

        // The flip was persisted.
        let reopened = open_store(&dir).await;
        let key = reopened.get(&generated.key.id).await.unwrap();
        assert_eq!(key.status, KeyStatus::Expired);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let generated = store.generate(Role::Operator, None, "persisted").await.unwrap();
        drop(store);

        let reopened = open_store(&dir).await;
        let validated = reopened.validate(&generated.secret).await.unwrap();
        assert_eq!(validated.description, "persisted");

        let raw = std::fs::read_to_string(reopened.storage_path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value["keys"][&generated.key.id].is_object());
        assert!(!raw.contains(&generated.secret));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_permissions_restricted() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store.generate(Role::Viewer, None, "k").await.unwrap();

        let mode = std::fs::metadata(store.storage_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_corrupt_file_surfaces_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("api_keys.json");
        std::fs::write(&path, "{not json").unwrap();

        let result = ApiKeyStore::open(ApiKeyConfig {
            storage_path: path,
            ..Default::default()
        })
        .await;
        assert!(matches!(result, Err(SecurityError::PersistenceFailure(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_persistence_failure_rolls_back() {
        let dir = TempDir::new().unwrap();
        // A directory in place of the temp file makes every write fail.
        let path = dir.path().join("api_keys.json");
        std::fs::create_dir_all(dir.path().join("api_keys.json.tmp")).unwrap();

        let store = ApiKeyStore::open(ApiKeyConfig {
            storage_path: path,
            ..Default::default()
        })
        .await
        .unwrap();

        let err = store.generate(Role::Viewer, None, "k").await.unwrap_err();
        assert!(matches!(err, SecurityError::PersistenceFailure(_)));
        assert_eq!(store.stats().await.total_keys, 0);
    }

    #[tokio::test]
    async fn test_rotate() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let err = store.rotate(Role::Operator, false).await.unwrap_err();
        assert!(matches!(err, SecurityError::KeyNotFound(_)));

        let old = store.generate(Role::Operator, None, "op").await.unwrap();
        let rotated = store.rotate(Role::Operator, false).await.unwrap();

        assert_eq!(rotated.len(), 1);
        assert_eq!(
            store.get(&old.key.id).await.unwrap().status,
            KeyStatus::Revoked
        );
        assert!(store.validate(&rotated[0].secret).await.is_ok());
        assert!(store.validate(&old.secret).await.is_err());
    }

    #[tokio::test]
    async fn test_rotate_at_quota_requires_force() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store.generate(Role::Admin, None, "a").await.unwrap();
        store.generate(Role::Admin, None, "b").await.unwrap();

        let rotated = store.rotate(Role::Admin, false).await.unwrap();
        assert!(rotated.is_empty());

        let rotated = store.rotate(Role::Admin, true).await.unwrap();
        assert_eq!(rotated.len(), 2);

        let active = store
            .list(Some(Role::Admin))
            .await
            .into_iter()
            .filter(|k| k.is_valid())
            .count();
        assert_eq!(active, 2);
    }

    #[tokio::test]
    async fn test_cleanup_and_stats() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let revoked = store.generate(Role::Viewer, None, "r").await.unwrap();
        store
            .generate(Role::Operator, Some(Duration::milliseconds(20)), "e")
            .await
            .unwrap();
        store.generate(Role::Admin, None, "a").await.unwrap();
        store.revoke(&revoked.key.id).await.unwrap();
        assert_totals(&store.stats().await);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let stats = store.stats().await;
        assert_totals(&stats);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.revoked, 1);
        assert_eq!(stats.active, 1);

        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        let stats = store.stats().await;
        assert_totals(&stats);
        assert_eq!(stats.total_keys, 2);
        assert_eq!(stats.by_role.get(&Role::Operator), None);

        assert_eq!(store.list(None).await.len(), 2);
        assert_eq!(store.list(Some(Role::Viewer)).await.len(), 1);
    }
}
