//! Configuration for the security control plane.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::audit::RiskLevel;
use crate::error::{Result, SecurityError};

/// Top-level security configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub rate_limit: RateLimitConfig,
    pub token: TokenConfig,
    pub sessions: SessionConfig,
    pub audit: AuditConfig,
    pub api_keys: ApiKeyConfig,
}

/// Token bucket settings for one method.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MethodLimit {
    /// Sustained requests per second.
    pub requests_per_second: f64,
    /// Maximum burst size.
    pub burst: u32,
}

impl MethodLimit {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        Self {
            requests_per_second,
            burst,
        }
    }
}

/// Configuration for the abuse controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per client in one window.
    pub requests_per_window: u32,
    /// Length of the per-client counting window.
    pub window: Duration,
    /// Global admission rate shared by all clients.
    pub global_requests_per_second: f64,
    /// Global burst size.
    pub global_burst: u32,
    /// Violations before a client is blocked.
    pub violation_threshold: u32,
    /// How long a block lasts.
    pub block_duration: Duration,
    /// Interval of the background cleanup sweep.
    pub cleanup_interval: Duration,
    /// Inactivity age after which client state is dropped.
    pub max_client_age: Duration,
    /// Per-method token buckets.
    pub method_limits: HashMap<String, MethodLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut method_limits = HashMap::new();
        method_limits.insert("take_snapshot".to_string(), MethodLimit::new(2.0, 5));
        method_limits.insert("start_recording".to_string(), MethodLimit::new(1.0, 3));
        method_limits.insert("create_api_key".to_string(), MethodLimit::new(0.2, 2));

        Self {
            requests_per_window: 100,
            window: Duration::from_secs(60),
            global_requests_per_second: 1000.0,
            global_burst: 2000,
            violation_threshold: 10,
            block_duration: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            max_client_age: Duration::from_secs(60 * 60),
            method_limits,
        }
    }
}

/// Configuration for bearer token issuance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Secret key for signing tokens.
    pub secret: String,
    /// Token expiry used when no positive TTL is requested.
    pub expiry_hours: i64,
    /// Requests allowed per client per velocity window.
    pub velocity_limit: u32,
    /// Length of the velocity window.
    pub velocity_window: Duration,
    /// Inactivity horizon after which velocity entries are purged.
    pub velocity_horizon: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: "change-me-in-production".to_string(),
            expiry_hours: 24,
            velocity_limit: 60,
            velocity_window: Duration::from_secs(60),
            velocity_horizon: Duration::from_secs(60 * 60),
        }
    }
}

/// Configuration for stateful sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session lifetime.
    pub timeout: Duration,
    /// Interval of the expiry sweep.
    pub sweep_interval: Duration,
    /// Extend expiry on every touch instead of keeping it fixed.
    pub sliding_expiry: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            sliding_expiry: true,
        }
    }
}

/// Configuration for the security audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory holding the rotated log files.
    pub log_dir: PathBuf,
    /// Rotate once the current file reaches this many bytes.
    pub max_file_size: u64,
    /// Delete rotated files older than this.
    pub max_age: Duration,
    /// Rotate once the current file is this old.
    pub rotation_interval: Duration,
    /// Capacity of the event queue.
    pub buffer_size: usize,
    pub file_enabled: bool,
    pub console_enabled: bool,
    /// Events below this risk level are not recorded.
    pub min_level: RiskLevel,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs/security"),
            max_file_size: 100 * 1024 * 1024,
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
            rotation_interval: Duration::from_secs(24 * 60 * 60),
            buffer_size: 1000,
            file_enabled: true,
            console_enabled: true,
            min_level: RiskLevel::Low,
        }
    }
}

/// Text encoding of generated API key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyEncoding {
    Hex,
    Base64,
    Base64Url,
}

impl FromStr for KeyEncoding {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hex" => Ok(KeyEncoding::Hex),
            "base64" => Ok(KeyEncoding::Base64),
            "base64url" | "base64_url" => Ok(KeyEncoding::Base64Url),
            other => Err(SecurityError::Configuration(format!(
                "unknown key encoding '{}'",
                other
            ))),
        }
    }
}

/// Configuration for the API key store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// Path of the JSON key file.
    pub storage_path: PathBuf,
    /// Number of random bytes per key.
    pub key_length: usize,
    pub encoding: KeyEncoding,
    /// Optional prefix prepended to every key.
    pub prefix: Option<String>,
    /// Maximum active keys per role.
    pub max_keys_per_role: usize,
    /// Record last use and usage counts on validation.
    pub usage_tracking: bool,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("data/api_keys.json"),
            key_length: 32,
            encoding: KeyEncoding::Hex,
            prefix: Some("csk_".to_string()),
            max_keys_per_role: 10,
            usage_tracking: true,
        }
    }
}

impl SecurityConfig {
    /// Load configuration from environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(secret) = env::var("JWT_SECRET_KEY") {
            config.token.secret = secret;
        }
        config.token.expiry_hours = env_parse("JWT_EXPIRY_HOURS").unwrap_or(24);

        let rl = &mut config.rate_limit;
        rl.requests_per_window =
            env_parse("RATE_LIMIT_REQUESTS_PER_MINUTE").unwrap_or(rl.requests_per_window);
        if let Some(secs) = env_parse::<u64>("RATE_LIMIT_WINDOW_SECS") {
            rl.window = Duration::from_secs(secs);
        }
        rl.violation_threshold =
            env_parse("RATE_LIMIT_VIOLATION_THRESHOLD").unwrap_or(rl.violation_threshold);
        if let Some(secs) = env_parse::<u64>("RATE_LIMIT_BLOCK_SECS") {
            rl.block_duration = Duration::from_secs(secs);
        }

        if let Some(secs) = env_parse::<u64>("SESSION_TIMEOUT_SECS") {
            config.sessions.timeout = Duration::from_secs(secs);
        }

        let audit = &mut config.audit;
        if let Ok(dir) = env::var("AUDIT_LOG_DIR") {
            audit.log_dir = PathBuf::from(dir);
        }
        audit.max_file_size = env_parse("AUDIT_MAX_FILE_SIZE").unwrap_or(audit.max_file_size);
        if let Some(days) = env_parse::<u64>("AUDIT_MAX_AGE_DAYS") {
            audit.max_age = Duration::from_secs(days * 24 * 60 * 60);
        }
        if let Some(hours) = env_parse::<u64>("AUDIT_ROTATION_HOURS") {
            audit.rotation_interval = Duration::from_secs(hours * 60 * 60);
        }
        audit.buffer_size = env_parse("AUDIT_BUFFER_SIZE").unwrap_or(audit.buffer_size);
        audit.file_enabled = env_flag("AUDIT_FILE_ENABLED").unwrap_or(audit.file_enabled);
        audit.console_enabled =
            env_flag("AUDIT_CONSOLE_ENABLED").unwrap_or(audit.console_enabled);
        if let Ok(level) = env::var("AUDIT_LEVEL") {
            audit.min_level = level.parse()?;
        }

        let keys = &mut config.api_keys;
        if let Ok(path) = env::var("API_KEY_STORAGE_PATH") {
            keys.storage_path = PathBuf::from(path);
        }
        keys.key_length = env_parse("API_KEY_LENGTH").unwrap_or(keys.key_length);
        if let Ok(encoding) = env::var("API_KEY_ENCODING") {
            keys.encoding = encoding.parse()?;
        }
        if let Ok(prefix) = env::var("API_KEY_PREFIX") {
            keys.prefix = if prefix.is_empty() { None } else { Some(prefix) };
        }
        keys.max_keys_per_role =
            env_parse("API_KEY_MAX_PER_ROLE").unwrap_or(keys.max_keys_per_role);
        keys.usage_tracking = env_flag("API_KEY_USAGE_TRACKING").unwrap_or(keys.usage_tracking);

        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.token.secret.trim().is_empty() {
            return Err(SecurityError::Configuration(
                "token secret must not be empty".to_string(),
            ));
        }
        if self.rate_limit.requests_per_window == 0 || self.rate_limit.window.is_zero() {
            return Err(SecurityError::Configuration(
                "rate limit window must allow at least one request".to_string(),
            ));
        }
        if self.rate_limit.global_requests_per_second <= 0.0 || self.rate_limit.global_burst == 0
        {
            return Err(SecurityError::Configuration(
                "global rate limit must be positive".to_string(),
            ));
        }
        if self.audit.buffer_size == 0 {
            return Err(SecurityError::Configuration(
                "audit buffer size must be positive".to_string(),
            ));
        }
        if self.api_keys.key_length == 0 {
            return Err(SecurityError::Configuration(
                "API key length must be positive".to_string(),
            ));
        }
        if self.sessions.sweep_interval.is_zero() || self.rate_limit.cleanup_interval.is_zero() {
            return Err(SecurityError::Configuration(
                "sweep intervals must be positive".to_string(),
            ));
        }
        let max_hours = (MAX_LIFETIME.as_secs() / 3600) as i64;
        if self.token.expiry_hours > max_hours
            || self.sessions.timeout > MAX_LIFETIME
            || self.rate_limit.block_duration > MAX_LIFETIME
        {
            return Err(SecurityError::Configuration(
                "token expiry, session timeout and block duration must not exceed 100 years"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Longest lifetime accepted for tokens, sessions and client blocks.
const MAX_LIFETIME: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| matches!(v.trim(), "true" | "1" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SecurityConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.token.expiry_hours, 24);
        assert_eq!(config.rate_limit.violation_threshold, 10);
        assert_eq!(config.rate_limit.block_duration, Duration::from_secs(300));
    }

    #[test]
    fn test_empty_secret_rejected() {
        let mut config = SecurityConfig::default();
        config.token.secret = "  ".to_string();

        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let mut config = SecurityConfig::default();
        config.audit.buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_lifetimes_rejected() {
        let mut config = SecurityConfig::default();
        config.token.expiry_hours = i64::MAX;
        assert_eq!(config.validate().unwrap_err().code(), "CONFIGURATION_ERROR");

        let mut config = SecurityConfig::default();
        config.sessions.timeout = Duration::from_secs(u64::MAX);
        assert!(config.validate().is_err());

        let mut config = SecurityConfig::default();
        config.rate_limit.block_duration = Duration::MAX;
        assert!(config.validate().is_err());

        let mut config = SecurityConfig::default();
        config.token.expiry_hours = 24 * 365 * 10;
        config.sessions.timeout = Duration::from_secs(10 * 365 * 24 * 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_key_encoding_parse() {
        assert_eq!("hex".parse::<KeyEncoding>().unwrap(), KeyEncoding::Hex);
        assert_eq!("BASE64".parse::<KeyEncoding>().unwrap(), KeyEncoding::Base64);
        assert_eq!(
            "base64url".parse::<KeyEncoding>().unwrap(),
            KeyEncoding::Base64Url
        );
        assert!("rot13".parse::<KeyEncoding>().is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = SecurityConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SecurityConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.api_keys.prefix.as_deref(), Some("csk_"));
        assert_eq!(
            parsed.rate_limit.method_limits.get("take_snapshot"),
            Some(&MethodLimit::new(2.0, 5))
        );
    }
}
