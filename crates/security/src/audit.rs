//! Security audit logging.
//!
//! Events are scored, queued without blocking the caller, and written by a
//! single consumer task to the console (through `tracing`) and to
//! newline-delimited JSON files rotated by size and age.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::error::{Result, SecurityError};
use crate::rbac::Role;
use crate::task::BackgroundTask;

const FILE_PREFIX: &str = "security-audit-";
const FILE_SUFFIX: &str = ".log";

/// Methods whose use raises an event's risk score.
pub const SENSITIVE_METHODS: &[&str] = &[
    "authenticate",
    "create_api_key",
    "revoke_api_key",
    "start_recording",
    "set_retention_policy",
    "cleanup_old_files",
];

/// Types of security events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    AuthSuccess,
    AuthFailure,
    AuthorizationFailure,
    RateLimitExceeded,
    ClientBlocked,
    ValidationFailure,
    SecurityViolation,
    MethodAccess,
    SessionCreated,
    SessionInvalidated,
    ApiKeyCreated,
    ApiKeyRevoked,
}

impl SecurityEventType {
    fn base_score(&self) -> u32 {
        match self {
            SecurityEventType::AuthFailure => 20,
            SecurityEventType::AuthorizationFailure => 30,
            SecurityEventType::RateLimitExceeded | SecurityEventType::ClientBlocked => 15,
            SecurityEventType::ValidationFailure => 10,
            SecurityEventType::SecurityViolation => 50,
            _ => 0,
        }
    }
}

/// Coarse severity derived from the risk score.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            75.. => RiskLevel::Critical,
            50..=74 => RiskLevel::High,
            25..=49 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for RiskLevel {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "info" | "debug" => Ok(RiskLevel::Low),
            "medium" | "warn" | "warning" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" | "error" => Ok(RiskLevel::Critical),
            other => Err(SecurityError::Configuration(format!(
                "unknown audit level '{}'",
                other
            ))),
        }
    }
}

/// Heuristic 0-100 risk score.
pub fn risk_score(
    event_type: SecurityEventType,
    success: bool,
    role: Option<Role>,
    method: Option<&str>,
) -> u8 {
    let mut score = event_type.base_score();
    if !success {
        score += 25;
    }
    score += match role {
        Some(Role::Admin) => 20,
        Some(Role::Operator) => 10,
        _ => 0,
    };
    if method.map(|m| SENSITIVE_METHODS.contains(&m)).unwrap_or(false) {
        score += 15;
    }
    score.min(100) as u8
}

/// A security audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: SecurityEventType,
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub risk_level: RiskLevel,
    pub risk_score: u8,
    pub metadata: serde_json::Value,
}

impl SecurityEvent {
    /// Create a new event builder.
    pub fn builder(
        event_type: SecurityEventType,
        client_id: impl Into<String>,
    ) -> SecurityEventBuilder {
        SecurityEventBuilder {
            event_type,
            client_id: client_id.into(),
            subject_id: None,
            role: None,
            method: None,
            success: true,
            error_code: None,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Builder for security events.
pub struct SecurityEventBuilder {
    event_type: SecurityEventType,
    client_id: String,
    subject_id: Option<String>,
    role: Option<Role>,
    method: Option<String>,
    success: bool,
    error_code: Option<String>,
    metadata: serde_json::Value,
}

impl SecurityEventBuilder {
    pub fn subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn failure(mut self, error_code: impl Into<String>) -> Self {
        self.success = false;
        self.error_code = Some(error_code.into());
        self
    }

    pub fn build(self) -> SecurityEvent {
        let score = risk_score(
            self.event_type,
            self.success,
            self.role,
            self.method.as_deref(),
        );
        SecurityEvent {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: self.event_type,
            client_id: self.client_id,
            subject_id: self.subject_id,
            role: self.role,
            method: self.method,
            success: self.success,
            error_code: self.error_code,
            risk_level: RiskLevel::from_score(score),
            risk_score: score,
            metadata: self.metadata,
        }
    }
}

#[derive(Debug, Default)]
struct AuditCounters {
    logged: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
    written: AtomicU64,
    write_errors: AtomicU64,
    rotations: AtomicU64,
}

/// Audit log statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStats {
    pub events_logged: u64,
    pub events_dropped: u64,
    pub events_filtered: u64,
    pub events_written: u64,
    pub write_errors: u64,
    pub rotations: u64,
    pub queue_capacity: usize,
}

/// Security audit log service.
pub struct SecurityAuditLog {
    /// Async channel for non-blocking logging.
    tx: mpsc::Sender<SecurityEvent>,
    counters: Arc<AuditCounters>,
    min_level: RiskLevel,
    queue_capacity: usize,
    consumer: BackgroundTask,
}

impl SecurityAuditLog {
    /// Create the audit log and start its consumer task.
    pub fn new(config: AuditConfig) -> Self {
        let queue_capacity = config.buffer_size.max(1);
        let (tx, mut rx) = mpsc::channel::<SecurityEvent>(queue_capacity);
        let counters = Arc::new(AuditCounters::default());
        let min_level = config.min_level;

        let mut writer = AuditWriter::new(config, counters.clone());
        let consumer = BackgroundTask::spawn("audit-log", move |mut shutdown_rx| async move {
            writer.remove_stale_files().await;
            let mut rotation_check = tokio::time::interval(writer.rotation_check_period());
            rotation_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    event = rx.recv() => match event {
                        Some(event) => writer.process(event).await,
                        None => break,
                    },
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = rotation_check.tick() => writer.rotate_if_stale().await,
                }
            }

            rx.close();
            while let Ok(event) = rx.try_recv() {
                writer.process(event).await;
            }
            writer.close().await;
        });

        Self {
            tx,
            counters,
            min_level,
            queue_capacity,
            consumer,
        }
    }

    /// Queue an event (non-blocking). Dropped and counted if the queue is full.
    pub fn log(&self, event: SecurityEvent) {
        if event.risk_level < self.min_level {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.logged.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Audit log queue full, event dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Audit log closed, event dropped");
            }
        }
    }

    // Convenience methods for common audit events

    /// Log a successful authentication.
    pub fn log_auth_success(&self, client_id: &str, subject_id: &str, role: Role, via: &str) {
        self.log(
            SecurityEvent::builder(SecurityEventType::AuthSuccess, client_id)
                .subject(subject_id)
                .role(role)
                .method("authenticate")
                .metadata(serde_json::json!({ "credential": via }))
                .build(),
        );
    }

    /// Log a failed authentication with its internal reason.
    pub fn log_auth_failure(&self, client_id: &str, err: &SecurityError, via: &str) {
        self.log(
            SecurityEvent::builder(SecurityEventType::AuthFailure, client_id)
                .method("authenticate")
                .failure(err.code())
                .metadata(serde_json::json!({ "credential": via, "reason": err.to_string() }))
                .build(),
        );
    }

    /// Log a method call outcome.
    pub fn log_method_access(
        &self,
        client_id: &str,
        subject_id: Option<&str>,
        role: Option<Role>,
        method: &str,
        outcome: std::result::Result<(), &SecurityError>,
    ) {
        let event_type = match outcome {
            Ok(()) => SecurityEventType::MethodAccess,
            Err(SecurityError::AuthenticationRequired(_))
            | Err(SecurityError::InvalidToken(_))
            | Err(SecurityError::TokenExpired)
            | Err(SecurityError::SessionNotFound(_))
            | Err(SecurityError::SessionExpired(_)) => SecurityEventType::AuthFailure,
            Err(SecurityError::PermissionDenied { .. }) => SecurityEventType::AuthorizationFailure,
            Err(SecurityError::RateLimitExceeded(_)) => SecurityEventType::RateLimitExceeded,
            Err(SecurityError::ClientBlocked { .. }) => SecurityEventType::ClientBlocked,
            Err(SecurityError::ValidationFailed(_)) => SecurityEventType::ValidationFailure,
            Err(_) => SecurityEventType::MethodAccess,
        };

        let mut builder = SecurityEvent::builder(event_type, client_id).method(method);
        if let Some(subject_id) = subject_id {
            builder = builder.subject(subject_id);
        }
        if let Some(role) = role {
            builder = builder.role(role);
        }
        if let Err(err) = outcome {
            builder = builder
                .failure(err.code())
                .metadata(serde_json::json!({ "reason": err.to_string() }));
        }

        self.log(builder.build());
    }

    /// Log a rate limit rejection.
    pub fn log_rate_limit_exceeded(&self, client_id: &str, method: &str, err: &SecurityError) {
        let event_type = match err {
            SecurityError::ClientBlocked { .. } => SecurityEventType::ClientBlocked,
            _ => SecurityEventType::RateLimitExceeded,
        };
        self.log(
            SecurityEvent::builder(event_type, client_id)
                .method(method)
                .failure(err.code())
                .metadata(serde_json::json!({ "reason": err.to_string() }))
                .build(),
        );
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            events_logged: self.counters.logged.load(Ordering::Relaxed),
            events_dropped: self.counters.dropped.load(Ordering::Relaxed),
            events_filtered: self.counters.filtered.load(Ordering::Relaxed),
            events_written: self.counters.written.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
            rotations: self.counters.rotations.load(Ordering::Relaxed),
            queue_capacity: self.queue_capacity,
        }
    }

    /// Drain queued events, close the current file and stop the consumer.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.consumer.stop(deadline).await
    }
}

/// Single consumer that owns the current log file.
struct AuditWriter {
    config: AuditConfig,
    counters: Arc<AuditCounters>,
    file: Option<tokio::fs::File>,
    current_path: Option<PathBuf>,
    opened_at: Instant,
    bytes_written: u64,
    sequence: u64,
}

impl AuditWriter {
    fn new(config: AuditConfig, counters: Arc<AuditCounters>) -> Self {
        Self {
            config,
            counters,
            file: None,
            current_path: None,
            opened_at: Instant::now(),
            bytes_written: 0,
            sequence: 0,
        }
    }

    fn rotation_check_period(&self) -> Duration {
        self.config
            .rotation_interval
            .min(Duration::from_secs(60))
            .max(Duration::from_millis(10))
    }

    async fn process(&mut self, event: SecurityEvent) {
        if self.config.console_enabled {
            emit_console(&event);
        }

        if !self.config.file_enabled {
            self.counters.written.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.write_line(&event).await {
            Ok(()) => {
                self.counters.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, event_id = %event.event_id, "Failed to write audit event");
                self.file = None;
            }
        }

        if self.file.is_some() && self.bytes_written >= self.config.max_file_size {
            self.rotate().await;
        }
    }

    async fn write_line(&mut self, event: &SecurityEvent) -> std::io::Result<()> {
        if self.file.is_none() {
            self.open_new_file().await?;
        }

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        if let Some(file) = self.file.as_mut() {
            file.write_all(&line).await?;
            file.flush().await?;
            self.bytes_written += line.len() as u64;
        }
        Ok(())
    }

    async fn open_new_file(&mut self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.config.log_dir).await?;

        self.sequence += 1;
        let name = format!(
            "{}{}-{:04}{}",
            FILE_PREFIX,
            Utc::now().format("%Y%m%d-%H%M%S-%3f"),
            self.sequence,
            FILE_SUFFIX
        );
        let path = self.config.log_dir.join(name);

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        debug!(path = %path.display(), "Audit log file opened");
        self.file = Some(file);
        self.current_path = Some(path);
        self.opened_at = Instant::now();
        self.bytes_written = 0;
        Ok(())
    }

    async fn rotate_if_stale(&mut self) {
        if self.file.is_some()
            && self.bytes_written > 0
            && self.opened_at.elapsed() >= self.config.rotation_interval
        {
            self.rotate().await;
        }
    }

    /// Close the current file; the next event opens a new timestamped one.
    async fn rotate(&mut self) {
        self.close().await;
        self.counters.rotations.fetch_add(1, Ordering::Relaxed);
        self.remove_stale_files().await;
        info!(
            closed = ?self.current_path.as_ref().map(|p| p.display().to_string()),
            bytes = self.bytes_written,
            "Audit log rotated"
        );
    }

    async fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                warn!(error = %e, "Failed to flush audit log file");
            }
        }
    }

    /// Delete rotated files older than the retention age.
    async fn remove_stale_files(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.config.log_dir).await else {
            return;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if Some(&path) == self.current_path.as_ref() || !is_audit_file(&path) {
                continue;
            }

            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            let Ok(age) = SystemTime::now().duration_since(modified) else {
                continue;
            };

            if age > self.config.max_age {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => debug!(path = %path.display(), "Removed old audit log file"),
                    Err(e) => warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to remove audit log file"
                    ),
                }
            }
        }
    }
}

fn is_audit_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
        .unwrap_or(false)
}

fn emit_console(event: &SecurityEvent) {
    macro_rules! emit {
        ($level:ident) => {
            $level!(
                target: "security_audit",
                event_id = %event.event_id,
                event_type = ?event.event_type,
                client_id = %event.client_id,
                subject_id = ?event.subject_id,
                method = ?event.method,
                success = event.success,
                error_code = ?event.error_code,
                risk_score = event.risk_score,
                risk_level = %event.risk_level,
                "Security event"
            )
        };
    }

    match event.risk_level {
        RiskLevel::Low => emit!(info),
        RiskLevel::Medium | RiskLevel::High => emit!(warn),
        RiskLevel::Critical => emit!(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> AuditConfig {
        AuditConfig {
            log_dir: dir.path().join("audit"),
            console_enabled: false,
            ..Default::default()
        }
    }

    fn audit_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default();
        files.retain(|p| is_audit_file(p));
        files.sort();
        files
    }

    fn read_events(dir: &Path) -> Vec<SecurityEvent> {
        audit_files(dir)
            .iter()
            .flat_map(|p| {
                std::fs::read_to_string(p)
                    .unwrap()
                    .lines()
                    .map(|l| serde_json::from_str::<SecurityEvent>(l).unwrap())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_risk_score_components() {
        assert_eq!(risk_score(SecurityEventType::MethodAccess, true, None, None), 0);
        assert_eq!(
            risk_score(SecurityEventType::AuthFailure, false, None, None),
            45
        );
        assert_eq!(
            risk_score(
                SecurityEventType::AuthorizationFailure,
                false,
                Some(Role::Operator),
                Some("get_metrics")
            ),
            65
        );
        assert_eq!(
            risk_score(
                SecurityEventType::MethodAccess,
                true,
                Some(Role::Admin),
                Some("start_recording")
            ),
            35
        );
    }

    #[test]
    fn test_risk_score_is_bounded() {
        let score = risk_score(
            SecurityEventType::SecurityViolation,
            false,
            Some(Role::Admin),
            Some("create_api_key"),
        );
        assert_eq!(score, 100);
        assert_eq!(RiskLevel::from_score(score), RiskLevel::Critical);
    }

    #[test]
    fn test_risk_levels() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(24), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(25), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(50), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(75), RiskLevel::Critical);
        assert_eq!("warn".parse::<RiskLevel>().unwrap(), RiskLevel::Medium);
        assert!("verbose".parse::<RiskLevel>().is_err());
    }

    #[test]
    fn test_event_builder() {
        let event = SecurityEvent::builder(SecurityEventType::AuthFailure, "10.0.0.5:5000")
            .subject("user1")
            .method("authenticate")
            .failure("INVALID_TOKEN")
            .build();

        assert_eq!(event.client_id, "10.0.0.5:5000");
        assert_eq!(event.subject_id.as_deref(), Some("user1"));
        assert!(!event.success);
        assert_eq!(event.error_code.as_deref(), Some("INVALID_TOKEN"));
        assert_eq!(event.risk_score, 60);
        assert_eq!(event.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn test_events_written_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let log_dir = config.log_dir.clone();
        let audit = SecurityAuditLog::new(config);

        audit.log_auth_success("c1", "user1", Role::Viewer, "token");
        audit.log_auth_failure("c2", &SecurityError::TokenExpired, "token");
        audit.log_method_access("c1", Some("user1"), Some(Role::Viewer), "ping", Ok(()));

        audit.shutdown(Duration::from_secs(5)).await.unwrap();

        let events = read_events(&log_dir);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, SecurityEventType::AuthSuccess);
        assert_eq!(events[1].error_code.as_deref(), Some("TOKEN_EXPIRED"));
        assert_eq!(events[2].method.as_deref(), Some("ping"));

        let stats = audit.stats();
        assert_eq!(stats.events_logged, 3);
        assert_eq!(stats.events_written, 3);
        assert_eq!(stats.events_dropped, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.buffer_size = 1;
        let audit = SecurityAuditLog::new(config);

        // No await between sends: the consumer cannot drain in between.
        for _ in 0..10 {
            audit.log_rate_limit_exceeded(
                "c1",
                "take_snapshot",
                &SecurityError::RateLimitExceeded("method".to_string()),
            );
        }

        let stats = audit.stats();
        assert_eq!(stats.events_logged, 1);
        assert_eq!(stats.events_dropped, 9);

        audit.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(audit.stats().events_written, 1);
    }

    #[tokio::test]
    async fn test_min_level_filters() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.min_level = RiskLevel::Medium;
        let log_dir = config.log_dir.clone();
        let audit = SecurityAuditLog::new(config);

        audit.log_method_access("c1", Some("u"), Some(Role::Viewer), "ping", Ok(()));
        audit.log_auth_failure("c1", &SecurityError::TokenExpired, "token");

        audit.shutdown(Duration::from_secs(5)).await.unwrap();

        assert_eq!(audit.stats().events_filtered, 1);
        let events = read_events(&log_dir);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, SecurityEventType::AuthFailure);
    }

    #[tokio::test]
    async fn test_size_rotation() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.max_file_size = 100;
        let log_dir = config.log_dir.clone();
        let audit = SecurityAuditLog::new(config);

        for i in 0..5 {
            audit.log_method_access(&format!("c{}", i), None, None, "ping", Ok(()));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        audit.shutdown(Duration::from_secs(5)).await.unwrap();

        let files = audit_files(&log_dir);
        assert_eq!(files.len(), 5, "expected one file per event, got {:?}", files);
        assert_eq!(read_events(&log_dir).len(), 5);
        assert_eq!(audit.stats().rotations, 5);
    }

    #[tokio::test]
    async fn test_time_rotation() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.rotation_interval = Duration::from_millis(30);
        let log_dir = config.log_dir.clone();
        let audit = SecurityAuditLog::new(config);

        audit.log_method_access("c1", None, None, "ping", Ok(()));
        tokio::time::sleep(Duration::from_millis(120)).await;
        audit.log_method_access("c2", None, None, "ping", Ok(()));
        audit.shutdown(Duration::from_secs(5)).await.unwrap();

        assert!(audit.stats().rotations >= 1);
        assert_eq!(read_events(&log_dir).len(), 2);
    }

    #[tokio::test]
    async fn test_retention_removes_old_files() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.max_file_size = 100;
        config.max_age = Duration::ZERO;
        let log_dir = config.log_dir.clone();

        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(log_dir.join("unrelated.txt"), "keep me").unwrap();

        let audit = SecurityAuditLog::new(config);
        for i in 0..3 {
            audit.log_method_access(&format!("c{}", i), None, None, "ping", Ok(()));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        audit.shutdown(Duration::from_secs(5)).await.unwrap();

        assert_eq!(audit_files(&log_dir).len(), 1);
        assert!(log_dir.join("unrelated.txt").exists());
    }

    #[tokio::test]
    async fn test_file_disabled() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.file_enabled = false;
        let log_dir = config.log_dir.clone();
        let audit = SecurityAuditLog::new(config);

        audit.log_auth_success("c1", "user1", Role::Admin, "api_key");
        audit.shutdown(Duration::from_secs(5)).await.unwrap();

        assert!(!log_dir.exists());
        assert_eq!(audit.stats().events_written, 1);
    }

    #[tokio::test]
    async fn test_log_after_shutdown_is_dropped() {
        let dir = TempDir::new().unwrap();
        let audit = SecurityAuditLog::new(test_config(&dir));

        audit.shutdown(Duration::from_secs(5)).await.unwrap();
        audit.log_auth_success("c1", "user1", Role::Viewer, "token");

        assert_eq!(audit.stats().events_dropped, 1);
        audit.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}
