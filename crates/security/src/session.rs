//! Stateful sessions with expiry sweeping.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{Result, SecurityError};
use crate::rbac::Role;
use crate::task::BackgroundTask;

/// A session bound to one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub subject_id: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    /// The single expiry predicate shared by validation and sweeping.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Session counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total: usize,
    /// Past expiry but not yet swept.
    pub expired_pending: usize,
    pub subjects: usize,
    pub by_role: HashMap<Role, usize>,
    pub swept_total: u64,
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: HashMap<String, Session>,
    swept_total: u64,
}

impl SessionTable {
    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired_at(now));
        let removed = before - self.sessions.len();
        self.swept_total += removed as u64;
        removed
    }
}

/// Registry of live sessions.
pub struct SessionRegistry {
    table: Arc<RwLock<SessionTable>>,
    timeout: Duration,
    sliding_expiry: bool,
    sweeper: BackgroundTask,
}

impl SessionRegistry {
    /// Create a registry and start its expiry sweep.
    pub fn new(config: &SessionConfig) -> Self {
        let table = Arc::new(RwLock::new(SessionTable::default()));

        let sweep_table = table.clone();
        let sweeper =
            BackgroundTask::spawn_periodic("session-sweep", config.sweep_interval, move || {
                let table = sweep_table.clone();
                async move {
                    let removed = table.write().await.sweep(Utc::now());
                    if removed > 0 {
                        info!(removed, "Expired sessions swept");
                    }
                }
            });

        Self {
            table,
            timeout: Duration::from_std(config.timeout).unwrap_or_else(|_| Duration::hours(24)),
            sliding_expiry: config.sliding_expiry,
            sweeper,
        }
    }

    /// Create a session for a subject.
    pub async fn create(&self, subject_id: &str, role: Role) -> Result<Session> {
        if subject_id.trim().is_empty() {
            return Err(SecurityError::ValidationFailed(
                "subject id must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let expires_at = now.checked_add_signed(self.timeout).ok_or_else(|| {
            SecurityError::Configuration("session timeout out of range".to_string())
        })?;
        let session = Session {
            session_id: Uuid::new_v4().simple().to_string(),
            subject_id: subject_id.to_string(),
            role,
            created_at: now,
            expires_at,
            last_activity_at: now,
        };

        self.table
            .write()
            .await
            .sessions
            .insert(session.session_id.clone(), session.clone());

        debug!(subject_id = %subject_id, role = %role, "Session created");
        Ok(session)
    }

    /// Validate a session and record activity on it.
    pub async fn validate(&self, session_id: &str) -> Result<Session> {
        let now = Utc::now();
        let mut table = self.table.write().await;

        let expired = match table.sessions.get(session_id) {
            None => return Err(SecurityError::SessionNotFound(session_id.to_string())),
            Some(session) => session.is_expired_at(now),
        };

        if expired {
            table.sessions.remove(session_id);
            debug!(session_id = %session_id, "Session expired on validation");
            return Err(SecurityError::SessionExpired(session_id.to_string()));
        }

        let session = table
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SecurityError::SessionNotFound(session_id.to_string()))?;
        self.apply_touch(session, now);
        Ok(session.clone())
    }

    /// Record activity on a session.
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        self.validate(session_id).await.map(|_| ())
    }

    /// All sessions of a subject.
    pub async fn sessions_for(&self, subject_id: &str) -> Vec<Session> {
        let table = self.table.read().await;
        table
            .sessions
            .values()
            .filter(|s| s.subject_id == subject_id)
            .cloned()
            .collect()
    }

    /// Destroy one session.
    pub async fn invalidate(&self, session_id: &str) -> Result<()> {
        match self.table.write().await.sessions.remove(session_id) {
            Some(session) => {
                debug!(subject_id = %session.subject_id, "Session invalidated");
                Ok(())
            }
            None => Err(SecurityError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Destroy every session of a subject. Returns how many were removed.
    pub async fn invalidate_all_for(&self, subject_id: &str) -> Result<usize> {
        if subject_id.trim().is_empty() {
            return Err(SecurityError::ValidationFailed(
                "subject id must not be empty".to_string(),
            ));
        }

        let mut table = self.table.write().await;
        let before = table.sessions.len();
        table.sessions.retain(|_, s| s.subject_id != subject_id);
        let removed = before - table.sessions.len();

        info!(subject_id = %subject_id, removed, "Sessions invalidated for subject");
        Ok(removed)
    }

    /// Number of stored sessions.
    pub async fn count(&self) -> usize {
        self.table.read().await.sessions.len()
    }

    pub async fn stats(&self) -> SessionStats {
        let now = Utc::now();
        let table = self.table.read().await;
        let mut stats = SessionStats {
            total: table.sessions.len(),
            swept_total: table.swept_total,
            ..Default::default()
        };

        let mut subjects = std::collections::HashSet::new();
        for session in table.sessions.values() {
            if session.is_expired_at(now) {
                stats.expired_pending += 1;
            }
            subjects.insert(session.subject_id.as_str());
            *stats.by_role.entry(session.role).or_default() += 1;
        }
        stats.subjects = subjects.len();

        stats
    }

    /// Run one sweep immediately.
    pub async fn sweep_now(&self) -> usize {
        self.table.write().await.sweep(Utc::now())
    }

    /// Stop the background sweep, waiting at most `deadline`.
    pub async fn stop(&self, deadline: StdDuration) -> Result<()> {
        self.sweeper.stop(deadline).await
    }

    fn apply_touch(&self, session: &mut Session, now: DateTime<Utc>) {
        session.last_activity_at = now;
        if self.sliding_expiry {
            if let Some(expires_at) = now.checked_add_signed(self.timeout) {
                session.expires_at = expires_at;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry(timeout_ms: u64, sweep_ms: u64, sliding: bool) -> SessionRegistry {
        SessionRegistry::new(&SessionConfig {
            timeout: StdDuration::from_millis(timeout_ms),
            sweep_interval: StdDuration::from_millis(sweep_ms),
            sliding_expiry: sliding,
        })
    }

    #[tokio::test]
    async fn test_create_and_validate() {
        let registry = test_registry(60_000, 60_000, true);

        let session = registry.create("user1", Role::Operator).await.unwrap();
        assert_eq!(session.session_id.len(), 32);
        assert!(session.expires_at > session.created_at);

        let validated = registry.validate(&session.session_id).await.unwrap();
        assert_eq!(validated.subject_id, "user1");
        assert_eq!(validated.role, Role::Operator);
        assert!(validated.last_activity_at >= session.last_activity_at);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_blank_subject_rejected() {
        let registry = test_registry(60_000, 60_000, true);
        let err = registry.create(" ", Role::Viewer).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn test_timeout_past_calendar_range_rejected() {
        let registry = test_registry(365 * 290_000 * 86_400 * 1000, 60_000, true);

        let err = registry.create("user1", Role::Viewer).await.unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let registry = test_registry(60_000, 60_000, true);
        let err = registry.validate("nope").await.unwrap_err();
        assert!(matches!(err, SecurityError::SessionNotFound(_)));
        assert!(registry.touch("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_expiry_and_sweep() {
        let registry = test_registry(50, 30, false);

        registry.create("user1", Role::Viewer).await.unwrap();
        let session = registry.create("user2", Role::Viewer).await.unwrap();
        assert!(registry.validate(&session.session_id).await.is_ok());
        assert_eq!(registry.count().await, 2);

        // Timeout plus at least one sweep cycle.
        tokio::time::sleep(StdDuration::from_millis(150)).await;

        assert_eq!(registry.count().await, 0);
        let err = registry.validate(&session.session_id).await.unwrap_err();
        assert!(matches!(err, SecurityError::SessionNotFound(_)));
        assert_eq!(registry.stats().await.swept_total, 2);

        registry.stop(StdDuration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_rejects_expired_before_sweep() {
        let registry = test_registry(20, 60_000, false);
        let session = registry.create("user1", Role::Admin).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(registry.stats().await.expired_pending, 1);

        let err = registry.validate(&session.session_id).await.unwrap_err();
        assert!(matches!(err, SecurityError::SessionExpired(_)));
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_sliding_expiry_extends() {
        let registry = test_registry(80, 60_000, true);
        let session = registry.create("user1", Role::Viewer).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(StdDuration::from_millis(40)).await;
            registry.touch(&session.session_id).await.unwrap();
        }

        let validated = registry.validate(&session.session_id).await.unwrap();
        assert!(validated.expires_at > session.expires_at);
    }

    #[tokio::test]
    async fn test_fixed_expiry_does_not_extend() {
        let registry = test_registry(60_000, 60_000, false);
        let session = registry.create("user1", Role::Viewer).await.unwrap();

        let validated = registry.validate(&session.session_id).await.unwrap();
        assert_eq!(validated.expires_at, session.expires_at);
    }

    #[tokio::test]
    async fn test_multiple_sessions_per_subject() {
        let registry = test_registry(60_000, 60_000, true);

        let a = registry.create("user1", Role::Viewer).await.unwrap();
        registry.create("user1", Role::Viewer).await.unwrap();
        registry.create("user2", Role::Admin).await.unwrap();

        assert_eq!(registry.sessions_for("user1").await.len(), 2);
        let stats = registry.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.subjects, 2);
        assert_eq!(stats.by_role.get(&Role::Viewer), Some(&2));

        registry.invalidate(&a.session_id).await.unwrap();
        assert!(registry.invalidate(&a.session_id).await.is_err());

        assert_eq!(registry.invalidate_all_for("user1").await.unwrap(), 1);
        assert_eq!(registry.invalidate_all_for("user1").await.unwrap(), 0);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_stop_idempotent() {
        let registry = test_registry(60_000, 10, true);

        registry.stop(StdDuration::from_secs(1)).await.unwrap();
        registry.stop(StdDuration::from_secs(1)).await.unwrap();

        // Sessions still work without the sweep.
        let session = registry.create("user1", Role::Viewer).await.unwrap();
        assert!(registry.validate(&session.session_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_deadline_exceeded_while_table_locked() {
        let registry = test_registry(60_000, 10, true);

        // Hold the table so an in-flight sweep cannot finish.
        let guard = registry.table.write().await;
        tokio::time::sleep(StdDuration::from_millis(30)).await;

        let err = registry.stop(StdDuration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, SecurityError::DeadlineExceeded(_)));
        drop(guard);

        registry.stop(StdDuration::from_millis(20)).await.unwrap();
    }
}
