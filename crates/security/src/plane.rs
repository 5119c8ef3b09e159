//! Assembly of the security control plane.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api_key::ApiKeyStore;
use crate::audit::SecurityAuditLog;
use crate::config::SecurityConfig;
use crate::error::Result;
use crate::identity::{Authenticator, Credential};
use crate::jwt::TokenService;
use crate::rate_limit::AbuseController;
use crate::rbac::PermissionEngine;
use crate::registry::{MethodSecurityRegistry, Params};
use crate::session::SessionRegistry;
use crate::task::BackgroundTask;

/// All security components, sharing one lifetime.
pub struct SecurityPlane {
    /// Bearer token issuance and velocity tracking.
    pub tokens: Arc<TokenService>,
    /// Long-lived API keys.
    pub api_keys: Arc<ApiKeyStore>,
    /// Method to minimum role matrix.
    pub permissions: Arc<PermissionEngine>,
    /// Optional stateful sessions.
    pub sessions: Arc<SessionRegistry>,
    /// Per-client, per-method and global throttles.
    pub limiter: Arc<AbuseController>,
    /// Risk-scored audit trail.
    pub audit: Arc<SecurityAuditLog>,
    /// Guarded method handlers.
    pub registry: Arc<MethodSecurityRegistry>,
    /// Credential resolution.
    pub authenticator: Authenticator,
    velocity_purge: BackgroundTask,
}

impl SecurityPlane {
    /// Validate `config`, build every component and start background tasks.
    pub async fn start(config: SecurityConfig) -> Result<Self> {
        config.validate()?;

        let tokens = Arc::new(TokenService::new(&config.token));
        let api_keys = Arc::new(ApiKeyStore::open(config.api_keys.clone()).await?);
        let permissions = Arc::new(PermissionEngine::new());
        let sessions = Arc::new(SessionRegistry::new(&config.sessions));
        let limiter = Arc::new(AbuseController::new(config.rate_limit.clone()));
        let audit = Arc::new(SecurityAuditLog::new(config.audit.clone()));

        let registry = Arc::new(MethodSecurityRegistry::new(
            permissions.clone(),
            limiter.clone(),
            audit.clone(),
        ));
        let authenticator = Authenticator::new(
            tokens.clone(),
            api_keys.clone(),
            sessions.clone(),
            audit.clone(),
        );

        let horizon = config.token.velocity_horizon;
        let purge_tokens = tokens.clone();
        let velocity_purge = BackgroundTask::spawn_periodic(
            "velocity-purge",
            config.rate_limit.cleanup_interval,
            move || {
                let tokens = purge_tokens.clone();
                async move {
                    tokens.purge_inactive(horizon).await;
                }
            },
        );

        info!(
            key_store = %api_keys.storage_path().display(),
            audit_dir = %config.audit.log_dir.display(),
            "Security plane started"
        );

        Ok(Self {
            tokens,
            api_keys,
            permissions,
            sessions,
            limiter,
            audit,
            registry,
            authenticator,
            velocity_purge,
        })
    }

    /// Resolve the caller's credential and dispatch the method call.
    pub async fn handle_call(
        &self,
        client_id: &str,
        credential: Credential,
        method: &str,
        params: Params,
    ) -> Result<Value> {
        let caller = self.authenticator.authenticate(client_id, credential).await?;
        self.registry.dispatch(method, params, caller).await
    }

    /// Stop every background task. The audit log stops last so events
    /// produced while shutting down are still drained.
    ///
    /// All tasks are asked to stop even if one misses the deadline; the
    /// first failure is returned.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let results = [
            self.velocity_purge.stop(deadline).await,
            self.sessions.stop(deadline).await,
            self.limiter.stop(deadline).await,
            self.audit.shutdown(deadline).await,
        ];

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Security plane shutdown step failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Security plane stopped");
                Ok(())
            }
        }
    }
}
