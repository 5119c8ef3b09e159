//! Method security registry.
//!
//! Each registered method is wrapped in an ordered guard pipeline:
//! authentication, then (for methods above the lowest role) role
//! sufficiency. [`MethodSecurityRegistry::dispatch`] adds the abuse
//! controller and auditing around the guarded call.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::audit::SecurityAuditLog;
use crate::error::{Result, SecurityError};
use crate::identity::CallerIdentity;
use crate::rate_limit::AbuseController;
use crate::rbac::{PermissionEngine, Role};

/// Call parameters as received from the transport layer.
pub type Params = serde_json::Map<String, Value>;

/// Boxed handler future.
pub type HandlerFuture = BoxFuture<'static, Result<Value>>;

/// Shared method handler.
pub type Handler = Arc<dyn Fn(Params, CallerIdentity) -> HandlerFuture + Send + Sync>;

/// Box an async function into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Params, CallerIdentity) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |params, caller| f(params, caller).boxed())
}

/// A single pre-dispatch check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "guard", content = "role", rename_all = "snake_case")]
pub enum Guard {
    Authenticated,
    MinimumRole(Role),
}

impl Guard {
    fn check(&self, method: &str, caller: &CallerIdentity) -> Result<()> {
        match self {
            Guard::Authenticated => {
                if caller.authenticated && caller.role.is_some() {
                    Ok(())
                } else {
                    Err(SecurityError::AuthenticationRequired(format!(
                        "'{}' requires an authenticated caller",
                        method
                    )))
                }
            }
            Guard::MinimumRole(required) => match caller.role {
                Some(role) if role.satisfies(*required) => Ok(()),
                _ => Err(SecurityError::PermissionDenied {
                    method: method.to_string(),
                    required: required.to_string(),
                }),
            },
        }
    }
}

/// A handler wrapped in its guard pipeline.
#[derive(Clone)]
pub struct GuardedHandler {
    method: String,
    required_role: Role,
    guards: Vec<Guard>,
    inner: Handler,
}

impl GuardedHandler {
    fn new(method: String, handler: Handler, required_role: Role) -> Self {
        let mut guards = vec![Guard::Authenticated];
        if required_role > Role::Viewer {
            guards.push(Guard::MinimumRole(required_role));
        }

        Self {
            method,
            required_role,
            guards,
            inner: handler,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn required_role(&self) -> Role {
        self.required_role
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    /// Run the guards in order, stopping at the first rejection.
    pub fn check(&self, caller: &CallerIdentity) -> Result<()> {
        self.guards
            .iter()
            .try_for_each(|guard| guard.check(&self.method, caller))
    }

    /// Check the guards, then invoke the inner handler.
    ///
    /// A panicking handler is reported as an internal error.
    pub async fn call(&self, params: Params, caller: CallerIdentity) -> Result<Value> {
        self.check(&caller)?;

        let inner = self.inner.clone();
        let future = std::panic::catch_unwind(AssertUnwindSafe(move || inner(params, caller)))
            .map_err(|_| self.handler_panicked())?;

        AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .map_err(|_| self.handler_panicked())?
    }

    fn handler_panicked(&self) -> SecurityError {
        error!(method = %self.method, "Method handler panicked");
        SecurityError::Internal(format!("handler for '{}' failed", self.method))
    }
}

impl std::fmt::Debug for GuardedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedHandler")
            .field("method", &self.method)
            .field("required_role", &self.required_role)
            .field("guards", &self.guards)
            .finish_non_exhaustive()
    }
}

/// Registration metadata for a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub method: String,
    pub required_role: Role,
    pub guards: Vec<Guard>,
}

/// Registry of guarded method handlers.
pub struct MethodSecurityRegistry {
    methods: Arc<RwLock<HashMap<String, GuardedHandler>>>,
    permissions: Arc<PermissionEngine>,
    limiter: Arc<AbuseController>,
    audit: Arc<SecurityAuditLog>,
}

impl MethodSecurityRegistry {
    pub fn new(
        permissions: Arc<PermissionEngine>,
        limiter: Arc<AbuseController>,
        audit: Arc<SecurityAuditLog>,
    ) -> Self {
        Self {
            methods: Arc::new(RwLock::new(HashMap::new())),
            permissions,
            limiter,
            audit,
        }
    }

    /// Register a handler. A duplicate name is rejected and the first
    /// registration stays in place.
    pub async fn register(
        &self,
        method: &str,
        handler: Handler,
        required_role: Role,
    ) -> Result<()> {
        let method = method.trim();
        if method.is_empty() {
            return Err(SecurityError::ValidationFailed(
                "method name must not be empty".to_string(),
            ));
        }

        {
            let mut methods = self.methods.write().await;
            if methods.contains_key(method) {
                warn!(method = %method, "Duplicate method registration rejected");
                return Err(SecurityError::MethodAlreadyRegistered(method.to_string()));
            }
            methods.insert(
                method.to_string(),
                GuardedHandler::new(method.to_string(), handler, required_role),
            );
        }

        self.permissions.add_permission(method, required_role).await;
        info!(method = %method, required_role = %required_role, "Method registered");
        Ok(())
    }

    pub async fn resolve(&self, method: &str) -> Option<GuardedHandler> {
        self.methods.read().await.get(method).cloned()
    }

    /// Registered method names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn describe(&self, method: &str) -> Result<MethodDescriptor> {
        let methods = self.methods.read().await;
        let guarded = methods
            .get(method)
            .ok_or_else(|| SecurityError::MethodNotFound(method.to_string()))?;

        Ok(MethodDescriptor {
            method: guarded.method.clone(),
            required_role: guarded.required_role,
            guards: guarded.guards.clone(),
        })
    }

    /// Authorize, rate-limit and invoke `method` for `caller`.
    ///
    /// Every rejection is audited with full detail; the returned error is
    /// the typed taxonomy error whose public form carries no detail.
    ///
    /// Unauthenticated callers meet the abuse controller before anything
    /// else, so a flood of anonymous calls ends in a block instead of an
    /// unbounded stream of authentication failures.
    pub async fn dispatch(
        &self,
        method: &str,
        params: Params,
        caller: CallerIdentity,
    ) -> Result<Value> {
        if !caller.authenticated {
            self.rate_limit(method, &caller).await?;
        }

        let Some(guarded) = self.resolve(method).await else {
            let err = SecurityError::MethodNotFound(method.to_string());
            self.audit_outcome(&caller, method, Err(&err));
            return Err(err);
        };

        if let Err(err) = guarded.check(&caller) {
            warn!(
                method = %method,
                client_id = %caller.client_id,
                error = %err,
                "Method call rejected"
            );
            self.audit_outcome(&caller, method, Err(&err));
            return Err(err);
        }

        self.rate_limit(method, &caller).await?;

        debug!(method = %method, client_id = %caller.client_id, "Dispatching method");
        let audit_caller = caller.clone();
        let result = guarded.call(params, caller).await;
        self.audit_outcome(&audit_caller, method, result.as_ref().map(|_| ()));
        result
    }

    async fn rate_limit(&self, method: &str, caller: &CallerIdentity) -> Result<()> {
        self.limiter
            .check(method, &caller.client_id)
            .await
            .inspect_err(|err| self.audit.log_rate_limit_exceeded(&caller.client_id, method, err))
    }

    fn audit_outcome(
        &self,
        caller: &CallerIdentity,
        method: &str,
        outcome: std::result::Result<(), &SecurityError>,
    ) {
        self.audit.log_method_access(
            &caller.client_id,
            caller.subject_id.as_deref(),
            caller.role,
            method,
            outcome,
        );
    }
}
