//! Caller identity resolution.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::api_key::ApiKeyStore;
use crate::audit::SecurityAuditLog;
use crate::error::{Result, SecurityError};
use crate::jwt::TokenService;
use crate::rbac::Role;
use crate::session::SessionRegistry;

/// Identity attached to every guarded method call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// Transport-level client identifier (connection id or peer address).
    pub client_id: String,
    pub subject_id: Option<String>,
    pub role: Option<Role>,
    pub authenticated: bool,
}

impl CallerIdentity {
    /// Identity for a caller that presented no credential.
    pub fn anonymous(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            subject_id: None,
            role: None,
            authenticated: false,
        }
    }

    pub fn authenticated(
        client_id: impl Into<String>,
        subject_id: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            subject_id: Some(subject_id.into()),
            role: Some(role),
            authenticated: true,
        }
    }
}

/// A credential presented by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
    Session(String),
    None,
}

impl Credential {
    /// Parse an `Authorization`-style value: `Bearer <jwt>`, `ApiKey <key>`
    /// or `Session <id>`.
    pub fn parse(value: Option<&str>) -> Result<Self> {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(Credential::None);
        };

        let (scheme, material) = value.split_once(' ').ok_or_else(|| {
            SecurityError::AuthenticationRequired(
                "expected '<scheme> <credential>'".to_string(),
            )
        })?;
        let material = material.trim();
        if material.is_empty() {
            return Err(SecurityError::AuthenticationRequired(
                "empty credential".to_string(),
            ));
        }

        match scheme.to_ascii_lowercase().as_str() {
            "bearer" => Ok(Credential::Bearer(material.to_string())),
            "apikey" => Ok(Credential::ApiKey(material.to_string())),
            "session" => Ok(Credential::Session(material.to_string())),
            other => Err(SecurityError::AuthenticationRequired(format!(
                "unsupported scheme '{}'",
                other
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Credential::Bearer(_) => "token",
            Credential::ApiKey(_) => "api_key",
            Credential::Session(_) => "session",
            Credential::None => "none",
        }
    }
}

/// Resolves presented credentials into caller identities.
#[derive(Clone)]
pub struct Authenticator {
    tokens: Arc<TokenService>,
    api_keys: Arc<ApiKeyStore>,
    sessions: Arc<SessionRegistry>,
    audit: Arc<SecurityAuditLog>,
}

impl Authenticator {
    pub fn new(
        tokens: Arc<TokenService>,
        api_keys: Arc<ApiKeyStore>,
        sessions: Arc<SessionRegistry>,
        audit: Arc<SecurityAuditLog>,
    ) -> Self {
        Self {
            tokens,
            api_keys,
            sessions,
            audit,
        }
    }

    /// Resolve `credential` for `client_id`.
    ///
    /// An absent credential yields an anonymous identity; the authentication
    /// gate rejects it for every guarded method. Presented credentials go
    /// through the velocity check first, and every outcome is audited.
    pub async fn authenticate(
        &self,
        client_id: &str,
        credential: Credential,
    ) -> Result<CallerIdentity> {
        if credential == Credential::None {
            return Ok(CallerIdentity::anonymous(client_id));
        }
        let via = credential.kind();

        if !self.tokens.check_velocity(client_id).await {
            let err = SecurityError::RateLimitExceeded("authentication velocity".to_string());
            warn!(client_id = %client_id, "Authentication velocity limit exceeded");
            self.audit.log_rate_limit_exceeded(client_id, "authenticate", &err);
            return Err(err);
        }
        self.tokens.record(client_id).await;

        let resolved = match &credential {
            Credential::Bearer(token) => self
                .tokens
                .verify(token)
                .map(|claims| (claims.user_id, claims.role)),
            Credential::ApiKey(secret) => self
                .api_keys
                .validate(secret)
                .await
                .map(|key| (key.id, key.role)),
            Credential::Session(session_id) => self
                .sessions
                .validate(session_id)
                .await
                .map(|session| (session.subject_id, session.role)),
            Credential::None => Err(SecurityError::AuthenticationRequired(
                "no credential presented".to_string(),
            )),
        };

        match resolved {
            Ok((subject_id, role)) => {
                debug!(
                    client_id = %client_id,
                    subject_id = %subject_id,
                    role = %role,
                    via,
                    "Caller authenticated"
                );
                self.audit.log_auth_success(client_id, &subject_id, role, via);
                Ok(CallerIdentity::authenticated(client_id, subject_id, role))
            }
            Err(err) => {
                debug!(client_id = %client_id, via, error = %err, "Authentication failed");
                self.audit.log_auth_failure(client_id, &err, via);
                Err(match (&credential, err) {
                    // Unknown, revoked and expired keys look the same to the caller.
                    (Credential::ApiKey(_), _) => {
                        SecurityError::AuthenticationRequired("invalid API key".to_string())
                    }
                    (_, err) => err,
                })
            }
        }
    }
}
