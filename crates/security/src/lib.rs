//! Security control plane
//!
//! Bearer tokens, API keys, RBAC, sessions, abuse control, audit logging,
//! and the method security registry that gates every camera API call.

pub mod api_key;
pub mod audit;
pub mod config;
pub mod error;
pub mod identity;
pub mod jwt;
pub mod plane;
pub mod rate_limit;
pub mod rbac;
pub mod registry;
pub mod session;
pub mod task;

pub use api_key::{ApiKey, ApiKeyStore, GeneratedKey, KeyStats, KeyStatus};
pub use audit::{
    AuditStats, RiskLevel, SecurityAuditLog, SecurityEvent, SecurityEventBuilder,
    SecurityEventType,
};
pub use config::{
    ApiKeyConfig, AuditConfig, KeyEncoding, MethodLimit, RateLimitConfig, SecurityConfig,
    SessionConfig, TokenConfig,
};
pub use error::{ErrorResponse, Result, SecurityError};
pub use identity::{Authenticator, CallerIdentity, Credential};
pub use jwt::{Claims, TokenService};
pub use plane::SecurityPlane;
pub use rate_limit::{AbuseController, ClientStats, GlobalStats, MethodStats};
pub use rbac::{DefaultPermissions, PermissionEngine, Role};
pub use registry::{
    handler, Guard, GuardedHandler, Handler, HandlerFuture, MethodDescriptor,
    MethodSecurityRegistry, Params,
};
pub use session::{Session, SessionRegistry, SessionStats};
pub use task::BackgroundTask;
