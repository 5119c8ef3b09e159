//! Role-Based Access Control (RBAC) for API methods.
//!
//! Maps each method name to the minimum role allowed to call it. Roles form
//! a total order, so a higher role implies every permission of a lower one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Result, SecurityError};

/// Access levels, ordered `Viewer < Operator < Admin`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Role {
    /// Read-only access to camera and recording listings.
    Viewer = 1,
    /// Can control cameras: snapshots and recordings.
    Operator = 2,
    /// Full access including server administration and key management.
    Admin = 3,
}

impl Role {
    /// All roles, lowest first.
    pub const ALL: [Role; 3] = [Role::Viewer, Role::Operator, Role::Admin];

    /// Numeric level of the role.
    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }

    /// Check if this role satisfies a required minimum role.
    pub fn satisfies(&self, required: Role) -> bool {
        *self >= required
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "operator" => Ok(Role::Operator),
            "admin" => Ok(Role::Admin),
            other => Err(SecurityError::ValidationFailed(format!(
                "invalid role '{}'",
                other
            ))),
        }
    }
}

/// Default method matrix for the camera API.
pub struct DefaultPermissions;

impl DefaultPermissions {
    pub fn viewer_methods() -> &'static [&'static str] {
        &[
            "ping",
            "get_camera_list",
            "get_camera_status",
            "list_recordings",
            "list_snapshots",
            "get_recording_info",
            "get_snapshot_info",
        ]
    }

    pub fn operator_methods() -> &'static [&'static str] {
        &[
            "take_snapshot",
            "start_recording",
            "stop_recording",
            "delete_recording",
            "delete_snapshot",
        ]
    }

    pub fn admin_methods() -> &'static [&'static str] {
        &[
            "get_metrics",
            "get_status",
            "get_server_info",
            "get_storage_info",
            "set_retention_policy",
            "cleanup_old_files",
            "create_api_key",
            "revoke_api_key",
            "list_api_keys",
        ]
    }

    /// Get the full default matrix.
    pub fn all() -> HashMap<String, Role> {
        let mut matrix = HashMap::new();
        for (methods, role) in [
            (Self::viewer_methods(), Role::Viewer),
            (Self::operator_methods(), Role::Operator),
            (Self::admin_methods(), Role::Admin),
        ] {
            for method in methods {
                matrix.insert(method.to_string(), role);
            }
        }
        matrix
    }
}

/// Permission engine for method-level checks.
pub struct PermissionEngine {
    methods: Arc<RwLock<HashMap<String, Role>>>,
}

impl PermissionEngine {
    /// Create a permission engine with the default camera matrix.
    pub fn new() -> Self {
        Self::with_matrix(DefaultPermissions::all())
    }

    /// Create a permission engine with an explicit matrix.
    pub fn with_matrix(matrix: HashMap<String, Role>) -> Self {
        Self {
            methods: Arc::new(RwLock::new(matrix)),
        }
    }

    /// Check if a role may call a method.
    pub async fn has_permission(&self, role: Role, method: &str) -> bool {
        let required = self.required_role(method).await;
        let allowed = role.satisfies(required);

        debug!(
            role = %role,
            method = %method,
            required = %required,
            allowed,
            "Permission check"
        );

        allowed
    }

    /// Minimum role for a method. Unknown methods require Admin.
    pub async fn required_role(&self, method: &str) -> Role {
        let methods = self.methods.read().await;
        methods.get(method).copied().unwrap_or(Role::Admin)
    }

    /// Parse a role name, case-insensitively.
    pub fn validate_role(role: &str) -> Result<Role> {
        role.parse()
    }

    /// Set the required role for a method, replacing any previous entry.
    pub async fn add_permission(&self, method: &str, role: Role) {
        let mut methods = self.methods.write().await;
        let previous = methods.insert(method.to_string(), role);
        info!(
            method = %method,
            role = %role,
            previous = ?previous,
            "Method permission set"
        );
    }

    /// Remove a method from the matrix. Returns whether it was present.
    pub async fn remove_permission(&self, method: &str) -> bool {
        let mut methods = self.methods.write().await;
        let removed = methods.remove(method).is_some();
        if removed {
            info!(method = %method, "Method permission removed");
        }
        removed
    }

    /// Get a snapshot of the method matrix.
    pub async fn matrix(&self) -> HashMap<String, Role> {
        self.methods.read().await.clone()
    }
}

impl Default for PermissionEngine {
    fn default() -> Self {
        Self::new()
    }
}
