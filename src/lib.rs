//! Camera Gateway: security control plane for the camera-control JSON-RPC API
//!
//! This is the root crate that provides benchmark and integration test access
//! to the workspace crates. For actual functionality, use the crates directly:
//!
//! - `security`: tokens, API keys, RBAC, sessions, abuse control, audit log,
//!   and the method security registry

// Re-export for benchmarks and integration tests
pub use security;

/// Install a `tracing` subscriber driven by `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
