//! Names of the environment variables this crate reserves for itself.
//!
//! Every read of these variables happens through [`crate::config`], never
//! ad hoc, so tests can inject a fake environment instead of mutating the
//! process's real one.

/// Absent -> master; present -> the worker's own id.
pub const PARALLEL_ROLE_VAR: &str = "PARALLEL_ROLE";
/// `host:port` of the parent's one-shot reverse-handshake listener.
pub const PARALLEL_PARENT_ADDR_VAR: &str = "PARALLEL_PARENT_ADDR";
/// Opaque token the child echoes back on handshake.
pub const PARALLEL_PARENT_COOKIE_VAR: &str = "PARALLEL_PARENT_COOKIE";
/// Heartbeat tick interval in milliseconds, propagated to the child.
pub const PARALLEL_HEARTBEAT_INTERVAL_MS_VAR: &str = "PARALLEL_HEARTBEAT_INTERVAL_MS";
/// Heartbeat dead-channel timeout in milliseconds, propagated to the child.
pub const PARALLEL_HEARTBEAT_TIMEOUT_MS_VAR: &str = "PARALLEL_HEARTBEAT_TIMEOUT_MS";
/// Hex-encoded MD5 of the master's binary, checked before the child dials back.
pub const PARALLEL_BINARY_MD5_VAR: &str = "PARALLEL_BINARY_MD5";
/// Test-only escape hatch disabling the binary identity check.
pub const PARALLEL_SKIP_BINARY_CHECK_VAR: &str = "PARALLEL_SKIP_BINARY_CHECK";

/// All variables the Environment Builder treats as reserved and will refuse
/// to let `extra` pairs override.
pub const RESERVED_VARS: &[&str] = &[
    PARALLEL_ROLE_VAR,
    PARALLEL_PARENT_ADDR_VAR,
    PARALLEL_PARENT_COOKIE_VAR,
    PARALLEL_HEARTBEAT_INTERVAL_MS_VAR,
    PARALLEL_HEARTBEAT_TIMEOUT_MS_VAR,
    PARALLEL_BINARY_MD5_VAR,
    PARALLEL_SKIP_BINARY_CHECK_VAR,
];
