//! `distlock` is the library behind the `distlock` CLI binary.
//!
//! It serializes access to a shared resource across processes and machines
//! through a named lock kept in etcd:
//! - lease-backed sessions and a queueing mutex over the coordination service
//! - a lock controller with unbounded, bounded and fail-fast waits
//! - a command runner that passes the protected command's exit code through
//! - the per-invocation sequence tying them together

/// Protected command execution.
pub mod command;
/// Coordination service connection settings.
pub mod config;
/// Coordination service boundary and backends.
pub mod coord;
/// Error taxonomy and exit codes.
pub mod error;
/// Command-line option validation.
pub mod invocation;
/// Lock acquire/release protocol.
pub mod lock;
/// Per-invocation state machine.
pub mod run;
