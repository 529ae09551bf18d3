//! One invocation, start to finish.
//!
//! `Idle → Acquiring → Held → (Executing) → Releasing → Done`; any failure
//! ends the invocation. Once the lock is held with a command to run, release
//! happens exactly once whatever the command does.

use crate::command;
use crate::coord::Coordinator;
use crate::error::LockError;
use crate::invocation::{Invocation, Operation};
use crate::lock::LockController;
use serde::Serialize;
use tracing::{error, info, warn};

/// Summary of a lock-only or unlock-only operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockReport {
    /// Always `true`; failures are errors.
    pub ok: bool,
    /// `"lock"` or `"unlock"`.
    pub operation: &'static str,
    /// Lock name.
    pub lock_name: String,
    /// Key prefix for `unlock`, waiter key for `lock`.
    pub key: String,
    /// Lease holding the lock (`lock` only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<i64>,
    /// Seconds the lock survives without `--unlock` (`lock` only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    /// Advisory reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Successful end of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `--lock` finished; the lock stays held.
    Locked(LockReport),
    /// `--unlock` finished.
    Unlocked(LockReport),
    /// The protected command ran and exited with this code.
    Ran(i32),
}

impl Outcome {
    /// Process exit code for this outcome.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Locked(_) | Self::Unlocked(_) => 0,
            Self::Ran(code) => *code,
        }
    }

    /// Report to print for lock/unlock-only operations.
    #[must_use]
    pub const fn report(&self) -> Option<&LockReport> {
        match self {
            Self::Locked(report) | Self::Unlocked(report) => Some(report),
            Self::Ran(_) => None,
        }
    }
}

/// Carry out `invocation` with `controller`.
pub async fn execute<C: Coordinator>(
    controller: &LockController<C>,
    invocation: &Invocation,
) -> Result<Outcome, LockError> {
    let name = &invocation.lock_name;
    let reason = invocation.reason.as_deref();

    match &invocation.operation {
        Operation::Unlock => {
            controller.release(name).await?;
            Ok(Outcome::Unlocked(LockReport {
                ok: true,
                operation: "unlock",
                lock_name: name.to_string(),
                key: name.key(),
                lease_id: None,
                ttl_secs: None,
                reason: invocation.reason.clone(),
            }))
        }

        Operation::Lock => {
            let held = controller.acquire(name, invocation.wait, reason).await?;
            let report = LockReport {
                ok: true,
                operation: "lock",
                lock_name: name.to_string(),
                key: held.key().to_string(),
                lease_id: Some(held.lease_id()),
                ttl_secs: Some(controller.config().session_ttl.as_secs()),
                reason: invocation.reason.clone(),
            };
            held.detach();
            Ok(Outcome::Locked(report))
        }

        Operation::Run(argv) => {
            let held = controller.acquire(name, invocation.wait, reason).await?;
            let ran = command::run(argv).await;
            let released = controller.release(name).await;
            if let Err(err) = held.close().await {
                warn!(lock = %name, error = %err, "couldn't close holding session");
            }

            match (ran, released) {
                (ran, Err(release_err)) => {
                    if let Err(cmd_err) = ran {
                        error!(lock = %name, error = %cmd_err, "protected command failed");
                    }
                    Err(release_err)
                }
                (Err(cmd_err), Ok(())) => Err(cmd_err),
                (Ok(code), Ok(())) => {
                    info!(lock = %name, code, "protected command finished; lock released");
                    Ok(Outcome::Ran(code))
                }
            }
        }
    }
}
