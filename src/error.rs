//! Error taxonomy for a single `distlock` invocation.
//!
//! Every variant is fatal for the invocation: nothing here is retried or
//! recovered locally. The only non-error outcome passed through to the caller
//! is the protected command's own exit code.

/// Exit code used for invalid or conflicting options.
pub const EXIT_USAGE: i32 = 2;
/// Exit code used for every other fatal condition.
pub const EXIT_FAILURE: i32 = 1;

/// Invalid or conflicting options, detected before any network contact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    /// `--lock-name` missing or empty.
    #[error("'lock-name' is a required option.")]
    MissingLockName,
    /// Both `--lock` and `--unlock` given.
    #[error("Can't give both 'lock' and 'unlock' options.")]
    LockAndUnlock,
    /// A command was given together with `--lock` or `--unlock`.
    #[error("Program args given, but would not execute.")]
    UnexpectedCommand,
    /// `--nowait` combined with a positive `--timeout`.
    #[error("Conflicting options -nowait and -timeout.")]
    NowaitWithTimeout,
    /// Neither an operation flag nor a command was given.
    #[error("Missing command to protect with lock")]
    MissingCommand,
    /// No coordination service endpoint configured.
    #[error("at least one endpoint is required")]
    NoEndpoints,
    /// A duration option that must be at least one second.
    #[error("'{option}' must be at least 1 second, got {value}")]
    DurationTooShort {
        /// Flag name.
        option: &'static str,
        /// Rejected value.
        value: u64,
    },
}

/// Errors surfaced by the lock lifecycle and the command runner.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// See [`UsageError`].
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// The coordination service client could not be created or reached.
    #[error("can't connect to coordination service: {reason}")]
    Connect {
        /// Diagnostic from the client or the dial deadline.
        reason: String,
    },

    /// A session lease could not be granted.
    #[error("couldn't init session with coordination service: {reason}")]
    Session {
        /// Diagnostic from the service.
        reason: String,
    },

    /// The lock was not acquired within the wait policy.
    #[error("couldn't acquire lock {key}: LOCK_TIMEOUT")]
    LockTimeout {
        /// Coordination key prefix of the lock.
        key: String,
    },

    /// An unlock was requested but nothing holds the lock.
    #[error("couldn't free lock {key}: lock is not held")]
    NotHeld {
        /// Coordination key prefix of the lock.
        key: String,
    },

    /// The unlock request failed or did not finish before its deadline.
    #[error("couldn't free lock {key}: {reason}")]
    Unlock {
        /// Coordination key prefix of the lock.
        key: String,
        /// Diagnostic from the service.
        reason: String,
    },

    /// Any other coordination service failure while negotiating the lock.
    #[error("coordination service error during {operation}: {reason}")]
    Service {
        /// The request that failed.
        operation: &'static str,
        /// Diagnostic from the service.
        reason: String,
    },

    /// The protected command could not be started.
    #[error("cmd execution failed: {program}: {source}")]
    CommandSpawn {
        /// `argv[0]` of the command.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The protected command terminated without an exit code.
    #[error("cmd {program} terminated abnormally{}", signal_suffix(.signal))]
    CommandSignaled {
        /// `argv[0]` of the command.
        program: String,
        /// Terminating signal, when the platform reports one.
        signal: Option<i32>,
    },
}

#[allow(clippy::ref_option)]
fn signal_suffix(signal: &Option<i32>) -> String {
    signal.map_or_else(String::new, |sig| format!(" by signal {sig}"))
}

impl LockError {
    /// Process exit code for this error class.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => EXIT_USAGE,
            _ => EXIT_FAILURE,
        }
    }

    /// Whether this is the wait-policy expiry outcome.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    pub(crate) fn service(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Service {
            operation,
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_errors_exit_with_usage_code() {
        let err = LockError::from(UsageError::NowaitWithTimeout);
        assert_eq!(err.exit_code(), EXIT_USAGE);
        assert_eq!(err.to_string(), "Conflicting options -nowait and -timeout.");
    }

    #[test]
    fn protocol_errors_exit_with_failure_code() {
        let err = LockError::LockTimeout {
            key: "/distlock/db".to_string(),
        };
        assert!(err.is_timeout());
        assert_eq!(err.exit_code(), EXIT_FAILURE);
        assert!(err.to_string().contains("LOCK_TIMEOUT"));
    }

    #[test]
    fn signaled_message_names_signal() {
        let err = LockError::CommandSignaled {
            program: "sleep".to_string(),
            signal: Some(9),
        };
        assert_eq!(err.to_string(), "cmd sleep terminated abnormally by signal 9");
    }
}
