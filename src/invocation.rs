//! Validated intent of one command-line invocation.
//!
//! All checks here run before the coordination service is contacted.

use crate::error::UsageError;
use crate::lock::{LockName, WaitPolicy};

/// What the invocation does once connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Acquire and leave the lock held.
    Lock,
    /// Release and exit.
    Unlock,
    /// Acquire, run the command, release.
    Run(Vec<String>),
}

/// Raw option values as parsed from the command line.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// `--lock-name`.
    pub lock_name: Option<String>,
    /// `--lock`.
    pub lock: bool,
    /// `--unlock`.
    pub unlock: bool,
    /// `--reason`.
    pub reason: Option<String>,
    /// `--nowait`.
    pub nowait: bool,
    /// `--timeout`, in seconds; ≤0 waits without bound.
    pub timeout_secs: i64,
    /// Trailing command and arguments.
    pub command: Vec<String>,
}

/// A checked invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Lock to operate on.
    pub lock_name: LockName,
    /// Requested operation.
    pub operation: Operation,
    /// Wait policy for acquisition (unused by `Unlock`).
    pub wait: WaitPolicy,
    /// Advisory reason stored with the claim.
    pub reason: Option<String>,
}

impl Options {
    /// Check option combinations, first failure wins.
    pub fn validate(self) -> Result<Invocation, UsageError> {
        let lock_name = LockName::new(self.lock_name.unwrap_or_default())?;
        if self.lock && self.unlock {
            return Err(UsageError::LockAndUnlock);
        }
        if (self.lock || self.unlock) && !self.command.is_empty() {
            return Err(UsageError::UnexpectedCommand);
        }
        let wait = WaitPolicy::from_options(self.nowait, self.timeout_secs)?;

        let operation = if self.lock {
            Operation::Lock
        } else if self.unlock {
            Operation::Unlock
        } else if self.command.is_empty() {
            return Err(UsageError::MissingCommand);
        } else {
            Operation::Run(self.command)
        };

        Ok(Invocation {
            lock_name,
            operation,
            wait,
            reason: self.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn opts(name: &str) -> Options {
        Options {
            lock_name: Some(name.to_string()),
            timeout_secs: -1,
            ..Options::default()
        }
    }

    #[test]
    fn command_mode_with_bounded_wait() -> anyhow::Result<()> {
        let inv = Options {
            timeout_secs: 10,
            reason: Some("db migration".to_string()),
            command: vec!["make".to_string(), "migrate".to_string()],
            ..opts("db")
        }
        .validate()?;
        assert_eq!(inv.lock_name.as_str(), "db");
        assert_eq!(
            inv.operation,
            Operation::Run(vec!["make".to_string(), "migrate".to_string()])
        );
        assert_eq!(inv.wait, WaitPolicy::Bounded(Duration::from_secs(10)));
        Ok(())
    }

    #[test]
    fn lock_only_with_nowait() -> anyhow::Result<()> {
        let inv = Options {
            lock: true,
            nowait: true,
            ..opts("db")
        }
        .validate()?;
        assert_eq!(inv.operation, Operation::Lock);
        assert_eq!(inv.wait, WaitPolicy::Immediate);
        Ok(())
    }

    #[test]
    fn missing_name_is_reported_first() {
        let err = Options {
            lock: true,
            unlock: true,
            ..Options::default()
        }
        .validate();
        assert_eq!(err, Err(UsageError::MissingLockName));
    }

    #[test]
    fn conflicting_operations_are_rejected() {
        let both = Options {
            lock: true,
            unlock: true,
            ..opts("db")
        };
        assert_eq!(both.validate(), Err(UsageError::LockAndUnlock));

        let unlock_with_cmd = Options {
            unlock: true,
            command: vec!["ls".to_string()],
            ..opts("db")
        };
        assert_eq!(unlock_with_cmd.validate(), Err(UsageError::UnexpectedCommand));
    }

    #[test]
    fn nowait_conflicts_with_positive_timeout() {
        let err = Options {
            nowait: true,
            timeout_secs: 5,
            command: vec!["ls".to_string()],
            ..opts("db")
        }
        .validate();
        assert_eq!(err, Err(UsageError::NowaitWithTimeout));
    }

    #[test]
    fn nothing_to_do_is_missing_command() {
        assert_eq!(opts("db").validate(), Err(UsageError::MissingCommand));
    }
}
