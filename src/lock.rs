use crate::coord::{lock_key, Coordinator, Mutex, Session};
use crate::error::{LockError, UsageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Deadline for the one-shot unlock request.
pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Non-empty name of the protected resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockName(String);

impl LockName {
    /// Validate a lock name.
    pub fn new(name: impl Into<String>) -> Result<Self, UsageError> {
        let name = name.into();
        if name.is_empty() {
            return Err(UsageError::MissingLockName);
        }
        Ok(Self(name))
    }

    /// The name as given.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Coordination key prefix (`/distlock/<name>`, with `/` and `%` escaped).
    #[must_use]
    pub fn key(&self) -> String {
        lock_key(&self.0)
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How long `acquire` may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Block until acquired.
    Unbounded,
    /// Block at most this long.
    Bounded(Duration),
    /// Fail at once if the lock is busy.
    Immediate,
}

impl WaitPolicy {
    /// Derive the policy from `--nowait` and `--timeout` (≤0 is unbounded).
    pub fn from_options(nowait: bool, timeout_secs: i64) -> Result<Self, UsageError> {
        match (nowait, u64::try_from(timeout_secs)) {
            (true, Ok(secs)) if secs > 0 => Err(UsageError::NowaitWithTimeout),
            (true, _) => Ok(Self::Immediate),
            (false, Ok(secs)) if secs > 0 => Ok(Self::Bounded(Duration::from_secs(secs))),
            (false, _) => Ok(Self::Unbounded),
        }
    }

    /// Absolute deadline for an attempt starting at `start`.
    #[must_use]
    pub fn deadline(self, start: Instant) -> Option<Instant> {
        match self {
            Self::Unbounded => None,
            Self::Bounded(wait) => Some(start + wait),
            Self::Immediate => Some(start),
        }
    }
}

/// Value written under the waiter key; `reason` is informational only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    /// Free-form `--reason`.
    pub reason: Option<String>,
    /// Process id of the requester.
    pub pid: u32,
    /// When the claim was made.
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
}

impl OwnerRecord {
    /// Record for the current process.
    #[must_use]
    pub fn current(reason: Option<&str>) -> Self {
        Self {
            reason: reason.map(str::to_string),
            pid: std::process::id(),
            requested_at: OffsetDateTime::now_utc(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, LockError> {
        serde_json::to_vec(self).map_err(|err| LockError::service("encode owner record", err))
    }
}

/// Session settings shared by every acquire and release.
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// TTL of each session lease.
    pub session_ttl: Duration,
    /// Deadline of the unlock request.
    pub release_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(crate::config::DEFAULT_SESSION_TTL_SECS),
            release_timeout: RELEASE_TIMEOUT,
        }
    }
}

/// Owns the acquire/release protocol against one coordination client.
///
/// Every call opens its own session: the acquiring session lives as long as
/// the returned [`HeldLock`], while `release` uses a short-lived one.
pub struct LockController<C> {
    client: C,
    cfg: LockConfig,
}

impl<C: Coordinator> LockController<C> {
    /// Wrap a connected client.
    pub const fn new(client: C, cfg: LockConfig) -> Self {
        Self { client, cfg }
    }

    /// Session settings in use.
    pub const fn config(&self) -> LockConfig {
        self.cfg
    }

    /// Acquire `name` under `policy`.
    ///
    /// The session opened here is closed before returning on failure; on
    /// success it is owned by the returned [`HeldLock`].
    pub async fn acquire(
        &self,
        name: &LockName,
        policy: WaitPolicy,
        reason: Option<&str>,
    ) -> Result<HeldLock<C::Session>, LockError> {
        let prefix = name.key();
        let value = OwnerRecord::current(reason).encode()?;
        let session = self.client.open_session(self.cfg.session_ttl).await?;
        let mut mutex = session.mutex(&prefix, value);

        debug!(lock = %name, ?policy, lease_id = session.lease_id(), "acquiring lock");
        let deadline = policy.deadline(Instant::now());
        match mutex.lock(deadline).await {
            Ok(()) => {
                info!(lock = %name, key = mutex.key(), reason, "lock acquired");
                Ok(HeldLock {
                    name: name.clone(),
                    key: mutex.key().to_string(),
                    session,
                })
            }
            Err(err) => {
                if let Err(close_err) = session.close().await {
                    warn!(lock = %name, error = %close_err, "couldn't close session after failed acquire");
                }
                Err(err)
            }
        }
    }

    /// Release `name` through a fresh session.
    ///
    /// The unlock request is bounded by the release timeout and its failure is
    /// returned as is. The session is closed on every path.
    pub async fn release(&self, name: &LockName) -> Result<(), LockError> {
        let session = self.client.open_session(self.cfg.session_ttl).await?;
        let mut mutex = session.mutex(&name.key(), Vec::new());

        debug!(lock = %name, lease_id = session.lease_id(), "releasing lock");
        let unlocked = mutex
            .unlock(Instant::now() + self.cfg.release_timeout)
            .await;
        let closed = session.close().await;

        unlocked?;
        if let Err(err) = closed {
            warn!(lock = %name, error = %err, "couldn't close release session");
        }
        Ok(())
    }
}

/// A held lock together with the session keeping it alive.
#[must_use = "dropping a HeldLock stops renewing its lease"]
pub struct HeldLock<S: Session> {
    name: LockName,
    key: String,
    session: S,
}

impl<S: Session> HeldLock<S> {
    /// Waiter key that holds the lock.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lease of the holding session.
    pub fn lease_id(&self) -> i64 {
        self.session.lease_id()
    }

    /// Close the holding session, revoking its lease.
    pub async fn close(self) -> Result<(), LockError> {
        let Self { name, session, .. } = self;
        session.close().await?;
        debug!(lock = %name, "holding session closed");
        Ok(())
    }

    /// Leave the lock held after this process is gone.
    ///
    /// Renewal stops; the lease, and with it the lock, lasts for one more TTL
    /// unless released first.
    pub fn detach(self) {
        info!(lock = %self.name, lease_id = self.lease_id(), "lock left held");
    }
}
