//! Boundary to the coordination service.
//!
//! The lock controller only talks to the service through these three traits:
//! a [`Coordinator`] opens lease-backed [`Session`]s, and a session binds
//! [`Mutex`] handles to a key prefix. [`etcd`] is the production backend;
//! [`memory`] implements the same semantics in-process.
//!
//! Mutex semantics shared by both backends:
//! - every handle owns one waiter key `<prefix>/<lease-id-hex>` attached to
//!   its session lease;
//! - a prefix never contains `/` past the namespace, so `<prefix>/` ranges
//!   over exactly one lock's waiters;
//! - the waiter with the lowest create revision under the prefix holds the
//!   lock, the others queue behind it in creation order;
//! - revoking or expiring a lease deletes its keys, which frees the lock.

use crate::error::LockError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

pub mod etcd;
pub mod memory;

/// Namespace under which every lock key lives.
pub const KEY_PREFIX: &str = "/distlock/";

/// Coordination key prefix for a lock name.
///
/// `%` and `/` in the name are percent-encoded so that no name can reach into
/// another lock's waiter range (`a/b` becomes `a%2Fb`, not a child of `a`).
#[must_use]
pub fn lock_key(name: &str) -> String {
    let mut key = String::with_capacity(KEY_PREFIX.len() + name.len());
    key.push_str(KEY_PREFIX);
    for ch in name.chars() {
        match ch {
            '%' => key.push_str("%25"),
            '/' => key.push_str("%2F"),
            _ => key.push(ch),
        }
    }
    key
}

/// Waiter key owned by `lease_id` under `prefix`.
#[must_use]
pub fn waiter_key(prefix: &str, lease_id: i64) -> String {
    format!("{prefix}/{lease_id:x}")
}

/// A connection to the coordination service.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Session type produced by this coordinator.
    type Session: Session;

    /// Grant a lease of `ttl` and keep it alive while the session lives.
    async fn open_session(&self, ttl: Duration) -> Result<Self::Session, LockError>;
}

/// A lease-backed liveness handle.
///
/// Dropping a session without [`Session::close`] stops renewing its lease;
/// the lease and every key attached to it expire after the TTL.
#[async_trait]
pub trait Session: Send + Sized {
    /// Mutex handle type bound to this session.
    type Mutex: Mutex;

    /// Lease backing this session.
    fn lease_id(&self) -> i64;

    /// Bind a mutex handle for `prefix`; `value` is stored in the waiter key.
    fn mutex(&self, prefix: &str, value: Vec<u8>) -> Self::Mutex;

    /// Stop renewing and revoke the lease.
    async fn close(self) -> Result<(), LockError>;
}

/// A claim (pending or held) on a named lock.
#[async_trait]
pub trait Mutex: Send {
    /// The waiter key this handle writes when locking.
    fn key(&self) -> &str;

    /// Acquire the lock.
    ///
    /// `None` waits without bound. A deadline that has already passed makes
    /// this a single try. On failure the handle's waiter key is removed and a
    /// missed deadline is reported as [`LockError::LockTimeout`].
    async fn lock(&mut self, deadline: Option<Instant>) -> Result<(), LockError>;

    /// Release the lock.
    ///
    /// A handle that locked deletes its own waiter key. A fresh handle deletes
    /// the key of whoever holds the lock now, and fails with
    /// [`LockError::NotHeld`] when nobody does.
    async fn unlock(&mut self, deadline: Instant) -> Result<(), LockError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_live_under_the_namespace() {
        assert_eq!(lock_key("deploy"), "/distlock/deploy");
        assert_eq!(waiter_key("/distlock/deploy", 255), "/distlock/deploy/ff");
    }

    #[test]
    fn nested_names_do_not_share_a_range() {
        let parent = format!("{}/", lock_key("a"));
        let child = waiter_key(&lock_key("a/b"), 1);
        assert_eq!(child, "/distlock/a%2Fb/1");
        assert!(!child.starts_with(&parent));
        assert_eq!(lock_key("50%/x"), "/distlock/50%25%2Fx");
        assert_ne!(lock_key("a%2Fb"), lock_key("a/b"));
    }
}
