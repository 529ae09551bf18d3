//! In-process coordination service.
//!
//! Implements the same lease and mutex semantics as the etcd backend on a
//! single shared state, so the lock protocol can be exercised without a
//! cluster. Clones share state; every clone behaves like another client of
//! the same service. Time follows the tokio clock.

use super::{waiter_key, Coordinator, Mutex, Session};
use crate::error::LockError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    // `None` while a session keeps the lease alive.
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct Entry {
    create_revision: i64,
    lease_id: i64,
    value: Vec<u8>,
}

#[derive(Debug)]
struct State {
    available: bool,
    revision: i64,
    next_lease: i64,
    leases: HashMap<i64, Lease>,
    keys: BTreeMap<String, Entry>,
}

impl State {
    fn purge_expired(&mut self, now: Instant) -> bool {
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at.is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.revoke(*id);
        }
        !expired.is_empty()
    }

    fn revoke(&mut self, lease_id: i64) -> bool {
        let existed = self.leases.remove(&lease_id).is_some();
        self.keys.retain(|_, entry| entry.lease_id != lease_id);
        existed
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.leases.values().filter_map(|l| l.expires_at).min()
    }

    fn first_waiter(&self, range: &str) -> Option<(&String, &Entry)> {
        self.keys
            .range(range.to_string()..)
            .take_while(|(key, _)| key.starts_with(range))
            .min_by_key(|(_, entry)| entry.create_revision)
    }
}

#[derive(Debug)]
struct Shared {
    state: std::sync::Mutex<State>,
    changed: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changed.send_modify(|gen| *gen = gen.wrapping_add(1));
    }
}

/// Shared in-process coordination service.
#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
    shared: Arc<Shared>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    /// An empty, reachable service.
    #[must_use]
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: std::sync::Mutex::new(State {
                    available: true,
                    revision: 0,
                    next_lease: 1,
                    leases: HashMap::new(),
                    keys: BTreeMap::new(),
                }),
                changed,
            }),
        }
    }

    /// Make new sessions fail as if the service could not be reached.
    pub fn set_available(&self, available: bool) {
        self.shared.lock().available = available;
    }

    /// Key of the current holder of the lock at `prefix`.
    #[must_use]
    pub fn holder(&self, prefix: &str) -> Option<String> {
        let mut state = self.shared.lock();
        state.purge_expired(Instant::now());
        state
            .first_waiter(&format!("{prefix}/"))
            .map(|(key, _)| key.clone())
    }

    /// Value stored under the holder's key.
    #[must_use]
    pub fn holder_value(&self, prefix: &str) -> Option<Vec<u8>> {
        let mut state = self.shared.lock();
        state.purge_expired(Instant::now());
        state
            .first_waiter(&format!("{prefix}/"))
            .map(|(_, entry)| entry.value.clone())
    }

    /// Number of waiter keys (holder included) under `prefix`.
    #[must_use]
    pub fn waiters(&self, prefix: &str) -> usize {
        let range = format!("{prefix}/");
        let mut state = self.shared.lock();
        state.purge_expired(Instant::now());
        state.keys.keys().filter(|k| k.starts_with(&range)).count()
    }

    /// Number of unexpired leases.
    #[must_use]
    pub fn live_leases(&self) -> usize {
        let mut state = self.shared.lock();
        state.purge_expired(Instant::now());
        state.leases.len()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    type Session = MemorySession;

    async fn open_session(&self, ttl: Duration) -> Result<MemorySession, LockError> {
        let lease_id = {
            let mut state = self.shared.lock();
            if !state.available {
                return Err(LockError::Connect {
                    reason: "service unavailable".to_string(),
                });
            }
            let id = state.next_lease;
            state.next_lease += 1;
            state.leases.insert(
                id,
                Lease {
                    ttl,
                    expires_at: None,
                },
            );
            id
        };
        Ok(MemorySession {
            shared: Arc::clone(&self.shared),
            lease_id,
            closed: false,
        })
    }
}

/// Session over a [`MemoryCoordinator`] lease.
#[derive(Debug)]
pub struct MemorySession {
    shared: Arc<Shared>,
    lease_id: i64,
    closed: bool,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Keep-alive stops; the lease runs out its TTL.
        {
            let mut state = self.shared.lock();
            if let Some(lease) = state.leases.get_mut(&self.lease_id) {
                lease.expires_at = Some(Instant::now() + lease.ttl);
            }
        }
        self.shared.notify();
    }
}

#[async_trait]
impl Session for MemorySession {
    type Mutex = MemoryMutex;

    fn lease_id(&self) -> i64 {
        self.lease_id
    }

    fn mutex(&self, prefix: &str, value: Vec<u8>) -> MemoryMutex {
        MemoryMutex {
            shared: Arc::clone(&self.shared),
            prefix: prefix.to_string(),
            range: format!("{prefix}/"),
            key: waiter_key(prefix, self.lease_id),
            value,
            lease_id: self.lease_id,
            revision: None,
        }
    }

    async fn close(mut self) -> Result<(), LockError> {
        self.closed = true;
        let revoked = {
            let mut state = self.shared.lock();
            state.purge_expired(Instant::now());
            state.revoke(self.lease_id)
        };
        self.shared.notify();
        if revoked {
            Ok(())
        } else {
            Err(LockError::service("lease revoke", "requested lease not found"))
        }
    }
}

/// Mutex handle over a [`MemoryCoordinator`] key prefix.
#[derive(Debug)]
pub struct MemoryMutex {
    shared: Arc<Shared>,
    prefix: String,
    range: String,
    key: String,
    value: Vec<u8>,
    lease_id: i64,
    revision: Option<i64>,
}

enum Poll {
    Held,
    Waiting(Option<Instant>),
}

impl MemoryMutex {
    fn register(&mut self) -> Result<(), LockError> {
        let mut state = self.shared.lock();
        state.purge_expired(Instant::now());
        if !state.leases.contains_key(&self.lease_id) {
            return Err(LockError::service("lock", "requested lease not found"));
        }
        let revision = match state.keys.get(&self.key) {
            Some(entry) => entry.create_revision,
            None => {
                state.revision += 1;
                let revision = state.revision;
                state.keys.insert(
                    self.key.clone(),
                    Entry {
                        create_revision: revision,
                        lease_id: self.lease_id,
                        value: self.value.clone(),
                    },
                );
                revision
            }
        };
        self.revision = Some(revision);
        Ok(())
    }

    fn poll_owner(&self) -> Result<Poll, LockError> {
        let mut state = self.shared.lock();
        let purged = state.purge_expired(Instant::now());
        if purged {
            self.shared.notify();
        }
        if !state.keys.contains_key(&self.key) {
            return Err(LockError::service(
                "lock wait",
                "session lease expired while waiting",
            ));
        }
        match state.first_waiter(&self.range) {
            Some((key, _)) if *key == self.key => Ok(Poll::Held),
            _ => Ok(Poll::Waiting(state.next_expiry())),
        }
    }

    fn abandon(&mut self) {
        if self.revision.take().is_none() {
            return;
        }
        let removed = self.shared.lock().keys.remove(&self.key).is_some();
        if removed {
            self.shared.notify();
        }
    }

    async fn acquire(&mut self, deadline: Option<Instant>) -> Result<(), LockError> {
        let mut changes = self.shared.changed.subscribe();
        self.register()?;
        loop {
            let next_expiry = match self.poll_owner()? {
                Poll::Held => return Ok(()),
                Poll::Waiting(next_expiry) => next_expiry,
            };
            if deadline.is_some_and(|d| d <= Instant::now()) {
                return Err(LockError::LockTimeout {
                    key: self.prefix.clone(),
                });
            }
            let wake_at = match (deadline, next_expiry) {
                (Some(d), Some(e)) => Some(d.min(e)),
                (d, e) => d.or(e),
            };
            match wake_at {
                Some(at) => {
                    tokio::select! {
                        changed = changes.changed() => {
                            if changed.is_err() {
                                return Err(LockError::service("lock wait", "service shut down"));
                            }
                        }
                        () = sleep_until(at) => {}
                    }
                }
                None => {
                    if changes.changed().await.is_err() {
                        return Err(LockError::service("lock wait", "service shut down"));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Mutex for MemoryMutex {
    fn key(&self) -> &str {
        &self.key
    }

    async fn lock(&mut self, deadline: Option<Instant>) -> Result<(), LockError> {
        let result = self.acquire(deadline).await;
        if result.is_err() {
            self.abandon();
        }
        result
    }

    async fn unlock(&mut self, _deadline: Instant) -> Result<(), LockError> {
        let removed = {
            let mut state = self.shared.lock();
            state.purge_expired(Instant::now());
            let target = if self.revision.is_some() {
                Some(self.key.clone())
            } else {
                state.first_waiter(&self.range).map(|(key, _)| key.clone())
            };
            target.and_then(|key| state.keys.remove(&key))
        };
        self.revision = None;
        match removed {
            Some(_) => {
                self.shared.notify();
                Ok(())
            }
            None => Err(LockError::NotHeld {
                key: self.prefix.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::lock_key;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn waiters_queue_in_creation_order() -> anyhow::Result<()> {
        let service = MemoryCoordinator::new();
        let prefix = lock_key("queue");
        let first = service.open_session(TTL).await?;
        let second = service.open_session(TTL).await?;

        let mut a = first.mutex(&prefix, b"a".to_vec());
        a.lock(None).await?;

        let mut b = second.mutex(&prefix, b"b".to_vec());
        let waiting = tokio::spawn(async move {
            let res = b.lock(None).await;
            (b, res)
        });
        while service.waiters(&prefix) < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(service.holder(&prefix), Some(a.key().to_string()));

        a.unlock(Instant::now()).await?;
        let (b, res) = waiting.await?;
        res?;
        assert_eq!(service.holder(&prefix), Some(b.key().to_string()));
        assert_eq!(service.holder_value(&prefix), Some(b"b".to_vec()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_session_expires_after_ttl() -> anyhow::Result<()> {
        let service = MemoryCoordinator::new();
        let prefix = lock_key("crash");
        let session = service.open_session(TTL).await?;
        session.mutex(&prefix, Vec::new()).lock(None).await?;
        drop(session);
        assert!(service.holder(&prefix).is_some());

        tokio::time::advance(TTL).await;
        assert_eq!(service.holder(&prefix), None);
        assert_eq!(service.live_leases(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn close_revokes_lease_and_keys() -> anyhow::Result<()> {
        let service = MemoryCoordinator::new();
        let prefix = lock_key("close");
        let session = service.open_session(TTL).await?;
        session.mutex(&prefix, Vec::new()).lock(None).await?;
        session.close().await?;
        assert_eq!(service.waiters(&prefix), 0);
        assert_eq!(service.live_leases(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_service_refuses_sessions() {
        let service = MemoryCoordinator::new();
        service.set_available(false);
        let err = service.open_session(TTL).await.err();
        assert!(matches!(err, Some(LockError::Connect { .. })));
    }
}
