//! etcd v3 backend.
//!
//! Sessions are leases renewed by a background task at a third of their TTL.
//! The mutex is the create-revision queue used by etcd's concurrency recipes,
//! built from txn/get/watch so that a zero deadline can be a real try-lock.

use super::{waiter_key, Coordinator, Mutex, Session};
use crate::config::ClientConfig;
use crate::error::LockError;
use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream,
    LeaseKeeper, PutOptions, SortOrder, SortTarget, Txn, TxnOp, TxnOpResponse, WatchOptions,
};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// Client handle for an etcd cluster.
#[derive(Clone)]
pub struct EtcdCoordinator {
    client: Client,
    request_timeout: Duration,
}

impl EtcdCoordinator {
    /// Connect to the configured endpoints within the dial timeout.
    pub async fn connect(config: &ClientConfig) -> Result<Self, LockError> {
        let options = ConnectOptions::new().with_connect_timeout(config.dial_timeout);
        let connect = Client::connect(config.endpoints.as_slice(), Some(options));
        let client = match timeout(config.dial_timeout, connect).await {
            Ok(Ok(client)) => client,
            Ok(Err(err)) => {
                return Err(LockError::Connect {
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(LockError::Connect {
                    reason: format!("no connection within {}", secs(config.dial_timeout)),
                })
            }
        };
        debug!(endpoints = ?config.endpoints, "connected to etcd");
        Ok(Self {
            client,
            request_timeout: config.dial_timeout,
        })
    }
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    type Session = EtcdSession;

    async fn open_session(&self, ttl: Duration) -> Result<EtcdSession, LockError> {
        let mut client = self.client.clone();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

        let grant = match timeout(self.request_timeout, client.lease_grant(ttl_secs, None)).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(err)) => {
                return Err(LockError::Session {
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(LockError::Session {
                    reason: format!("no lease granted within {}", secs(self.request_timeout)),
                })
            }
        };
        let lease_id = grant.id();

        let keepalive = match timeout(self.request_timeout, client.lease_keep_alive(lease_id)).await
        {
            Ok(Ok((keeper, stream))) => tokio::spawn(keep_alive(keeper, stream, lease_id, ttl)),
            failed => {
                let reason = match failed {
                    Ok(Err(err)) => err.to_string(),
                    _ => format!("no keep-alive stream within {}", secs(self.request_timeout)),
                };
                if let Err(err) = client.lease_revoke(lease_id).await {
                    warn!(lease_id, error = %err, "couldn't revoke lease of failed session");
                }
                return Err(LockError::Session { reason });
            }
        };

        info!(lease_id, ttl_secs, "session opened");
        Ok(EtcdSession {
            client,
            lease_id,
            request_timeout: self.request_timeout,
            keepalive,
        })
    }
}

async fn keep_alive(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    lease_id: i64,
    ttl: Duration,
) {
    let interval = (ttl / 3).max(MIN_KEEPALIVE_INTERVAL);
    loop {
        tokio::time::sleep(interval).await;
        if let Err(err) = keeper.keep_alive().await {
            warn!(lease_id, error = %err, "lease keep-alive request failed");
            continue;
        }
        match stream.message().await {
            Ok(Some(resp)) if resp.ttl() > 0 => trace!(lease_id, ttl = resp.ttl(), "lease renewed"),
            Ok(Some(_)) => {
                warn!(lease_id, "lease expired; lock is lost");
                return;
            }
            Ok(None) => {
                warn!(lease_id, "keep-alive stream closed");
                return;
            }
            Err(err) => warn!(lease_id, error = %err, "lease keep-alive response failed"),
        }
    }
}

/// A lease kept alive by a background task.
pub struct EtcdSession {
    client: Client,
    lease_id: i64,
    request_timeout: Duration,
    keepalive: JoinHandle<()>,
}

impl Drop for EtcdSession {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

#[async_trait]
impl Session for EtcdSession {
    type Mutex = EtcdMutex;

    fn lease_id(&self) -> i64 {
        self.lease_id
    }

    fn mutex(&self, prefix: &str, value: Vec<u8>) -> EtcdMutex {
        EtcdMutex {
            client: self.client.clone(),
            prefix: prefix.to_string(),
            range: format!("{prefix}/"),
            key: waiter_key(prefix, self.lease_id),
            value,
            lease_id: self.lease_id,
            request_timeout: self.request_timeout,
            revision: None,
        }
    }

    async fn close(self) -> Result<(), LockError> {
        self.keepalive.abort();
        let mut client = self.client.clone();
        bounded(
            self.request_timeout,
            "lease revoke",
            client.lease_revoke(self.lease_id),
        )
        .await?;
        debug!(lease_id = self.lease_id, "session closed");
        Ok(())
    }
}

/// Mutex handle over a key prefix, bound to one session lease.
pub struct EtcdMutex {
    client: Client,
    prefix: String,
    range: String,
    key: String,
    value: Vec<u8>,
    lease_id: i64,
    request_timeout: Duration,
    // Create revision of our waiter key once written.
    revision: Option<i64>,
}

impl EtcdMutex {
    fn timeout_error(&self) -> LockError {
        LockError::LockTimeout {
            key: self.prefix.clone(),
        }
    }

    fn unlock_error(&self, err: impl Display) -> LockError {
        LockError::Unlock {
            key: self.prefix.clone(),
            reason: err.to_string(),
        }
    }

    async fn acquire(&mut self, deadline: Option<Instant>) -> Result<(), LockError> {
        match deadline {
            None => self.queue().await,
            Some(deadline) if deadline <= Instant::now() => self.try_once().await,
            Some(deadline) => match timeout_at(deadline, self.queue()).await {
                Ok(queued) => queued,
                Err(_) => Err(self.timeout_error()),
            },
        }
    }

    /// Single ownership check; each request is bounded on its own.
    async fn try_once(&mut self) -> Result<(), LockError> {
        let revision = self.register().await?;
        if self.owner_revision().await? == Some(revision) {
            Ok(())
        } else {
            Err(self.timeout_error())
        }
    }

    async fn queue(&mut self) -> Result<(), LockError> {
        let revision = self.register().await?;
        if self.owner_revision().await? == Some(revision) {
            return Ok(());
        }
        self.wait_predecessors(revision).await?;

        // Predecessors are gone; our key must still be there.
        if self.owner_revision().await? == Some(revision) {
            Ok(())
        } else {
            Err(LockError::service(
                "lock",
                "session lease expired while waiting",
            ))
        }
    }

    /// Write our waiter key if absent; returns its create revision.
    async fn register(&mut self) -> Result<i64, LockError> {
        let txn = Txn::new()
            .when([Compare::create_revision(
                self.key.clone(),
                CompareOp::Equal,
                0,
            )])
            .and_then([TxnOp::put(
                self.key.clone(),
                self.value.clone(),
                Some(PutOptions::new().with_lease(self.lease_id)),
            )])
            .or_else([TxnOp::get(self.key.clone(), None)]);

        let limit = self.request_timeout;
        let resp = bounded(limit, "lock", self.client.txn(txn)).await?;
        let revision = if resp.succeeded() {
            resp.header().map(|h| h.revision())
        } else {
            resp.op_responses().into_iter().find_map(|op| match op {
                TxnOpResponse::Get(get) => get.kvs().first().map(|kv| kv.create_revision()),
                _ => None,
            })
        };
        let revision =
            revision.ok_or_else(|| LockError::service("lock", "response carried no revision"))?;
        trace!(key = %self.key, revision, "waiter key registered");
        self.revision = Some(revision);
        Ok(revision)
    }

    async fn first_waiter(&mut self) -> Result<Option<(Vec<u8>, i64)>, LockError> {
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Create, SortOrder::Ascend)
            .with_limit(1);
        let limit = self.request_timeout;
        let resp = bounded(
            limit,
            "lock owner lookup",
            self.client.get(self.range.clone(), Some(options)),
        )
        .await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.key().to_vec(), kv.create_revision())))
    }

    async fn owner_revision(&mut self) -> Result<Option<i64>, LockError> {
        Ok(self.first_waiter().await?.map(|(_, rev)| rev))
    }

    async fn wait_predecessors(&mut self, revision: i64) -> Result<(), LockError> {
        loop {
            let options = GetOptions::new()
                .with_prefix()
                .with_max_create_revision(revision - 1)
                .with_sort(SortTarget::Create, SortOrder::Descend)
                .with_limit(1);
            let resp = self
                .client
                .get(self.range.clone(), Some(options))
                .await
                .map_err(|err| LockError::service("lock wait", err))?;
            let Some(kv) = resp.kvs().first() else {
                return Ok(());
            };
            let predecessor = kv.key().to_vec();
            let since = resp.header().map_or(0, |h| h.revision());
            debug!(
                waiting_on = %String::from_utf8_lossy(&predecessor),
                "lock busy; waiting"
            );
            self.wait_delete(predecessor, since).await?;
        }
    }

    async fn wait_delete(&mut self, key: Vec<u8>, since: i64) -> Result<(), LockError> {
        let options = WatchOptions::new().with_start_revision(since + 1);
        let (_watcher, mut stream) = self
            .client
            .watch(key, Some(options))
            .await
            .map_err(|err| LockError::service("lock wait", err))?;
        while let Some(resp) = stream
            .message()
            .await
            .map_err(|err| LockError::service("lock wait", err))?
        {
            if resp.canceled() {
                return Err(LockError::service("lock wait", "watch canceled"));
            }
            if resp
                .events()
                .iter()
                .any(|event| event.event_type() == EventType::Delete)
            {
                return Ok(());
            }
        }
        Err(LockError::service("lock wait", "watch stream closed"))
    }

    // The deadline may cut `register` after the txn was applied, so the key is
    // deleted even when no revision was recorded.
    async fn abandon(&mut self) {
        self.revision = None;
        match timeout(self.request_timeout, self.client.delete(self.key.clone(), None)).await {
            Ok(Ok(_)) => debug!(key = %self.key, "waiter key removed"),
            Ok(Err(err)) => warn!(key = %self.key, error = %err, "couldn't remove waiter key"),
            Err(_) => warn!(key = %self.key, "timed out removing waiter key"),
        }
    }

    async fn delete_holder(&mut self) -> Result<(), LockError> {
        let (key, revision) = match self.revision {
            Some(revision) => (self.key.clone().into_bytes(), revision),
            None => match self.first_waiter().await {
                Ok(Some(holder)) => holder,
                Ok(None) => {
                    return Err(LockError::NotHeld {
                        key: self.prefix.clone(),
                    })
                }
                Err(err) => return Err(self.unlock_error(err)),
            },
        };

        // Only delete the exact claim we looked at.
        let txn = Txn::new()
            .when([Compare::create_revision(
                key.clone(),
                CompareOp::Equal,
                revision,
            )])
            .and_then([TxnOp::delete(key.clone(), None)]);
        let resp = self
            .client
            .txn(txn)
            .await
            .map_err(|err| self.unlock_error(err))?;
        if !resp.succeeded() {
            return Err(LockError::NotHeld {
                key: self.prefix.clone(),
            });
        }
        self.revision = None;
        info!(key = %String::from_utf8_lossy(&key), "lock released");
        Ok(())
    }
}

#[async_trait]
impl Mutex for EtcdMutex {
    fn key(&self) -> &str {
        &self.key
    }

    async fn lock(&mut self, deadline: Option<Instant>) -> Result<(), LockError> {
        let result = self.acquire(deadline).await;
        if result.is_err() {
            self.abandon().await;
        }
        result
    }

    async fn unlock(&mut self, deadline: Instant) -> Result<(), LockError> {
        match timeout_at(deadline, self.delete_holder()).await {
            Ok(result) => result,
            Err(_) => Err(self.unlock_error("deadline exceeded")),
        }
    }
}

async fn bounded<T, E, F>(limit: Duration, operation: &'static str, request: F) -> Result<T, LockError>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    match timeout(limit, request).await {
        Ok(result) => result.map_err(|err| LockError::service(operation, err)),
        Err(_) => Err(LockError::service(
            operation,
            format!("no response within {}", secs(limit)),
        )),
    }
}

fn secs(d: Duration) -> String {
    format!("{}s", d.as_secs())
}
