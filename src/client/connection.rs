//! Host connections
//!
//! A [`HostConnection`] is one logical link to a partition server. The pool
//! only needs its liveness predicates, its lock and its two query calls;
//! [`PartitionServerConnection`] is the implementation that follows the
//! host's state in the coordination store and delegates I/O to a
//! [`Transport`].

use crate::client::response::{BulkResponse, GetResponse};
use crate::common::PartitionServerAddress;
use crate::coordinator::{Host, HostState};
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Mutual exclusion marking that a caller is waiting on a reply from a
/// connection. Waiters are served in FIFO order.
#[derive(Debug, Clone)]
pub struct ConnectionLock {
    semaphore: Arc<Semaphore>,
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    _permit: OwnedSemaphorePermit,
}

impl ConnectionLock {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the lock if it is free and nobody is queued for it. Never waits.
    pub fn try_lock_respecting_fairness(&self) -> Option<ConnectionGuard> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| ConnectionGuard { _permit: permit })
    }

    /// Wait for the lock
    pub async fn lock(&self) -> crate::Result<ConnectionGuard> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| crate::Error::Internal("connection lock closed".into()))?;
        Ok(ConnectionGuard { _permit: permit })
    }

    pub fn is_locked(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

impl Default for ConnectionLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Contract the connection pool relies on
pub trait HostConnection: Send + Sync + 'static {
    fn host_address(&self) -> &PartitionServerAddress;

    /// The host last reported SERVING
    fn is_serving(&self) -> bool;

    /// The host last reported OFFLINE. Neither this nor `is_serving` holds
    /// while the host is idle.
    fn is_offline(&self) -> bool;

    fn connection_lock(&self) -> &ConnectionLock;

    fn try_lock_respecting_fairness(&self) -> Option<ConnectionGuard> {
        self.connection_lock().try_lock_respecting_fairness()
    }

    fn is_locked(&self) -> bool {
        self.connection_lock().is_locked()
    }

    /// One round-trip. `Err` is a transport failure; anything the server
    /// answered is `Ok`.
    fn get(&self, domain_id: u32, key: &[u8]) -> impl Future<Output = io::Result<GetResponse>> + Send;

    fn get_bulk(
        &self,
        domain_id: u32,
        keys: &[Bytes],
    ) -> impl Future<Output = io::Result<BulkResponse>> + Send;
}

/// Wire-level request execution for a [`PartitionServerConnection`]
pub trait Transport: Send + Sync + 'static {
    fn get(&self, domain_id: u32, key: &[u8]) -> impl Future<Output = io::Result<GetResponse>> + Send;

    fn get_bulk(
        &self,
        domain_id: u32,
        keys: &[Bytes],
    ) -> impl Future<Output = io::Result<BulkResponse>> + Send;
}

/// Last observed host state, shared with the follower task
#[derive(Debug)]
pub struct HostStateCache(AtomicU8);

impl HostStateCache {
    pub fn new(state: HostState) -> Self {
        Self(AtomicU8::new(Self::encode(state)))
    }

    fn encode(state: HostState) -> u8 {
        match state {
            HostState::Offline => 0,
            HostState::Idle => 1,
            HostState::Serving => 2,
        }
    }

    pub fn get(&self) -> HostState {
        match self.0.load(Ordering::Acquire) {
            2 => HostState::Serving,
            1 => HostState::Idle,
            _ => HostState::Offline,
        }
    }

    pub fn set(&self, state: HostState) {
        self.0.store(Self::encode(state), Ordering::Release);
    }
}

/// Connection to a partition server
pub struct PartitionServerConnection<T> {
    address: PartitionServerAddress,
    state: Arc<HostStateCache>,
    lock: ConnectionLock,
    transport: T,
    follower: Option<JoinHandle<()>>,
}

impl<T: Transport> PartitionServerConnection<T> {
    /// Connection whose host state is set by the caller
    pub fn new(address: PartitionServerAddress, state: HostState, transport: T) -> Self {
        Self {
            address,
            state: Arc::new(HostStateCache::new(state)),
            lock: ConnectionLock::new(),
            transport,
            follower: None,
        }
    }

    /// Connection that tracks `host`'s state through a store subscription.
    /// Must be called within a Tokio runtime.
    pub fn follow(host: &Host, transport: T) -> crate::Result<Self> {
        let mut connection = Self::new(host.address().clone(), host.state()?, transport);
        let state = connection.state.clone();
        let mut subscription = host.subscribe_state();
        let address = host.address().clone();

        connection.follower = Some(tokio::spawn(async move {
            loop {
                match subscription.next().await {
                    Ok(next) => {
                        tracing::debug!("Host {} state changed to {}", address, next);
                        state.set(next);
                    }
                    Err(crate::Error::StoreClosed) => break,
                    Err(e) => {
                        tracing::warn!("Failed to read state of host {}: {}", address, e);
                    }
                }
            }
        }));
        Ok(connection)
    }

    pub fn host_state(&self) -> HostState {
        self.state.get()
    }

    pub fn set_host_state(&self, state: HostState) {
        self.state.set(state);
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T> Drop for PartitionServerConnection<T> {
    fn drop(&mut self) {
        if let Some(follower) = self.follower.take() {
            follower.abort();
        }
    }
}

impl<T: Transport> HostConnection for PartitionServerConnection<T> {
    fn host_address(&self) -> &PartitionServerAddress {
        &self.address
    }

    fn is_serving(&self) -> bool {
        self.state.get() == HostState::Serving
    }

    fn is_offline(&self) -> bool {
        self.state.get() == HostState::Offline
    }

    fn connection_lock(&self) -> &ConnectionLock {
        &self.lock
    }

    async fn get(&self, domain_id: u32, key: &[u8]) -> io::Result<GetResponse> {
        tracing::trace!(
            "GET {} domain={} key={}",
            self.address,
            domain_id,
            crate::common::key_to_hex(key)
        );
        self.transport.get(domain_id, key).await
    }

    async fn get_bulk(&self, domain_id: u32, keys: &[Bytes]) -> io::Result<BulkResponse> {
        tracing::trace!("GET_BULK {} domain={} keys={}", self.address, domain_id, keys.len());
        self.transport.get_bulk(domain_id, keys).await
    }
}
