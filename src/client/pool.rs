//! Host connection pool
//!
//! Groups every connection to every host able to serve one partition and
//! decides which connection a query uses.
//!
//! Hosts are indexed `0..n` in a shuffled order: deterministic when a seed is
//! given, so pools for the same partition in different processes agree on
//! their fallback order. A shared cursor remembers the last host picked by a
//! top-level query so consecutive queries rotate over hosts.
//!
//! Selection walks hosts starting after a given index, in three laps:
//! 1. a serving host with a connection that can be locked without waiting
//!    (returned locked)
//! 2. a random connection of a serving host (returned unlocked)
//! 3. a random connection of a host reported offline, as a last resort while
//!    liveness tracking lags behind reality
//!
//! A transport failure retries from the host after the one that failed, up
//! to `max_tries` attempts.

use crate::client::connection::{ConnectionGuard, HostConnection};
use crate::client::load::ConnectionLoad;
use crate::client::response::{BulkResponse, GetResponse, QueryError};
use crate::common::{key_to_hex, PartitionServerAddress, Result};
use crate::coordinator::Domain;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Connection picked for one attempt
pub struct Selection<C> {
    pub connection: Arc<C>,
    pub host_index: usize,
    guard: Option<ConnectionGuard>,
}

impl<C> Selection<C> {
    /// Whether this selection holds the connection's lock
    pub fn is_locked(&self) -> bool {
        self.guard.is_some()
    }
}

pub struct HostConnectionPool<C> {
    /// Connections per host index, each list shuffled
    hosts: Vec<Vec<Arc<C>>>,
    addresses: Vec<PartitionServerAddress>,
    /// Host picked by the last top-level query
    previously_used_host: Mutex<usize>,
}

impl<C: HostConnection> HostConnectionPool<C> {
    /// Build a pool from connections grouped by host. Hosts without
    /// connections are ignored; an empty pool is an error.
    pub fn new(
        connections: HashMap<PartitionServerAddress, Vec<Arc<C>>>,
        host_shuffle_seed: Option<u32>,
    ) -> Result<Self> {
        let mut connections: HashMap<_, _> = connections
            .into_iter()
            .filter(|(_, conns)| !conns.is_empty())
            .collect();
        if connections.is_empty() {
            return Err(crate::Error::EmptyPool);
        }

        let mut addresses: Vec<PartitionServerAddress> = connections.keys().cloned().collect();
        let mut rng = rand::thread_rng();
        match host_shuffle_seed {
            Some(seed) => {
                addresses.sort();
                addresses.shuffle(&mut StdRng::seed_from_u64(u64::from(seed)));
            }
            None => addresses.shuffle(&mut rng),
        }

        let hosts: Vec<Vec<Arc<C>>> = addresses
            .iter()
            .map(|address| {
                let mut conns = connections.remove(address).unwrap_or_default();
                conns.shuffle(&mut rng);
                conns
            })
            .collect();
        let previously_used_host = rng.gen_range(0..hosts.len());

        Ok(Self {
            hosts,
            addresses,
            previously_used_host: Mutex::new(previously_used_host),
        })
    }

    /// Build a pool from a flat list, grouping connections by host address
    pub fn from_connections(connections: Vec<Arc<C>>, host_shuffle_seed: Option<u32>) -> Result<Self> {
        let mut by_host: HashMap<PartitionServerAddress, Vec<Arc<C>>> = HashMap::new();
        for connection in connections {
            by_host
                .entry(connection.host_address().clone())
                .or_default()
                .push(connection);
        }
        Self::new(by_host, host_shuffle_seed)
    }

    pub fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    /// Host addresses in pool order
    pub fn host_addresses(&self) -> &[PartitionServerAddress] {
        &self.addresses
    }

    pub fn connections(&self) -> impl Iterator<Item = &Arc<C>> {
        self.hosts.iter().flatten()
    }

    fn next_host_index(&self, index: usize) -> usize {
        if index + 1 >= self.hosts.len() {
            0
        } else {
            index + 1
        }
    }

    fn lock_cursor(&self) -> std::sync::MutexGuard<'_, usize> {
        self.previously_used_host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick a connection starting after the host at `previous_index`
    pub fn next_connection_to_use(&self, previous_index: usize) -> Option<Selection<C>> {
        let mut index = previous_index;

        // Lap 1: a free connection on a serving host
        for _ in 0..self.hosts.len() {
            index = self.next_host_index(index);
            for connection in &self.hosts[index] {
                // One connection not serving means the host is not serving
                if !connection.is_serving() {
                    break;
                }
                if let Some(guard) = connection.try_lock_respecting_fairness() {
                    return Some(Selection {
                        connection: connection.clone(),
                        host_index: index,
                        guard: Some(guard),
                    });
                }
            }
        }

        let mut rng = rand::thread_rng();

        // Lap 2: any connection of a serving host
        for _ in 0..self.hosts.len() {
            index = self.next_host_index(index);
            if let Some(connection) = self.hosts[index].choose(&mut rng) {
                if connection.is_serving() {
                    return Some(Selection {
                        connection: connection.clone(),
                        host_index: index,
                        guard: None,
                    });
                }
            }
        }

        // Lap 3: a host believed offline
        for _ in 0..self.hosts.len() {
            index = self.next_host_index(index);
            if let Some(connection) = self.hosts[index].choose(&mut rng) {
                if connection.is_offline() {
                    return Some(Selection {
                        connection: connection.clone(),
                        host_index: index,
                        guard: None,
                    });
                }
            }
        }

        None
    }

    /// Pick a connection for a fresh query, rotating the shared cursor
    pub fn connection_to_use(&self) -> Option<Selection<C>> {
        let start = {
            let mut cursor = self.lock_cursor();
            let start = *cursor;
            *cursor = self.next_host_index(start);
            start
        };
        let claimed = self.next_host_index(start);

        let selection = self.next_connection_to_use(start)?;
        if selection.host_index != claimed {
            let mut cursor = self.lock_cursor();
            // Leave the cursor alone if another query moved it meanwhile
            if *cursor == claimed {
                *cursor = selection.host_index;
            }
        }
        Some(selection)
    }

    /// Pick a connection starting from a host derived from `key_hash`. The
    /// shared cursor is not touched.
    pub fn connection_to_use_for_key(&self, key_hash: u64) -> Option<Selection<C>> {
        let start = (key_hash % self.hosts.len() as u64) as usize;
        self.next_connection_to_use(start)
    }

    pub async fn get(
        &self,
        domain: &Domain,
        key: &[u8],
        max_tries: usize,
        key_hash: Option<u64>,
    ) -> std::result::Result<GetResponse, QueryError> {
        let max_tries = max_tries.max(1);
        let mut num_tries = 0;
        let mut previous: Option<usize> = None;

        loop {
            let selection = match (previous, key_hash) {
                (Some(failed), _) => self.next_connection_to_use(failed),
                (None, Some(hash)) => self.connection_to_use_for_key(hash),
                (None, None) => self.connection_to_use(),
            };
            let Some(selection) = selection else {
                tracing::error!(
                    "No connection is available. Giving up. Domain = {}, Key = {}",
                    domain.name(),
                    key_to_hex(key)
                );
                return Err(QueryError::NoConnectionAvailable);
            };
            previous = Some(selection.host_index);

            match selection.connection.get(domain.id(), key).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    num_tries += 1;
                    let address = selection.connection.host_address();
                    if num_tries < max_tries {
                        tracing::error!(
                            "Failed to perform query with host {}. Retrying. Try {}/{}, Domain = {}, Key = {}: {}",
                            address,
                            num_tries,
                            max_tries,
                            domain.name(),
                            key_to_hex(key),
                            e
                        );
                    } else {
                        tracing::error!(
                            "Failed to perform query with host {}. Giving up. Try {}/{}, Domain = {}, Key = {}: {}",
                            address,
                            num_tries,
                            max_tries,
                            domain.name(),
                            key_to_hex(key),
                            e
                        );
                        return Err(QueryError::RetriesExhausted(max_tries));
                    }
                }
            }
        }
    }

    pub async fn get_bulk(
        &self,
        domain_id: u32,
        keys: &[Bytes],
        max_tries: usize,
    ) -> std::result::Result<BulkResponse, QueryError> {
        let max_tries = max_tries.max(1);
        let mut num_tries = 0;
        let mut previous: Option<usize> = None;

        loop {
            let selection = match previous {
                Some(failed) => self.next_connection_to_use(failed),
                None => self.connection_to_use(),
            };
            let Some(selection) = selection else {
                tracing::error!("No connection is available. Giving up. Num keys = {}", keys.len());
                return Err(QueryError::NoConnectionAvailable);
            };
            previous = Some(selection.host_index);

            match selection.connection.get_bulk(domain_id, keys).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    num_tries += 1;
                    if num_tries < max_tries {
                        tracing::error!(
                            "Failed to perform bulk query with host #{}. Retrying. Try {}/{}, Num keys = {}: {}",
                            selection.host_index,
                            num_tries,
                            max_tries,
                            keys.len(),
                            e
                        );
                    } else {
                        tracing::error!(
                            "Failed to perform bulk query with host #{}. Giving up. Try {}/{}, Num keys = {}: {}",
                            selection.host_index,
                            num_tries,
                            max_tries,
                            keys.len(),
                            e
                        );
                        return Err(QueryError::RetriesExhausted(max_tries));
                    }
                }
            }
        }
    }

    /// Snapshot of how many connections are currently locked
    pub fn connection_load(&self) -> ConnectionLoad {
        let mut load = ConnectionLoad::default();
        for connection in self.connections() {
            load.num_connections += 1;
            if connection.is_locked() {
                load.num_locked_connections += 1;
            }
        }
        load
    }
}
