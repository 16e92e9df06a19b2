//! A numbered ring of hosts inside a ring group

use crate::common::{PartitionServerAddress, Result};
use crate::coordinator::host::{Host, HostCommand, HostState};
use crate::store::{path, CoordinationStore, CreateMode, Subscription};
use std::fmt;

const RING_PREFIX: &str = "ring-";
const HOSTS_PATH: &str = "hosts";

/// Parse a ring node name of the form `ring-<n>`
pub fn parse_ring_number(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(RING_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn ring_node_name(number: u32) -> String {
    format!("{}{}", RING_PREFIX, number)
}

#[derive(Clone)]
pub struct Ring {
    store: CoordinationStore,
    path: String,
    ring_group_name: String,
    number: u32,
}

impl Ring {
    pub(crate) fn create(
        store: &CoordinationStore,
        ring_group_path: &str,
        ring_group_name: &str,
        number: u32,
    ) -> Result<Ring> {
        let ring_path = path::join(ring_group_path, &ring_node_name(number));
        store.create(&ring_path, &[], CreateMode::Persistent)?;
        store.create(&path::join(&ring_path, HOSTS_PATH), &[], CreateMode::Persistent)?;
        Ok(Ring {
            store: store.clone(),
            path: ring_path,
            ring_group_name: ring_group_name.to_string(),
            number,
        })
    }

    pub(crate) fn load(
        store: &CoordinationStore,
        ring_group_path: &str,
        ring_group_name: &str,
        number: u32,
    ) -> Result<Ring> {
        let ring_path = path::join(ring_group_path, &ring_node_name(number));
        if store.exists(&ring_path).is_none() {
            return Err(crate::Error::RingNotFound {
                ring_group: ring_group_name.to_string(),
                ring: number,
            });
        }
        Ok(Ring {
            store: store.clone(),
            path: ring_path,
            ring_group_name: ring_group_name.to_string(),
            number,
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn ring_group_name(&self) -> &str {
        &self.ring_group_name
    }

    fn hosts_path(&self) -> String {
        path::join(&self.path, HOSTS_PATH)
    }

    /// Hosts ordered by address
    pub fn hosts(&self) -> Result<Vec<Host>> {
        let hosts_path = self.hosts_path();
        let mut hosts = Vec::new();
        for child in self.store.children(&hosts_path)? {
            match Host::load(&self.store, &path::join(&hosts_path, &child)) {
                Ok(host) => hosts.push(host),
                // Removed between listing and loading
                Err(crate::Error::HostNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        hosts.sort_by(|a, b| a.address().cmp(b.address()));
        Ok(hosts)
    }

    pub fn host(&self, address: &PartitionServerAddress) -> Result<Option<Host>> {
        let host_path = path::join(
            &self.hosts_path(),
            &crate::common::encode_segment(&address.to_string()),
        );
        match Host::load(&self.store, &host_path) {
            Ok(host) => Ok(Some(host)),
            Err(crate::Error::HostNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn add_host(&self, address: &PartitionServerAddress, flags: &[String]) -> Result<Host> {
        let host = Host::create(&self.store, &self.hosts_path(), address, flags)?;
        tracing::info!(
            "Added host {} to ring {} of {}",
            address,
            self.number,
            self.ring_group_name
        );
        Ok(host)
    }

    /// Remove a host with everything below it; returns whether it existed
    pub fn remove_host(&self, address: &PartitionServerAddress) -> Result<bool> {
        match self.host(address)? {
            Some(host) => {
                host.delete()?;
                tracing::info!(
                    "Removed host {} from ring {} of {}",
                    address,
                    self.number,
                    self.ring_group_name
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Enqueue `command` on every host; returns the number of hosts commanded
    pub fn command_all(&self, command: HostCommand) -> Result<usize> {
        let hosts = self.hosts()?;
        for host in &hosts {
            host.enqueue_command(command)?;
        }
        tracing::info!(
            "Sent {} to {} hosts of ring {} in {}",
            command,
            hosts.len(),
            self.number,
            self.ring_group_name
        );
        Ok(hosts.len())
    }

    pub fn hosts_in_state(&self, state: HostState) -> Result<Vec<Host>> {
        let mut matching = Vec::new();
        for host in self.hosts()? {
            if host.state()? == state {
                matching.push(host);
            }
        }
        Ok(matching)
    }

    /// Fires when hosts are added or removed
    pub fn subscribe_hosts(&self) -> Subscription<Vec<PartitionServerAddress>> {
        let ring = self.clone();
        Subscription::new(vec![self.store.watch(&self.hosts_path())], move || {
            Ok(ring.hosts()?.iter().map(|h| h.address().clone()).collect())
        })
    }

    pub(crate) fn delete(&self) -> Result<()> {
        self.store.delete_recursive(&self.path)
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("ring_group", &self.ring_group_name)
            .field("number", &self.number)
            .finish()
    }
}
