//! Storage host view: lifecycle state, flags, partition assignments,
//! ephemeral statistics and the command queue.
//!
//! Layout under the host node:
//!
//! ```text
//! <ring>/hosts/<address>              HostMetadata (flags, partitions)
//!     state                           ephemeral, absent means OFFLINE
//!     statistics                      ephemeral StatisticsMetadata
//!     command_queue/command_<seq>     pending commands, FIFO by sequence
//!     current_command                 command being executed, if any
//! ```

use crate::common::{decode_segment, encode_segment, PartitionServerAddress, Result};
use crate::coordinator::watched::WatchedNode;
use crate::store::{path, CoordinationStore, CreateMode, Session, Subscription};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

const STATE_PATH: &str = "state";
const STATISTICS_PATH: &str = "statistics";
const COMMAND_QUEUE_PATH: &str = "command_queue";
const CURRENT_COMMAND_PATH: &str = "current_command";
const COMMAND_PREFIX: &str = "command_";

/// Lifecycle state of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostState {
    Offline,
    Idle,
    Serving,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostState::Offline => "OFFLINE",
            HostState::Idle => "IDLE",
            HostState::Serving => "SERVING",
        }
    }

    /// State reached by executing `command` from this state, `None` if the
    /// command does not apply.
    pub fn after(self, command: HostCommand) -> Option<HostState> {
        match (self, command) {
            (HostState::Idle | HostState::Serving, HostCommand::GoToIdle) => Some(HostState::Idle),
            (HostState::Idle | HostState::Serving, HostCommand::ServeData) => {
                Some(HostState::Serving)
            }
            (HostState::Idle, HostCommand::ExecuteUpdate) => Some(HostState::Idle),
            _ => None,
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OFFLINE" => Ok(HostState::Offline),
            "IDLE" => Ok(HostState::Idle),
            "SERVING" => Ok(HostState::Serving),
            other => Err(crate::Error::MetadataCorrupted(format!(
                "unknown host state: {}",
                other
            ))),
        }
    }
}

/// Lifecycle command sent to a host through its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostCommand {
    GoToIdle,
    ServeData,
    ExecuteUpdate,
}

impl HostCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostCommand::GoToIdle => "GO_TO_IDLE",
            HostCommand::ServeData => "SERVE_DATA",
            HostCommand::ExecuteUpdate => "EXECUTE_UPDATE",
        }
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostCommand {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GO_TO_IDLE" => Ok(HostCommand::GoToIdle),
            "SERVE_DATA" => Ok(HostCommand::ServeData),
            "EXECUTE_UPDATE" => Ok(HostCommand::ExecuteUpdate),
            other => Err(crate::Error::MetadataCorrupted(format!(
                "unknown host command: {}",
                other
            ))),
        }
    }
}

/// Persistent host metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMetadata {
    pub flags: Vec<String>,
    /// domain id → assigned partition numbers
    pub partitions: BTreeMap<u32, BTreeSet<u32>>,
}

/// Runtime statistics published by the host process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsMetadata {
    pub statistics: BTreeMap<String, String>,
}

/// View of one host stored in the coordination store
#[derive(Clone)]
pub struct Host {
    store: CoordinationStore,
    path: String,
    address: PartitionServerAddress,
    metadata: WatchedNode<HostMetadata>,
    statistics: WatchedNode<StatisticsMetadata>,
}

impl Host {
    pub(crate) fn create(
        store: &CoordinationStore,
        hosts_path: &str,
        address: &PartitionServerAddress,
        flags: &[String],
    ) -> Result<Host> {
        let host_path = path::join(hosts_path, &encode_segment(&address.to_string()));
        tracing::debug!("Creating host {}", host_path);

        let host = Self::at(store, host_path, address.clone());
        host.metadata.create(&HostMetadata {
            flags: crate::common::split_flags(&crate::common::join_flags(flags)),
            partitions: BTreeMap::new(),
        })?;
        store.create(&host.child(COMMAND_QUEUE_PATH), &[], CreateMode::Persistent)?;
        Ok(host)
    }

    pub(crate) fn load(store: &CoordinationStore, host_path: &str) -> Result<Host> {
        let address = PartitionServerAddress::parse(&decode_segment(path::file_name(host_path))?)?;
        if store.exists(host_path).is_none() {
            return Err(crate::Error::HostNotFound(address.to_string()));
        }
        Ok(Self::at(store, host_path.to_string(), address))
    }

    fn at(store: &CoordinationStore, host_path: String, address: PartitionServerAddress) -> Host {
        Host {
            store: store.clone(),
            metadata: WatchedNode::new(store.clone(), host_path.clone()),
            statistics: WatchedNode::new(store.clone(), path::join(&host_path, STATISTICS_PATH)),
            path: host_path,
            address,
        }
    }

    fn child(&self, name: &str) -> String {
        path::join(&self.path, name)
    }

    pub fn address(&self) -> &PartitionServerAddress {
        &self.address
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    // === State ===

    pub fn state(&self) -> Result<HostState> {
        match self.store.get_string(&self.child(STATE_PATH))? {
            Some(state) => state.parse(),
            None => Ok(HostState::Offline),
        }
    }

    /// Publish the host state. Non-offline states live only as long as
    /// `session`; OFFLINE removes the state node.
    pub fn set_state(&self, session: &Session, state: HostState) -> Result<()> {
        let state_path = self.child(STATE_PATH);
        if state == HostState::Offline {
            self.store.delete_if_exists(&state_path)?;
        } else {
            self.store
                .set_or_create_ephemeral(session, &state_path, state.as_str().as_bytes())?;
        }
        tracing::debug!("Host {} is now {}", self.address, state);
        Ok(())
    }

    pub fn is_serving(&self) -> Result<bool> {
        Ok(self.state()? == HostState::Serving)
    }

    /// Time (ms since epoch) the host left OFFLINE, `None` while offline
    pub fn up_since(&self) -> Result<Option<u64>> {
        if self.state()? == HostState::Offline {
            return Ok(None);
        }
        Ok(self.store.exists(&self.child(STATE_PATH)).map(|stat| stat.ctime))
    }

    pub fn subscribe_state(&self) -> Subscription<HostState> {
        let host = self.clone();
        Subscription::new(vec![self.store.watch(&self.child(STATE_PATH))], move || {
            host.state()
        })
    }

    // === Flags ===

    pub fn flags(&self) -> Result<Vec<String>> {
        Ok(self.metadata.get_or_default()?.flags)
    }

    pub fn set_flags(&self, flags: &[String]) -> Result<()> {
        let normalized = crate::common::split_flags(&crate::common::join_flags(flags));
        self.metadata.update(|m| m.flags = normalized.clone())?;
        Ok(())
    }

    pub fn has_flags(&self, required: &[String]) -> Result<bool> {
        let flags = self.flags()?;
        Ok(required.iter().all(|f| flags.contains(f)))
    }

    // === Partition assignments ===

    pub fn assigned_partitions(&self) -> Result<BTreeMap<u32, BTreeSet<u32>>> {
        Ok(self.metadata.get_or_default()?.partitions)
    }

    pub fn partitions(&self, domain_id: u32) -> Result<BTreeSet<u32>> {
        Ok(self
            .assigned_partitions()?
            .remove(&domain_id)
            .unwrap_or_default())
    }

    pub fn add_partition(&self, domain_id: u32, partition: u32) -> Result<bool> {
        let mut added = false;
        self.metadata.update(|m| {
            added = m.partitions.entry(domain_id).or_default().insert(partition);
        })?;
        Ok(added)
    }

    pub fn remove_partition(&self, domain_id: u32, partition: u32) -> Result<bool> {
        let mut removed = false;
        self.metadata.update(|m| {
            removed = false;
            if let Some(parts) = m.partitions.get_mut(&domain_id) {
                removed = parts.remove(&partition);
                if parts.is_empty() {
                    m.partitions.remove(&domain_id);
                }
            }
        })?;
        Ok(removed)
    }

    /// Replace the assignment for one domain
    pub fn set_partitions(&self, domain_id: u32, partitions: BTreeSet<u32>) -> Result<()> {
        self.metadata.update(|m| {
            if partitions.is_empty() {
                m.partitions.remove(&domain_id);
            } else {
                m.partitions.insert(domain_id, partitions.clone());
            }
        })?;
        Ok(())
    }

    // === Statistics ===

    pub fn set_ephemeral_statistic(&self, session: &Session, key: &str, value: &str) -> Result<()> {
        self.statistics.ensure_created_ephemeral(session)?;
        self.statistics.update(|s| {
            s.statistics.insert(key.to_string(), value.to_string());
        })?;
        Ok(())
    }

    pub fn statistic(&self, key: &str) -> Result<Option<String>> {
        Ok(self.statistics.get_or_default()?.statistics.remove(key))
    }

    pub fn statistics(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.statistics.get_or_default()?.statistics)
    }

    pub fn delete_statistic(&self, key: &str) -> Result<()> {
        match self.statistics.update(|s| {
            s.statistics.remove(key);
        }) {
            Ok(_) | Err(crate::Error::NodeNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // === Command queue ===

    pub fn enqueue_command(&self, command: HostCommand) -> Result<()> {
        let prefix = path::join(&self.child(COMMAND_QUEUE_PATH), COMMAND_PREFIX);
        self.store
            .create(&prefix, command.as_str().as_bytes(), CreateMode::PersistentSequential)?;
        Ok(())
    }

    /// Pending commands, head first
    pub fn command_queue(&self) -> Result<Vec<HostCommand>> {
        let queue_path = self.child(COMMAND_QUEUE_PATH);
        let mut queue = Vec::new();
        for child in self.store.children(&queue_path)? {
            // Popped concurrently
            if let Some(command) = self.store.get_string(&path::join(&queue_path, &child))? {
                queue.push(command.parse()?);
            }
        }
        Ok(queue)
    }

    /// Pop the head of the queue and make it the current command.
    /// With an empty queue the current command is cleared.
    pub fn next_command(&self) -> Result<Option<HostCommand>> {
        let queue_path = self.child(COMMAND_QUEUE_PATH);
        loop {
            let children = self.store.children(&queue_path)?;
            let Some(head) = children.first() else {
                self.store.delete_if_exists(&self.child(CURRENT_COMMAND_PATH))?;
                return Ok(None);
            };
            let head_path = path::join(&queue_path, head);
            let command: HostCommand = match self.store.get_string(&head_path)? {
                Some(command) => command.parse()?,
                None => continue,
            };
            // Record the command before removing it so a crash in between
            // repeats it instead of losing it. Deleting the head claims it; a
            // concurrent pop that lost the race moves on.
            self.store
                .set_or_create(&self.child(CURRENT_COMMAND_PATH), command.as_str().as_bytes())?;
            match self.store.delete(&head_path, None) {
                Ok(()) => return Ok(Some(command)),
                Err(crate::Error::NodeNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn current_command(&self) -> Result<Option<HostCommand>> {
        match self.store.get_string(&self.child(CURRENT_COMMAND_PATH))? {
            Some(s) if !s.is_empty() => Ok(Some(s.parse()?)),
            _ => Ok(None),
        }
    }

    /// Report that the current command finished
    pub fn complete_current_command(&self) -> Result<()> {
        self.store.delete_if_exists(&self.child(CURRENT_COMMAND_PATH))?;
        Ok(())
    }

    pub fn clear_command_queue(&self) -> Result<()> {
        let queue_path = self.child(COMMAND_QUEUE_PATH);
        for child in self.store.children(&queue_path)? {
            self.store.delete_if_exists(&path::join(&queue_path, &child))?;
        }
        Ok(())
    }

    /// Pop the next command, apply its state transition and complete it.
    /// Commands that do not apply in the current state are dropped.
    pub fn execute_next_command(&self, session: &Session) -> Result<Option<HostCommand>> {
        let Some(command) = self.next_command()? else {
            return Ok(None);
        };
        let state = self.state()?;
        match state.after(command) {
            Some(next) if next != state => {
                self.set_state(session, next)?;
                tracing::info!("Host {}: {} moved {} -> {}", self.address, command, state, next);
            }
            Some(_) => {
                tracing::debug!("Host {}: {} leaves state {}", self.address, command, state);
            }
            None => {
                tracing::warn!(
                    "Host {}: ignoring command {} in state {}",
                    self.address,
                    command,
                    state
                );
            }
        }
        self.complete_current_command()?;
        Ok(Some(command))
    }

    pub fn subscribe_command_queue(&self) -> Subscription<Vec<HostCommand>> {
        let host = self.clone();
        Subscription::new(
            vec![self.store.watch(&self.child(COMMAND_QUEUE_PATH))],
            move || host.command_queue(),
        )
    }

    pub fn subscribe_current_command(&self) -> Subscription<Option<HostCommand>> {
        let host = self.clone();
        Subscription::new(
            vec![self.store.watch(&self.child(CURRENT_COMMAND_PATH))],
            move || host.current_command(),
        )
    }

    pub(crate) fn delete(&self) -> Result<()> {
        self.store.delete_recursive(&self.path)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("path", &self.path)
            .finish()
    }
}
