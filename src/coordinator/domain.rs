//! Domains and their versions
//!
//! ```text
//! /domains                       next domain id
//!     <name>                     DomainMetadata
//!         versions/<n>           DomainVersionMetadata
//! ```

use crate::common::{encode_segment, timestamp_now_millis, Result};
use crate::coordinator::watched::WatchedNode;
use crate::coordinator::DOMAINS_ROOT;
use crate::store::{path, CoordinationStore, CreateMode};
use serde::{Deserialize, Serialize};
use std::fmt;

const VERSIONS_PATH: &str = "versions";

/// Stored definition of a domain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMetadata {
    pub id: u32,
    pub num_partitions: u32,
    pub storage_engine_factory: String,
    pub storage_engine_options: String,
    pub partitioner: String,
    pub required_host_flags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainVersionMetadata {
    pub created_at: u64,
    pub closed_at: Option<u64>,
    pub defunct: bool,
}

pub(crate) fn domain_path(name: &str) -> String {
    path::join(DOMAINS_ROOT, &encode_segment(name))
}

/// Snapshot of a domain definition. Call [`Domain::reload`] for fresh values.
#[derive(Clone)]
pub struct Domain {
    store: CoordinationStore,
    name: String,
    metadata: DomainMetadata,
}

impl Domain {
    pub(crate) fn create(store: &CoordinationStore, name: &str, metadata: DomainMetadata) -> Result<Domain> {
        let domain_path = domain_path(name);
        WatchedNode::new(store.clone(), domain_path.clone()).create(&metadata)?;
        store.create(&path::join(&domain_path, VERSIONS_PATH), &[], CreateMode::Persistent)?;
        Ok(Domain {
            store: store.clone(),
            name: name.to_string(),
            metadata,
        })
    }

    pub(crate) fn load(store: &CoordinationStore, name: &str) -> Result<Domain> {
        let metadata = WatchedNode::<DomainMetadata>::new(store.clone(), domain_path(name))
            .get()?
            .ok_or_else(|| crate::Error::DomainNotFound(name.to_string()))?;
        Ok(Domain {
            store: store.clone(),
            name: name.to_string(),
            metadata,
        })
    }

    pub fn reload(&self) -> Result<Domain> {
        Self::load(&self.store, &self.name)
    }

    pub(crate) fn update_metadata(&self, apply: impl FnMut(&mut DomainMetadata)) -> Result<Domain> {
        let metadata = WatchedNode::new(self.store.clone(), self.path()).update(apply)?;
        Ok(Domain {
            store: self.store.clone(),
            name: self.name.clone(),
            metadata,
        })
    }

    fn path(&self) -> String {
        domain_path(&self.name)
    }

    fn versions_path(&self) -> String {
        path::join(&self.path(), VERSIONS_PATH)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.metadata.id
    }

    pub fn num_partitions(&self) -> u32 {
        self.metadata.num_partitions
    }

    pub fn storage_engine_factory(&self) -> &str {
        &self.metadata.storage_engine_factory
    }

    pub fn storage_engine_options(&self) -> &str {
        &self.metadata.storage_engine_options
    }

    pub fn partitioner(&self) -> &str {
        &self.metadata.partitioner
    }

    pub fn required_host_flags(&self) -> &[String] {
        &self.metadata.required_host_flags
    }

    pub fn metadata(&self) -> &DomainMetadata {
        &self.metadata
    }

    // === Versions ===

    /// Versions ordered by number
    pub fn versions(&self) -> Result<Vec<DomainVersion>> {
        let mut numbers: Vec<u32> = self
            .store
            .children(&self.versions_path())?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        numbers.sort_unstable();
        Ok(numbers
            .into_iter()
            .map(|number| self.version_handle(number))
            .collect())
    }

    pub fn version(&self, number: u32) -> Result<DomainVersion> {
        let version = self.version_handle(number);
        if self.store.exists(version.node.path()).is_none() {
            return Err(crate::Error::DomainVersionNotFound {
                domain: self.name.clone(),
                version: number,
            });
        }
        Ok(version)
    }

    pub fn latest_version(&self) -> Result<Option<DomainVersion>> {
        Ok(self.versions()?.pop())
    }

    /// Open a new version numbered one past the latest
    pub fn open_new_version(&self) -> Result<DomainVersion> {
        loop {
            let number = match self.latest_version()? {
                Some(latest) => latest.number + 1,
                None => 0,
            };
            let version = self.version_handle(number);
            let metadata = DomainVersionMetadata {
                created_at: timestamp_now_millis(),
                closed_at: None,
                defunct: false,
            };
            match version.node.create(&metadata) {
                Ok(()) => {
                    tracing::info!("Opened version {} of domain {}", number, self.name);
                    return Ok(version);
                }
                Err(crate::Error::NodeExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn version_handle(&self, number: u32) -> DomainVersion {
        DomainVersion {
            domain: self.name.clone(),
            number,
            node: WatchedNode::new(
                self.store.clone(),
                path::join(&self.versions_path(), &number.to_string()),
            ),
        }
    }

    pub(crate) fn delete(&self) -> Result<()> {
        self.store.delete_recursive(&self.path())
    }
}

impl PartialEq for Domain {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.metadata.id == other.metadata.id
    }
}

impl Eq for Domain {}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// One version of a domain's data
#[derive(Clone)]
pub struct DomainVersion {
    domain: String,
    number: u32,
    node: WatchedNode<DomainVersionMetadata>,
}

impl DomainVersion {
    pub fn domain_name(&self) -> &str {
        &self.domain
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn metadata(&self) -> Result<DomainVersionMetadata> {
        self.node.get()?.ok_or_else(|| crate::Error::DomainVersionNotFound {
            domain: self.domain.clone(),
            version: self.number,
        })
    }

    pub fn is_closed(&self) -> Result<bool> {
        Ok(self.metadata()?.closed_at.is_some())
    }

    pub fn is_defunct(&self) -> Result<bool> {
        Ok(self.metadata()?.defunct)
    }

    /// Seal the version. A closed version cannot be closed again.
    pub fn close(&self) -> Result<()> {
        let mut already_closed = false;
        self.node.update(|m| {
            already_closed = m.closed_at.is_some();
            if !already_closed {
                m.closed_at = Some(timestamp_now_millis());
            }
        })?;
        if already_closed {
            return Err(crate::Error::DomainVersionClosed {
                domain: self.domain.clone(),
                version: self.number,
            });
        }
        tracing::info!("Closed version {} of domain {}", self.number, self.domain);
        Ok(())
    }

    pub fn set_defunct(&self, defunct: bool) -> Result<()> {
        self.node.update(|m| m.defunct = defunct)?;
        tracing::info!(
            "Domain {} version {} defunct={}",
            self.domain,
            self.number,
            defunct
        );
        Ok(())
    }

    pub(crate) fn delete(&self) -> Result<()> {
        self.node.delete()
    }
}

impl fmt::Debug for DomainVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainVersion")
            .field("domain", &self.domain)
            .field("number", &self.number)
            .finish()
    }
}

/// Reclaims the artifacts a storage engine keeps for a domain version
/// outside the coordination store.
pub trait RemoteDomainVersionDeleter: Send + Sync {
    fn delete_version(&self, domain: &Domain, version: u32) -> Result<()> {
        let _ = (domain, version);
        Err(crate::Error::NotImplemented("remote domain version deletion"))
    }
}

/// Deleter for engines that keep nothing outside the coordination store
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRemoteArtifacts;

impl RemoteDomainVersionDeleter for NoRemoteArtifacts {
    fn delete_version(&self, _domain: &Domain, _version: u32) -> Result<()> {
        Ok(())
    }
}

/// Deleter for engines without deletion support. Every call fails, so
/// nothing is removed from the store while artifacts may remain.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedEngine;

impl RemoteDomainVersionDeleter for UnsupportedEngine {}

/// Pick the deleter for an operator request. Engines are assumed to keep
/// remote artifacts unless the operator states they keep none.
pub fn remote_deleter(no_remote_artifacts: bool) -> &'static dyn RemoteDomainVersionDeleter {
    if no_remote_artifacts {
        &NoRemoteArtifacts
    } else {
        &UnsupportedEngine
    }
}
