//! Versioned bundles of domains served together

use crate::common::{encode_segment, timestamp_now_millis, Result};
use crate::coordinator::watched::WatchedNode;
use crate::coordinator::DOMAIN_GROUPS_ROOT;
use crate::store::{path, CoordinationStore, CreateMode, Subscription};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

const VERSIONS_PATH: &str = "versions";

/// One version of a domain group: which version of each domain it serves
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainGroupVersion {
    pub number: u32,
    pub created_at: u64,
    /// domain name → domain version number
    pub domain_versions: BTreeMap<String, u32>,
}

impl DomainGroupVersion {
    pub fn domain_version(&self, domain: &str) -> Option<u32> {
        self.domain_versions.get(domain).copied()
    }

    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.domain_versions.keys().map(String::as_str)
    }
}

pub(crate) fn domain_group_path(name: &str) -> String {
    path::join(DOMAIN_GROUPS_ROOT, &encode_segment(name))
}

#[derive(Clone)]
pub struct DomainGroup {
    store: CoordinationStore,
    name: String,
    path: String,
}

impl DomainGroup {
    pub(crate) fn create(store: &CoordinationStore, name: &str) -> Result<DomainGroup> {
        let group_path = domain_group_path(name);
        store.create(&group_path, &[], CreateMode::Persistent)?;
        store.create(&path::join(&group_path, VERSIONS_PATH), &[], CreateMode::Persistent)?;
        Ok(DomainGroup {
            store: store.clone(),
            name: name.to_string(),
            path: group_path,
        })
    }

    pub(crate) fn load(store: &CoordinationStore, name: &str) -> Result<DomainGroup> {
        let group_path = domain_group_path(name);
        if store.exists(&group_path).is_none() {
            return Err(crate::Error::DomainGroupNotFound(name.to_string()));
        }
        Ok(DomainGroup {
            store: store.clone(),
            name: name.to_string(),
            path: group_path,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn versions_path(&self) -> String {
        path::join(&self.path, VERSIONS_PATH)
    }

    fn version_node(&self, number: u32) -> WatchedNode<DomainGroupVersion> {
        WatchedNode::new(
            self.store.clone(),
            path::join(&self.versions_path(), &number.to_string()),
        )
    }

    fn version_numbers(&self) -> Result<Vec<u32>> {
        let mut numbers: Vec<u32> = self
            .store
            .children(&self.versions_path())?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// All versions ordered by number
    pub fn versions(&self) -> Result<Vec<DomainGroupVersion>> {
        let mut versions = Vec::new();
        for number in self.version_numbers()? {
            if let Some(version) = self.version_node(number).get()? {
                versions.push(version);
            }
        }
        Ok(versions)
    }

    pub fn version(&self, number: u32) -> Result<Option<DomainGroupVersion>> {
        self.version_node(number).get()
    }

    pub fn latest_version(&self) -> Result<Option<DomainGroupVersion>> {
        match self.version_numbers()?.last() {
            Some(&number) => self.version(number),
            None => Ok(None),
        }
    }

    /// Record a new version one past the latest. Domain references are not
    /// validated here.
    pub fn create_version(&self, domain_versions: BTreeMap<String, u32>) -> Result<DomainGroupVersion> {
        loop {
            let number = match self.version_numbers()?.last() {
                Some(latest) => latest + 1,
                None => 0,
            };
            let version = DomainGroupVersion {
                number,
                created_at: timestamp_now_millis(),
                domain_versions: domain_versions.clone(),
            };
            match self.version_node(number).create(&version) {
                Ok(()) => {
                    tracing::info!("Created version {} of domain group {}", number, self.name);
                    return Ok(version);
                }
                Err(crate::Error::NodeExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Domains served by the latest version
    pub fn domains(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .latest_version()?
            .map(|v| v.domain_versions.into_keys().collect())
            .unwrap_or_default())
    }

    /// Domains referenced by any version
    pub fn all_domains(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .versions()?
            .into_iter()
            .flat_map(|v| v.domain_versions.into_keys())
            .collect())
    }

    /// Fires when a version is added
    pub fn subscribe_versions(&self) -> Subscription<Vec<DomainGroupVersion>> {
        let group = self.clone();
        Subscription::new(vec![self.store.watch(&self.versions_path())], move || {
            group.versions()
        })
    }
}

impl PartialEq for DomainGroup {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for DomainGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainGroup").field("name", &self.name).finish()
    }
}
