//! Ring groups and the version rollout protocol
//!
//! A rollout is the presence of `updating_to_version`. Completion writes
//! `current_version` first and removes the marker second; the two writes are
//! not atomic, so a marker equal to the current version means the rollout
//! already completed and the marker is only left to clear.

use crate::common::{encode_segment, PartitionServerAddress, Result};
use crate::coordinator::domain::Domain;
use crate::coordinator::domain_group::DomainGroup;
use crate::coordinator::ring::{parse_ring_number, Ring};
use crate::coordinator::RING_GROUPS_ROOT;
use crate::store::{path, CoordinationStore, CreateMode, Session, Subscription};
use serde::Serialize;
use std::fmt;

const CURRENT_VERSION_PATH: &str = "current_version";
const UPDATING_TO_VERSION_PATH: &str = "updating_to_version";
const DATA_DEPLOYER_PATH: &str = "data_deployer";

/// Rollout pointers of a ring group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VersionPointers {
    pub current: Option<u32>,
    pub updating_to: Option<u32>,
}

impl VersionPointers {
    pub fn is_updating(&self) -> bool {
        matches!(self.updating_to, Some(v) if self.current != Some(v))
    }
}

fn parse_marker(marker_path: &str, raw: &[u8]) -> Result<Option<u32>> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| crate::Error::MetadataCorrupted(format!("{} is not UTF-8", marker_path)))?
        .trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse().map(Some).map_err(|_| {
        crate::Error::MetadataCorrupted(format!("{} holds '{}', not an integer", marker_path, text))
    })
}

pub(crate) fn ring_group_path(name: &str) -> String {
    path::join(RING_GROUPS_ROOT, &encode_segment(name))
}

#[derive(Clone)]
pub struct RingGroup {
    store: CoordinationStore,
    name: String,
    path: String,
    domain_group_name: String,
}

impl RingGroup {
    /// Create a ring group serving `domain_group`. If the domain group has a
    /// version, the ring group starts out rolling to it.
    pub(crate) fn create(
        store: &CoordinationStore,
        name: &str,
        domain_group: &DomainGroup,
    ) -> Result<RingGroup> {
        let group_path = ring_group_path(name);
        store.create(&group_path, domain_group.name().as_bytes(), CreateMode::Persistent)?;
        if let Some(latest) = domain_group.latest_version()? {
            store.create(
                &path::join(&group_path, UPDATING_TO_VERSION_PATH),
                latest.number.to_string().as_bytes(),
                CreateMode::Persistent,
            )?;
        }
        Ok(RingGroup {
            store: store.clone(),
            name: name.to_string(),
            path: group_path,
            domain_group_name: domain_group.name().to_string(),
        })
    }

    pub(crate) fn load(store: &CoordinationStore, name: &str) -> Result<RingGroup> {
        let group_path = ring_group_path(name);
        let domain_group_name = store
            .get_string(&group_path)?
            .ok_or_else(|| crate::Error::RingGroupNotFound(name.to_string()))?;
        Ok(RingGroup {
            store: store.clone(),
            name: name.to_string(),
            path: group_path,
            domain_group_name,
        })
    }

    fn child(&self, name: &str) -> String {
        path::join(&self.path, name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain_group_name(&self) -> &str {
        &self.domain_group_name
    }

    pub fn domain_group(&self) -> Result<DomainGroup> {
        DomainGroup::load(&self.store, &self.domain_group_name)
    }

    // === Rings ===

    /// Rings ordered by number
    pub fn rings(&self) -> Result<Vec<Ring>> {
        let mut numbers: Vec<u32> = self
            .store
            .children(&self.path)?
            .iter()
            .filter_map(|name| parse_ring_number(name))
            .collect();
        numbers.sort_unstable();
        numbers
            .into_iter()
            .map(|n| Ring::load(&self.store, &self.path, &self.name, n))
            .collect()
    }

    pub fn ring(&self, number: u32) -> Result<Ring> {
        Ring::load(&self.store, &self.path, &self.name, number)
    }

    pub fn ring_for_host(&self, address: &PartitionServerAddress) -> Result<Ring> {
        for ring in self.rings()? {
            if ring.host(address)?.is_some() {
                return Ok(ring);
            }
        }
        Err(crate::Error::HostNotFound(format!(
            "{} in ring group {}",
            address, self.name
        )))
    }

    pub fn add_ring(&self, number: u32) -> Result<Ring> {
        let ring = Ring::create(&self.store, &self.path, &self.name, number)?;
        tracing::info!("Added ring {} to ring group {}", number, self.name);
        Ok(ring)
    }

    pub fn remove_ring(&self, number: u32) -> Result<bool> {
        match self.ring(number) {
            Ok(ring) => {
                ring.delete()?;
                tracing::info!("Removed ring {} from ring group {}", number, self.name);
                Ok(true)
            }
            Err(crate::Error::RingNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // === Versions ===

    pub fn current_version(&self) -> Result<Option<u32>> {
        self.store.get_u32(&self.child(CURRENT_VERSION_PATH))
    }

    pub fn updating_to_version(&self) -> Result<Option<u32>> {
        self.store.get_u32(&self.child(UPDATING_TO_VERSION_PATH))
    }

    pub fn version_pointers(&self) -> Result<VersionPointers> {
        Ok(VersionPointers {
            current: self.current_version()?,
            updating_to: self.updating_to_version()?,
        })
    }

    pub fn is_updating(&self) -> Result<bool> {
        Ok(self.version_pointers()?.is_updating())
    }

    /// Start rolling out domain group version `version`. Refused while a
    /// rollout to a different version is still in flight, or when a domain
    /// version the target references no longer exists.
    pub fn set_updating_to_version(&self, version: u32) -> Result<()> {
        let domain_group = self.domain_group()?;
        let Some(target) = domain_group.version(version)? else {
            return Err(crate::Error::NodeNotFound(format!(
                "{}/versions/{}",
                domain_group.name(),
                version
            )));
        };
        for (domain, domain_version) in &target.domain_versions {
            Domain::load(&self.store, domain)?.version(*domain_version)?;
        }

        // The marker is written conditionally on what was read, so two
        // concurrent callers cannot both start a rollout.
        let marker_path = self.child(UPDATING_TO_VERSION_PATH);
        let data = version.to_string();
        loop {
            let written = match self.store.get_data(&marker_path) {
                Ok((raw, stat)) => {
                    let in_flight = parse_marker(&marker_path, &raw)?;
                    let pointers = VersionPointers {
                        current: self.current_version()?,
                        updating_to: in_flight,
                    };
                    match in_flight {
                        Some(in_flight) if pointers.is_updating() && in_flight != version => {
                            return Err(crate::Error::RolloutInProgress {
                                ring_group: self.name.clone(),
                                version: in_flight,
                            });
                        }
                        _ => self
                            .store
                            .set_data(&marker_path, data.as_bytes(), Some(stat.version))
                            .map(|_| ()),
                    }
                }
                Err(crate::Error::NodeNotFound(_)) => {
                    match self.store.create(&marker_path, data.as_bytes(), CreateMode::Persistent) {
                        Err(crate::Error::NodeNotFound(_)) => {
                            return Err(crate::Error::RingGroupNotFound(self.name.clone()));
                        }
                        other => other.map(|_| ()),
                    }
                }
                Err(e) => return Err(e),
            };
            match written {
                Ok(()) => break,
                Err(
                    crate::Error::BadVersion { .. }
                    | crate::Error::NodeExists(_)
                    | crate::Error::NodeNotFound(_),
                ) => {
                    tracing::debug!("Ring group {} rollout marker changed, retrying", self.name);
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!("Ring group {} updating to version {}", self.name, version);
        Ok(())
    }

    /// Finish the rollout in flight. Safe to repeat: a missing marker, or a
    /// marker already equal to the current version, completes without error.
    pub fn update_complete(&self) -> Result<()> {
        let Some(target) = self.updating_to_version()? else {
            tracing::debug!("Ring group {} has no rollout to complete", self.name);
            return Ok(());
        };

        if self.current_version()? == Some(target) {
            tracing::warn!(
                "Ring group {} already serves version {}, clearing stale rollout marker",
                self.name,
                target
            );
        } else {
            self.store.set_or_create(
                &self.child(CURRENT_VERSION_PATH),
                target.to_string().as_bytes(),
            )?;
        }
        self.store.delete_if_exists(&self.child(UPDATING_TO_VERSION_PATH))?;
        tracing::info!("Ring group {} now serves version {}", self.name, target);
        Ok(())
    }

    // === Data deployer ===

    /// Claim the data deployer role for `session`; false if someone holds it
    pub fn claim_data_deployer(&self, session: &Session) -> Result<bool> {
        match self.store.create_ephemeral(
            session,
            &self.child(DATA_DEPLOYER_PATH),
            session.id().to_string().as_bytes(),
        ) {
            Ok(_) => Ok(true),
            Err(crate::Error::NodeExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Release the role if `session` holds it
    pub fn release_data_deployer(&self, session: &Session) -> Result<()> {
        let deployer_path = self.child(DATA_DEPLOYER_PATH);
        match self.store.exists(&deployer_path) {
            Some(stat) if stat.ephemeral_owner == Some(session.id()) => {
                self.store.delete_if_exists(&deployer_path)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn has_data_deployer(&self) -> bool {
        self.store.exists(&self.child(DATA_DEPLOYER_PATH)).is_some()
    }

    /// Fires on rollout pointer changes and on rings being added or removed
    pub fn subscribe(&self) -> Subscription<VersionPointers> {
        let group = self.clone();
        Subscription::new(
            vec![
                self.store.watch(&self.path),
                self.store.watch(&self.child(CURRENT_VERSION_PATH)),
                self.store.watch(&self.child(UPDATING_TO_VERSION_PATH)),
            ],
            move || group.version_pointers(),
        )
    }

    pub(crate) fn delete(&self) -> Result<()> {
        self.store.delete_recursive(&self.path)
    }
}

impl fmt::Debug for RingGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingGroup")
            .field("name", &self.name)
            .field("domain_group", &self.domain_group_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::DOMAIN_GROUPS_ROOT;
    use std::collections::BTreeMap;

    fn setup(with_version: bool) -> (CoordinationStore, RingGroup) {
        let store = CoordinationStore::in_memory();
        store.create_all(DOMAIN_GROUPS_ROOT).unwrap();
        store.create_all(RING_GROUPS_ROOT).unwrap();
        let dg = DomainGroup::create(&store, "dg").unwrap();
        if with_version {
            dg.create_version(BTreeMap::new()).unwrap();
            dg.create_version(BTreeMap::new()).unwrap();
        }
        let rg = RingGroup::create(&store, "rg", &dg).unwrap();
        (store, rg)
    }

    #[test]
    fn test_create_seeds_rollout() {
        let (store, rg) = setup(true);
        assert_eq!(rg.current_version().unwrap(), None);
        assert_eq!(rg.updating_to_version().unwrap(), Some(1));
        assert!(rg.is_updating().unwrap());

        let loaded = RingGroup::load(&store, "rg").unwrap();
        assert_eq!(loaded.domain_group_name(), "dg");
    }

    #[test]
    fn test_create_without_versions() {
        let (_store, rg) = setup(false);
        assert_eq!(rg.updating_to_version().unwrap(), None);
        assert!(!rg.is_updating().unwrap());
    }

    #[test]
    fn test_update_complete_twice() {
        let (_store, rg) = setup(true);
        rg.update_complete().unwrap();
        assert_eq!(rg.current_version().unwrap(), Some(1));
        assert_eq!(rg.updating_to_version().unwrap(), None);

        rg.update_complete().unwrap();
        assert_eq!(rg.current_version().unwrap(), Some(1));
        assert_eq!(rg.updating_to_version().unwrap(), None);
    }

    #[test]
    fn test_update_complete_after_partial_write() {
        let (store, rg) = setup(true);
        // Crash after the first write: current advanced, marker left behind
        store.set_or_create("/ring_groups/rg/current_version", b"1").unwrap();
        assert!(!rg.is_updating().unwrap());

        rg.update_complete().unwrap();
        assert_eq!(rg.current_version().unwrap(), Some(1));
        assert_eq!(rg.updating_to_version().unwrap(), None);
    }

    #[test]
    fn test_single_rollout_in_flight() {
        let (_store, rg) = setup(true);
        assert!(matches!(
            rg.set_updating_to_version(0),
            Err(crate::Error::RolloutInProgress { version: 1, .. })
        ));
        // Same target is accepted
        rg.set_updating_to_version(1).unwrap();
        rg.update_complete().unwrap();

        rg.set_updating_to_version(0).unwrap();
        assert!(rg.is_updating().unwrap());
        assert!(rg.set_updating_to_version(7).is_err());
    }

    #[test]
    fn test_rings() {
        let (_store, rg) = setup(false);
        rg.add_ring(2).unwrap();
        rg.add_ring(10).unwrap();
        let numbers: Vec<u32> = rg.rings().unwrap().iter().map(Ring::number).collect();
        assert_eq!(numbers, vec![2, 10]);

        let addr = PartitionServerAddress::new("h", 1);
        rg.ring(10).unwrap().add_host(&addr, &[]).unwrap();
        assert_eq!(rg.ring_for_host(&addr).unwrap().number(), 10);
        assert!(rg.ring_for_host(&PartitionServerAddress::new("x", 1)).is_err());

        assert!(matches!(rg.ring(3), Err(crate::Error::RingNotFound { ring: 3, .. })));
        assert!(rg.remove_ring(2).unwrap());
        assert!(!rg.remove_ring(2).unwrap());
    }

    #[test]
    fn test_data_deployer() {
        let (store, rg) = setup(false);
        let first = store.open_session();
        let second = store.open_session();

        assert!(rg.claim_data_deployer(&first).unwrap());
        assert!(!rg.claim_data_deployer(&second).unwrap());

        rg.release_data_deployer(&second).unwrap();
        assert!(rg.has_data_deployer());

        drop(first);
        assert!(!rg.has_data_deployer());
        assert!(rg.claim_data_deployer(&second).unwrap());
    }

    #[tokio::test]
    async fn test_subscribe_sees_rollout() {
        let (_store, rg) = setup(true);
        let mut sub = rg.subscribe();
        assert!(sub.current().unwrap().is_updating());

        rg.update_complete().unwrap();
        let pointers = sub.next().await.unwrap();
        assert_eq!(
            pointers,
            VersionPointers {
                current: Some(1),
                updating_to: None
            }
        );
    }
}
