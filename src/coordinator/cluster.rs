//! Administrative entry point over the cluster metadata

use crate::common::{decode_segment, Config, PartitionServerAddress, Result};
use crate::coordinator::domain::{Domain, DomainMetadata, RemoteDomainVersionDeleter};
use crate::coordinator::domain_group::{DomainGroup, DomainGroupVersion};
use crate::coordinator::host::{Host, HostCommand};
use crate::coordinator::partition_assigner::PartitionAssigner;
use crate::coordinator::ring_group::RingGroup;
use crate::coordinator::{DOMAINS_ROOT, DOMAIN_GROUPS_ROOT, RING_GROUPS_ROOT};
use crate::store::CoordinationStore;
use std::collections::BTreeMap;

/// Coordinator: reads and mutates domains, domain groups, ring groups and
/// hosts stored in a [`CoordinationStore`].
#[derive(Clone)]
pub struct Coordinator {
    store: CoordinationStore,
}

impl Coordinator {
    pub fn new(store: CoordinationStore) -> Result<Self> {
        for root in [DOMAINS_ROOT, DOMAIN_GROUPS_ROOT, RING_GROUPS_ROOT] {
            store.create_all(root)?;
        }
        Ok(Self { store })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(CoordinationStore::from_config(&config.store)?)
    }

    pub fn store(&self) -> &CoordinationStore {
        &self.store
    }

    fn child_names(&self, root: &str) -> Result<Vec<String>> {
        self.store
            .children(root)?
            .iter()
            .map(|encoded| decode_segment(encoded))
            .collect()
    }

    // === Domains ===

    /// Hand out the next domain id. The counter lives in the data of the
    /// domains root and is advanced with compare-and-set.
    fn allocate_domain_id(&self) -> Result<u32> {
        loop {
            let (data, stat) = self.store.get_data(DOMAINS_ROOT)?;
            let next: u32 = if data.is_empty() {
                0
            } else {
                std::str::from_utf8(&data)
                    .ok()
                    .and_then(|s| s.trim().parse().ok())
                    .ok_or_else(|| {
                        crate::Error::MetadataCorrupted("domain id counter is not an integer".into())
                    })?
            };
            match self.store.set_data(
                DOMAINS_ROOT,
                (next + 1).to_string().as_bytes(),
                Some(stat.version),
            ) {
                Ok(_) => return Ok(next),
                Err(crate::Error::BadVersion { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn add_domain(
        &self,
        name: &str,
        num_partitions: u32,
        storage_engine_factory: &str,
        storage_engine_options: &str,
        partitioner: &str,
        required_host_flags: &[String],
    ) -> Result<Domain> {
        if num_partitions == 0 {
            return Err(crate::Error::InvalidConfig(format!(
                "domain {} needs at least one partition",
                name
            )));
        }
        if self.store.exists(&crate::coordinator::domain::domain_path(name)).is_some() {
            return Err(crate::Error::NodeExists(name.to_string()));
        }
        let metadata = DomainMetadata {
            id: self.allocate_domain_id()?,
            num_partitions,
            storage_engine_factory: storage_engine_factory.to_string(),
            storage_engine_options: storage_engine_options.to_string(),
            partitioner: partitioner.to_string(),
            required_host_flags: crate::common::split_flags(&crate::common::join_flags(
                required_host_flags,
            )),
        };
        let domain = Domain::create(&self.store, name, metadata)?;
        tracing::info!("Added domain {} with id {}", name, domain.id());
        Ok(domain)
    }

    /// Replace a domain's definition; the id is kept
    pub fn update_domain(
        &self,
        name: &str,
        num_partitions: u32,
        storage_engine_factory: &str,
        storage_engine_options: &str,
        partitioner: &str,
        required_host_flags: &[String],
    ) -> Result<Domain> {
        let domain = self.domain(name)?;
        let flags = crate::common::split_flags(&crate::common::join_flags(required_host_flags));
        let updated = domain.update_metadata(|m| {
            m.num_partitions = num_partitions;
            m.storage_engine_factory = storage_engine_factory.to_string();
            m.storage_engine_options = storage_engine_options.to_string();
            m.partitioner = partitioner.to_string();
            m.required_host_flags = flags.clone();
        })?;
        tracing::info!("Updated domain {}", name);
        Ok(updated)
    }

    /// Delete a domain no ring group uses. Returns whether it existed.
    pub fn delete_domain(&self, name: &str) -> Result<bool> {
        let domain = match self.domain(name) {
            Ok(domain) => domain,
            Err(crate::Error::DomainNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if self.is_domain_in_use(name)? {
            return Err(crate::Error::DomainInUse(name.to_string()));
        }
        domain.delete()?;
        tracing::info!("Deleted domain {}", name);
        Ok(true)
    }

    pub fn domain(&self, name: &str) -> Result<Domain> {
        Domain::load(&self.store, name)
    }

    pub fn domain_by_id(&self, id: u32) -> Result<Option<Domain>> {
        Ok(self.domains()?.into_iter().find(|d| d.id() == id))
    }

    /// All domains ordered by name
    pub fn domains(&self) -> Result<Vec<Domain>> {
        let mut domains = Vec::new();
        for name in self.child_names(DOMAINS_ROOT)? {
            match Domain::load(&self.store, &name) {
                Ok(domain) => domains.push(domain),
                Err(crate::Error::DomainNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        domains.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(domains)
    }

    /// Whether any version of any ring group's domain group includes the domain
    pub fn is_domain_in_use(&self, name: &str) -> Result<bool> {
        for ring_group in self.ring_groups()? {
            if ring_group.domain_group()?.all_domains()?.contains(name) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // === Domain versions ===

    pub fn set_domain_version_defunct(&self, domain: &str, version: u32, defunct: bool) -> Result<()> {
        self.domain(domain)?.version(version)?.set_defunct(defunct)
    }

    pub fn close_domain_version(&self, domain: &str, version: u32) -> Result<()> {
        self.domain(domain)?.version(version)?.close()
    }

    /// Ring group whose domain group references this domain version in any
    /// of its versions, if any
    fn ring_group_referencing(&self, domain: &str, version: u32) -> Result<Option<String>> {
        for ring_group in self.ring_groups()? {
            let references = ring_group
                .domain_group()?
                .versions()?
                .iter()
                .any(|v| v.domain_version(domain) == Some(version));
            if references {
                return Ok(Some(ring_group.name().to_string()));
            }
        }
        Ok(None)
    }

    /// Delete a domain version once no ring group's domain group references
    /// it and the storage engine reclaimed its remote artifacts
    pub fn delete_domain_version(
        &self,
        domain: &str,
        version: u32,
        deleter: &dyn RemoteDomainVersionDeleter,
    ) -> Result<()> {
        let domain = self.domain(domain)?;
        let domain_version = domain.version(version)?;
        if let Some(ring_group) = self.ring_group_referencing(domain.name(), version)? {
            return Err(crate::Error::DomainVersionInUse {
                domain: domain.name().to_string(),
                version,
                ring_group,
            });
        }
        deleter.delete_version(&domain, version)?;
        domain_version.delete()?;
        tracing::info!("Deleted version {} of domain {}", version, domain.name());
        Ok(())
    }

    /// Reclaim remote artifacts of a version and mark it defunct, keeping
    /// its metadata
    pub fn cleanup_domain_version(
        &self,
        domain: &str,
        version: u32,
        deleter: &dyn RemoteDomainVersionDeleter,
    ) -> Result<()> {
        let domain = self.domain(domain)?;
        let domain_version = domain.version(version)?;
        deleter.delete_version(&domain, version)?;
        domain_version.set_defunct(true)
    }

    /// Delete every defunct version of a domain that no ring group references.
    /// Returns the deleted version numbers.
    pub fn delete_defunct_domain_versions(
        &self,
        domain: &str,
        deleter: &dyn RemoteDomainVersionDeleter,
    ) -> Result<Vec<u32>> {
        let mut deleted = Vec::new();
        for version in self.domain(domain)?.versions()? {
            if !version.is_defunct()? {
                continue;
            }
            match self.delete_domain_version(domain, version.number(), deleter) {
                Ok(()) => deleted.push(version.number()),
                Err(crate::Error::DomainVersionInUse { ring_group, .. }) => {
                    tracing::warn!(
                        "Keeping defunct version {} of {}: still referenced by {}",
                        version.number(),
                        domain,
                        ring_group
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Delete defunct unreferenced versions across every domain. Returns the
    /// deleted version numbers per domain, leaving out domains with none.
    pub fn clean_domains(
        &self,
        deleter: &dyn RemoteDomainVersionDeleter,
    ) -> Result<BTreeMap<String, Vec<u32>>> {
        let mut cleaned = BTreeMap::new();
        for domain in self.domains()? {
            let deleted = self.delete_defunct_domain_versions(domain.name(), deleter)?;
            if !deleted.is_empty() {
                tracing::info!("Cleaned versions {:?} of domain {}", deleted, domain.name());
                cleaned.insert(domain.name().to_string(), deleted);
            }
        }
        Ok(cleaned)
    }

    // === Domain groups ===

    pub fn add_domain_group(&self, name: &str) -> Result<DomainGroup> {
        let group = DomainGroup::create(&self.store, name)?;
        tracing::info!("Added domain group {}", name);
        Ok(group)
    }

    pub fn domain_group(&self, name: &str) -> Result<DomainGroup> {
        DomainGroup::load(&self.store, name)
    }

    pub fn domain_groups(&self) -> Result<Vec<DomainGroup>> {
        self.child_names(DOMAIN_GROUPS_ROOT)?
            .iter()
            .map(|name| DomainGroup::load(&self.store, name))
            .collect()
    }

    /// Add a domain group version after checking that every referenced
    /// domain version exists
    pub fn add_domain_group_version(
        &self,
        name: &str,
        domain_versions: BTreeMap<String, u32>,
    ) -> Result<DomainGroupVersion> {
        let group = self.domain_group(name)?;
        for (domain, version) in &domain_versions {
            self.domain(domain)?.version(*version)?;
        }
        group.create_version(domain_versions)
    }

    // === Ring groups ===

    pub fn add_ring_group(&self, name: &str, domain_group: &str) -> Result<RingGroup> {
        let domain_group = self.domain_group(domain_group)?;
        let ring_group = RingGroup::create(&self.store, name, &domain_group)?;
        tracing::info!(
            "Added ring group {} serving {}",
            name,
            domain_group.name()
        );
        Ok(ring_group)
    }

    pub fn ring_group(&self, name: &str) -> Result<RingGroup> {
        RingGroup::load(&self.store, name)
    }

    pub fn ring_groups(&self) -> Result<Vec<RingGroup>> {
        self.child_names(RING_GROUPS_ROOT)?
            .iter()
            .map(|name| RingGroup::load(&self.store, name))
            .collect()
    }

    pub fn delete_ring_group(&self, name: &str) -> Result<bool> {
        match self.ring_group(name) {
            Ok(ring_group) => {
                ring_group.delete()?;
                tracing::info!("Deleted ring group {}", name);
                Ok(true)
            }
            Err(crate::Error::RingGroupNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // === Hosts ===

    pub fn add_host(
        &self,
        ring_group: &str,
        ring: u32,
        address: &PartitionServerAddress,
        flags: &[String],
    ) -> Result<Host> {
        self.ring_group(ring_group)?.ring(ring)?.add_host(address, flags)
    }

    pub fn remove_host(&self, ring_group: &str, ring: u32, address: &PartitionServerAddress) -> Result<bool> {
        self.ring_group(ring_group)?.ring(ring)?.remove_host(address)
    }

    pub fn command_all(&self, ring_group: &str, ring: u32, command: HostCommand) -> Result<usize> {
        self.ring_group(ring_group)?.ring(ring)?.command_all(command)
    }

    /// Reassign the partitions of every domain the ring group serves over the
    /// hosts of one ring
    pub fn redistribute_partitions(
        &self,
        ring_group: &str,
        ring: u32,
        assigner: &dyn PartitionAssigner,
    ) -> Result<()> {
        let ring_group = self.ring_group(ring_group)?;
        let ring = ring_group.ring(ring)?;
        for name in ring_group.domain_group()?.domains()? {
            let domain = self.domain(&name)?;
            assigner.assign(&ring, &domain)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::domain::NoRemoteArtifacts;

    fn coordinator() -> Coordinator {
        Coordinator::new(CoordinationStore::in_memory()).unwrap()
    }

    fn add(coord: &Coordinator, name: &str) -> Domain {
        coord
            .add_domain(name, 4, "cueball", "", "murmur", &[])
            .unwrap()
    }

    #[test]
    fn test_domain_ids_are_unique() {
        let coord = coordinator();
        let a = add(&coord, "a");
        let b = add(&coord, "b");
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);
        assert_eq!(coord.domain_by_id(1).unwrap().unwrap().name(), "b");
        assert!(coord.domain_by_id(9).unwrap().is_none());
        assert!(coord.add_domain("a", 4, "", "", "", &[]).is_err());
        assert!(coord.add_domain("z", 0, "", "", "", &[]).is_err());
    }

    #[test]
    fn test_update_domain_keeps_id() {
        let coord = coordinator();
        let a = add(&coord, "a");
        let updated = coord
            .update_domain("a", 8, "cueball", "opts", "other", &["ssd".into()])
            .unwrap();
        assert_eq!(updated.id(), a.id());
        assert_eq!(updated.num_partitions(), 8);
        assert_eq!(
            coord.domain("a").unwrap().required_host_flags().to_vec(),
            vec!["ssd".to_string()]
        );
    }

    #[test]
    fn test_delete_unused_domain() {
        let coord = coordinator();
        add(&coord, "a");
        assert!(coord.delete_domain("a").unwrap());
        assert!(!coord.delete_domain("a").unwrap());
        assert!(coord.domains().unwrap().is_empty());
    }

    #[test]
    fn test_domain_group_version_validated() {
        let coord = coordinator();
        let a = add(&coord, "a");
        a.open_new_version().unwrap();
        coord.add_domain_group("dg").unwrap();

        let mut versions = BTreeMap::new();
        versions.insert("a".to_string(), 1);
        assert!(matches!(
            coord.add_domain_group_version("dg", versions.clone()),
            Err(crate::Error::DomainVersionNotFound { .. })
        ));
        versions.insert("a".to_string(), 0);
        assert_eq!(coord.add_domain_group_version("dg", versions).unwrap().number, 0);
    }

    #[test]
    fn test_delete_defunct_versions() {
        let coord = coordinator();
        let a = add(&coord, "a");
        for _ in 0..3 {
            a.open_new_version().unwrap();
        }
        coord.set_domain_version_defunct("a", 0, true).unwrap();
        coord.set_domain_version_defunct("a", 2, true).unwrap();

        let deleted = coord
            .delete_defunct_domain_versions("a", &NoRemoteArtifacts)
            .unwrap();
        assert_eq!(deleted, vec![0, 2]);
        let left: Vec<u32> = a.versions().unwrap().iter().map(|v| v.number()).collect();
        assert_eq!(left, vec![1]);
    }
}
