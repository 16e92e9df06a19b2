//! Administrative operations on domains, rings and hosts

use ringkv::common::PartitionServerAddress;
use ringkv::coordinator::{
    remote_deleter, Coordinator, Domain, EqualSizePartitionAssigner, NoRemoteArtifacts,
    RemoteDomainVersionDeleter, UnsupportedEngine,
};
use ringkv::store::CoordinationStore;
use ringkv::Error;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

fn coordinator() -> Coordinator {
    Coordinator::new(CoordinationStore::in_memory()).unwrap()
}

fn flags(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Records which versions it was asked to delete
#[derive(Default)]
struct RecordingDeleter {
    deleted: Mutex<Vec<(String, u32)>>,
}

impl RemoteDomainVersionDeleter for RecordingDeleter {
    fn delete_version(&self, domain: &Domain, version: u32) -> ringkv::Result<()> {
        self.deleted
            .lock()
            .unwrap()
            .push((domain.name().to_string(), version));
        Ok(())
    }
}

#[test]
fn test_domain_ids_are_unique() {
    let coord = coordinator();
    let a = coord.add_domain("a", 1, "", "", "", &[]).unwrap();
    let b = coord.add_domain("b", 1, "", "", "", &[]).unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(coord.domain_by_id(b.id()).unwrap().unwrap().name(), "b");
    assert!(coord.domain_by_id(1000).unwrap().is_none());

    assert!(matches!(
        coord.add_domain("a", 1, "", "", "", &[]),
        Err(Error::NodeExists(_))
    ));
    assert!(matches!(
        coord.add_domain("c", 0, "", "", "", &[]),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_update_domain_keeps_id() {
    let coord = coordinator();
    let before = coord
        .add_domain("users", 4, "cueball", "", "murmur", &flags(&["ssd"]))
        .unwrap();
    let after = coord
        .update_domain("users", 8, "curly", "block_size: 4096", "murmur", &[])
        .unwrap();
    assert_eq!(after.id(), before.id());
    assert_eq!(after.num_partitions(), 8);
    assert_eq!(after.storage_engine_factory(), "curly");
    assert!(after.required_host_flags().is_empty());
}

#[test]
fn test_domain_in_use_cannot_be_deleted() {
    let coord = coordinator();
    let users = coord.add_domain("users", 4, "", "", "", &[]).unwrap();
    users.open_new_version().unwrap();
    coord.add_domain_group("dg").unwrap();
    coord
        .add_domain_group_version("dg", [("users".to_string(), 0)].into_iter().collect())
        .unwrap();
    coord.add_ring_group("rg", "dg").unwrap();

    assert!(coord.is_domain_in_use("users").unwrap());
    assert!(matches!(
        coord.delete_domain("users"),
        Err(Error::DomainInUse(_))
    ));

    assert!(coord.delete_ring_group("rg").unwrap());
    assert!(!coord.is_domain_in_use("users").unwrap());
    assert!(coord.delete_domain("users").unwrap());
    assert!(!coord.delete_domain("users").unwrap());
}

#[test]
fn test_served_version_cannot_be_deleted() {
    let coord = coordinator();
    let users = coord.add_domain("users", 4, "", "", "", &[]).unwrap();
    for _ in 0..3 {
        users.open_new_version().unwrap();
    }
    coord.add_domain_group("dg").unwrap();
    coord
        .add_domain_group_version("dg", [("users".to_string(), 1)].into_iter().collect())
        .unwrap();
    let rg = coord.add_ring_group("rg", "dg").unwrap();
    rg.update_complete().unwrap();

    let deleter = RecordingDeleter::default();
    match coord.delete_domain_version("users", 1, &deleter) {
        Err(Error::DomainVersionInUse { ring_group, .. }) => assert_eq!(ring_group, "rg"),
        other => panic!("expected DomainVersionInUse, got {:?}", other),
    }
    assert!(deleter.deleted.lock().unwrap().is_empty());

    coord.delete_domain_version("users", 0, &deleter).unwrap();
    assert_eq!(
        *deleter.deleted.lock().unwrap(),
        vec![("users".to_string(), 0)]
    );
    let remaining: Vec<u32> = users.versions().unwrap().iter().map(|v| v.number()).collect();
    assert_eq!(remaining, vec![1, 2]);
}

#[test]
fn test_delete_defunct_versions_skips_served() {
    let coord = coordinator();
    let users = coord.add_domain("users", 4, "", "", "", &[]).unwrap();
    for _ in 0..3 {
        users.open_new_version().unwrap();
    }
    coord.add_domain_group("dg").unwrap();
    coord
        .add_domain_group_version("dg", [("users".to_string(), 2)].into_iter().collect())
        .unwrap();
    coord.add_ring_group("rg", "dg").unwrap();

    for version in [0, 2] {
        coord.set_domain_version_defunct("users", version, true).unwrap();
    }
    let deleted = coord
        .delete_defunct_domain_versions("users", &NoRemoteArtifacts)
        .unwrap();
    assert_eq!(deleted, vec![0]);
    assert!(users.version(2).unwrap().is_defunct().unwrap());
    assert!(!users.version(1).unwrap().is_defunct().unwrap());
}

#[test]
fn test_clean_domains_covers_every_domain() {
    let coord = coordinator();
    for name in ["events", "users", "quiet"] {
        let domain = coord.add_domain(name, 2, "", "", "", &[]).unwrap();
        for _ in 0..3 {
            domain.open_new_version().unwrap();
        }
    }
    coord.add_domain_group("dg").unwrap();
    coord
        .add_domain_group_version("dg", [("users".to_string(), 1)].into_iter().collect())
        .unwrap();
    coord.add_ring_group("rg", "dg").unwrap();

    coord.set_domain_version_defunct("events", 0, true).unwrap();
    coord.set_domain_version_defunct("events", 2, true).unwrap();
    coord.set_domain_version_defunct("users", 0, true).unwrap();
    coord.set_domain_version_defunct("users", 1, true).unwrap();

    let deleter = RecordingDeleter::default();
    let cleaned = coord.clean_domains(&deleter).unwrap();
    let expected: BTreeMap<String, Vec<u32>> = [
        ("events".to_string(), vec![0, 2]),
        ("users".to_string(), vec![0]),
    ]
    .into_iter()
    .collect();
    assert_eq!(cleaned, expected);
    assert_eq!(deleter.deleted.lock().unwrap().len(), 3);

    // The referenced defunct version is kept
    assert!(coord.domain("users").unwrap().version(1).unwrap().is_defunct().unwrap());
    assert!(coord.clean_domains(&deleter).unwrap().is_empty());
}

#[test]
fn test_unsupported_engine_deletes_nothing() {
    let coord = coordinator();
    let users = coord.add_domain("users", 2, "", "", "", &[]).unwrap();
    users.open_new_version().unwrap();
    coord.set_domain_version_defunct("users", 0, true).unwrap();

    assert!(matches!(
        coord.delete_domain_version("users", 0, &UnsupportedEngine),
        Err(Error::NotImplemented(_))
    ));
    assert!(matches!(
        coord.cleanup_domain_version("users", 0, remote_deleter(false)),
        Err(Error::NotImplemented(_))
    ));
    assert!(matches!(
        coord.clean_domains(remote_deleter(false)),
        Err(Error::NotImplemented(_))
    ));
    assert_eq!(users.versions().unwrap().len(), 1);

    let cleaned = coord.clean_domains(remote_deleter(true)).unwrap();
    assert_eq!(cleaned.get("users"), Some(&vec![0]));
    assert!(users.versions().unwrap().is_empty());
}

#[test]
fn test_cleanup_marks_defunct() {
    let coord = coordinator();
    let users = coord.add_domain("users", 4, "", "", "", &[]).unwrap();
    users.open_new_version().unwrap();
    coord.close_domain_version("users", 0).unwrap();
    assert!(matches!(
        coord.close_domain_version("users", 0),
        Err(Error::DomainVersionClosed { .. })
    ));

    let deleter = RecordingDeleter::default();
    coord.cleanup_domain_version("users", 0, &deleter).unwrap();
    assert!(users.version(0).unwrap().is_defunct().unwrap());
    assert_eq!(deleter.deleted.lock().unwrap().len(), 1);
}

#[test]
fn test_redistribute_respects_required_flags() {
    let coord = coordinator();
    let users = coord
        .add_domain("users", 6, "", "", "", &flags(&["ssd"]))
        .unwrap();
    users.open_new_version().unwrap();
    coord.add_domain_group("dg").unwrap();
    coord
        .add_domain_group_version("dg", [("users".to_string(), 0)].into_iter().collect())
        .unwrap();
    let rg = coord.add_ring_group("rg", "dg").unwrap();
    rg.add_ring(0).unwrap();

    let fast_a = coord
        .add_host("rg", 0, &PartitionServerAddress::new("a", 1), &flags(&["ssd"]))
        .unwrap();
    let fast_b = coord
        .add_host("rg", 0, &PartitionServerAddress::new("b", 1), &flags(&["ssd", "big"]))
        .unwrap();
    let slow = coord
        .add_host("rg", 0, &PartitionServerAddress::new("c", 1), &[])
        .unwrap();

    coord
        .redistribute_partitions("rg", 0, &EqualSizePartitionAssigner)
        .unwrap();

    let id = users.id();
    assert_eq!(fast_a.partitions(id).unwrap(), BTreeSet::from([0, 2, 4]));
    assert_eq!(fast_b.partitions(id).unwrap(), BTreeSet::from([1, 3, 5]));
    assert!(slow.partitions(id).unwrap().is_empty());

    // Every partition lands on exactly one host of the ring
    let mut owners: BTreeMap<u32, usize> = BTreeMap::new();
    for host in rg.ring(0).unwrap().hosts().unwrap() {
        for p in host.partitions(id).unwrap() {
            *owners.entry(p).or_default() += 1;
        }
    }
    assert_eq!(owners.len(), 6);
    assert!(owners.values().all(|&n| n == 1));
}

#[test]
fn test_redistribute_without_eligible_hosts() {
    let coord = coordinator();
    let users = coord
        .add_domain("users", 2, "", "", "", &flags(&["gpu"]))
        .unwrap();
    users.open_new_version().unwrap();
    coord.add_domain_group("dg").unwrap();
    coord
        .add_domain_group_version("dg", [("users".to_string(), 0)].into_iter().collect())
        .unwrap();
    let rg = coord.add_ring_group("rg", "dg").unwrap();
    rg.add_ring(0).unwrap();
    coord
        .add_host("rg", 0, &PartitionServerAddress::new("a", 1), &[])
        .unwrap();

    assert!(matches!(
        coord.redistribute_partitions("rg", 0, &EqualSizePartitionAssigner),
        Err(Error::NoEligibleHosts(_))
    ));
}

#[test]
fn test_ring_membership() {
    let coord = coordinator();
    coord.add_domain_group("dg").unwrap();
    let rg = coord.add_ring_group("rg", "dg").unwrap();
    rg.add_ring(0).unwrap();
    rg.add_ring(1).unwrap();

    let addr = PartitionServerAddress::new("h", 7);
    coord.add_host("rg", 1, &addr, &[]).unwrap();
    assert_eq!(rg.ring_for_host(&addr).unwrap().number(), 1);

    assert!(coord.remove_host("rg", 1, &addr).unwrap());
    assert!(!coord.remove_host("rg", 1, &addr).unwrap());
    assert!(matches!(rg.ring_for_host(&addr), Err(Error::HostNotFound(_))));

    assert!(rg.remove_ring(0).unwrap());
    let numbers: Vec<u32> = rg.rings().unwrap().iter().map(|r| r.number()).collect();
    assert_eq!(numbers, vec![1]);
    assert!(matches!(rg.ring(0), Err(Error::RingNotFound { .. })));
}
