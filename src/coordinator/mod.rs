//! Cluster metadata model
//!
//! Typed views over the coordination store:
//! - Domains and their versions
//! - Domain groups: versioned bundles of domains
//! - Ring groups, rings and hosts, with the rollout protocol and the host
//!   command queue
//! - The administrative surface ([`Coordinator`])

pub mod cluster;
pub mod domain;
pub mod domain_group;
pub mod host;
pub mod partition_assigner;
pub mod ring;
pub mod ring_group;
pub mod watched;

pub use cluster::Coordinator;
pub use domain::{
    remote_deleter, Domain, DomainMetadata, DomainVersion, DomainVersionMetadata,
    NoRemoteArtifacts, RemoteDomainVersionDeleter, UnsupportedEngine,
};
pub use domain_group::{DomainGroup, DomainGroupVersion};
pub use host::{Host, HostCommand, HostMetadata, HostState, StatisticsMetadata};
pub use partition_assigner::{EqualSizePartitionAssigner, PartitionAssigner};
pub use ring::Ring;
pub use ring_group::{RingGroup, VersionPointers};
pub use watched::WatchedNode;

pub const DOMAINS_ROOT: &str = "/domains";
pub const DOMAIN_GROUPS_ROOT: &str = "/domain_groups";
pub const RING_GROUPS_ROOT: &str = "/ring_groups";
