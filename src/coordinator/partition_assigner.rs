//! Partition placement strategies

use crate::common::Result;
use crate::coordinator::domain::Domain;
use crate::coordinator::host::Host;
use crate::coordinator::ring::Ring;
use std::collections::BTreeSet;

/// Decides which hosts of a ring serve which partitions of a domain
pub trait PartitionAssigner: Send + Sync {
    fn assign(&self, ring: &Ring, domain: &Domain) -> Result<()>;
}

/// Spreads partitions round-robin over the eligible hosts so every host
/// serves the same number of partitions, give or take one.
#[derive(Debug, Clone, Copy, Default)]
pub struct EqualSizePartitionAssigner;

impl EqualSizePartitionAssigner {
    fn eligible_hosts(ring: &Ring, domain: &Domain) -> Result<(Vec<Host>, Vec<Host>)> {
        let mut eligible = Vec::new();
        let mut ineligible = Vec::new();
        for host in ring.hosts()? {
            if host.has_flags(domain.required_host_flags())? {
                eligible.push(host);
            } else {
                ineligible.push(host);
            }
        }
        Ok((eligible, ineligible))
    }
}

impl PartitionAssigner for EqualSizePartitionAssigner {
    fn assign(&self, ring: &Ring, domain: &Domain) -> Result<()> {
        let (eligible, ineligible) = Self::eligible_hosts(ring, domain)?;
        if eligible.is_empty() {
            return Err(crate::Error::NoEligibleHosts(domain.name().to_string()));
        }

        let mut assignments = vec![BTreeSet::new(); eligible.len()];
        for partition in 0..domain.num_partitions() {
            assignments[partition as usize % eligible.len()].insert(partition);
        }
        for (host, partitions) in eligible.iter().zip(assignments) {
            host.set_partitions(domain.id(), partitions)?;
        }
        for host in &ineligible {
            host.set_partitions(domain.id(), BTreeSet::new())?;
        }

        tracing::info!(
            "Assigned {} partitions of {} over {} hosts in ring {} of {}",
            domain.num_partitions(),
            domain.name(),
            eligible.len(),
            ring.number(),
            ring.ring_group_name()
        );
        Ok(())
    }
}
