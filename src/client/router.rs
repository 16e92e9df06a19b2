//! Key routing across the partitions of a ring group
//!
//! One [`HostConnectionPool`] per (domain, partition), holding the
//! connections of every host assigned that partition in any ring. Pools are
//! seeded with [`host_shuffle_seed`] so every client agrees on the fallback
//! order for a partition.

use crate::client::connection::HostConnection;
use crate::client::load::ConnectionLoad;
use crate::client::pool::HostConnectionPool;
use crate::client::response::{GetResponse, QueryError};
use crate::common::{
    affinity_hash, host_shuffle_seed, key_to_hex, partition_for_key, ClientConfig,
    PartitionServerAddress, Result,
};
use crate::coordinator::{Domain, Host, RingGroup};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

struct DomainRoute<C> {
    domain: Domain,
    pools: HashMap<u32, HostConnectionPool<C>>,
}

pub struct PartitionRouter<C> {
    routes: HashMap<u32, DomainRoute<C>>,
    config: ClientConfig,
}

impl<C: HostConnection> PartitionRouter<C> {
    /// Build pools for `domains` from the partition assignments of every host
    /// in `ring_group`. `connect` opens the connections to one host and is
    /// called once per host.
    pub fn build<F>(
        ring_group: &RingGroup,
        domains: &[Domain],
        config: &ClientConfig,
        mut connect: F,
    ) -> Result<Self>
    where
        F: FnMut(&Host) -> Result<Vec<Arc<C>>>,
    {
        type HostMap<T> = HashMap<PartitionServerAddress, Vec<Arc<T>>>;
        let mut assignments: BTreeMap<(u32, u32), HostMap<C>> = BTreeMap::new();

        for ring in ring_group.rings()? {
            for host in ring.hosts()? {
                let partitions = host.assigned_partitions()?;
                let wanted = domains
                    .iter()
                    .any(|d| partitions.get(&d.id()).is_some_and(|p| !p.is_empty()));
                if !wanted {
                    continue;
                }
                let connections = connect(&host)?;
                for domain in domains {
                    for partition in partitions.get(&domain.id()).into_iter().flatten() {
                        assignments
                            .entry((domain.id(), *partition))
                            .or_default()
                            .entry(host.address().clone())
                            .or_default()
                            .extend(connections.iter().cloned());
                    }
                }
            }
        }

        let mut routes: HashMap<u32, DomainRoute<C>> = domains
            .iter()
            .map(|domain| {
                (
                    domain.id(),
                    DomainRoute {
                        domain: domain.clone(),
                        pools: HashMap::new(),
                    },
                )
            })
            .collect();

        for ((domain_id, partition), hosts) in assignments {
            let pool = HostConnectionPool::new(hosts, Some(host_shuffle_seed(domain_id, partition)))?;
            if let Some(route) = routes.get_mut(&domain_id) {
                route.pools.insert(partition, pool);
            }
        }

        for route in routes.values() {
            let missing = (route.domain.num_partitions() as usize).saturating_sub(route.pools.len());
            if missing > 0 {
                tracing::warn!(
                    "Domain {} has {} partitions without hosts in ring group {}",
                    route.domain.name(),
                    missing,
                    ring_group.name()
                );
            }
        }

        Ok(Self {
            routes,
            config: config.clone(),
        })
    }

    pub fn pool(&self, domain_id: u32, partition: u32) -> Option<&HostConnectionPool<C>> {
        self.routes.get(&domain_id)?.pools.get(&partition)
    }

    pub fn domain(&self, domain_id: u32) -> Option<&Domain> {
        self.routes.get(&domain_id).map(|route| &route.domain)
    }

    fn route_key(&self, domain_id: u32, key: &[u8]) -> Option<(&Domain, &HostConnectionPool<C>)> {
        let route = self.routes.get(&domain_id)?;
        let partition = partition_for_key(key, route.domain.num_partitions());
        let pool = route.pools.get(&partition)?;
        Some((&route.domain, pool))
    }

    pub async fn get(&self, domain_id: u32, key: &[u8]) -> std::result::Result<GetResponse, QueryError> {
        let Some((domain, pool)) = self.route_key(domain_id, key) else {
            tracing::error!(
                "No host serves domain {} for key {}",
                domain_id,
                key_to_hex(key)
            );
            return Err(QueryError::NoConnectionAvailable);
        };
        let key_hash = self.config.use_key_hash.then(|| affinity_hash(key));
        pool.get(domain, key, self.config.max_tries, key_hash).await
    }

    /// Look up many keys, one bulk request per partition. Results are in
    /// key order.
    pub async fn get_bulk(
        &self,
        domain_id: u32,
        keys: &[Bytes],
    ) -> Vec<std::result::Result<GetResponse, QueryError>> {
        let mut results: Vec<std::result::Result<GetResponse, QueryError>> =
            vec![Err(QueryError::NoConnectionAvailable); keys.len()];
        let Some(route) = self.routes.get(&domain_id) else {
            tracing::error!("Unknown domain {} for bulk query of {} keys", domain_id, keys.len());
            return results;
        };

        let mut by_partition: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
        for (position, key) in keys.iter().enumerate() {
            by_partition
                .entry(partition_for_key(key, route.domain.num_partitions()))
                .or_default()
                .push(position);
        }

        for (partition, positions) in by_partition {
            let Some(pool) = route.pools.get(&partition) else {
                tracing::error!(
                    "No host serves partition {} of domain {}",
                    partition,
                    route.domain.name()
                );
                continue;
            };
            let partition_keys: Vec<Bytes> = positions.iter().map(|&i| keys[i].clone()).collect();
            match pool.get_bulk(domain_id, &partition_keys, self.config.max_tries).await {
                Ok(response) => {
                    let mut answers = response.responses.into_iter();
                    for &position in &positions {
                        results[position] = Ok(answers.next().unwrap_or_else(|| {
                            GetResponse::Rejected("missing response in bulk reply".into())
                        }));
                    }
                }
                Err(e) => {
                    for &position in &positions {
                        results[position] = Err(e);
                    }
                }
            }
        }
        results
    }

    /// Load over every distinct connection in the router
    pub fn connection_load(&self) -> ConnectionLoad {
        let mut seen: HashSet<*const C> = HashSet::new();
        let mut load = ConnectionLoad::default();
        for route in self.routes.values() {
            for pool in route.pools.values() {
                for connection in pool.connections() {
                    if !seen.insert(Arc::as_ptr(connection)) {
                        continue;
                    }
                    load.num_connections += 1;
                    if connection.is_locked() {
                        load.num_locked_connections += 1;
                    }
                }
            }
        }
        load
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::connection::{PartitionServerConnection, Transport};
    use crate::client::response::BulkResponse;
    use crate::coordinator::{Coordinator, EqualSizePartitionAssigner, HostState};
    use crate::store::CoordinationStore;
    use std::io;

    struct NamedTransport(String);

    impl Transport for NamedTransport {
        async fn get(&self, _domain_id: u32, _key: &[u8]) -> io::Result<GetResponse> {
            Ok(GetResponse::Found(Bytes::from(self.0.clone())))
        }

        async fn get_bulk(&self, _domain_id: u32, keys: &[Bytes]) -> io::Result<BulkResponse> {
            Ok(BulkResponse::new(
                keys.iter().map(|_| GetResponse::Found(Bytes::from(self.0.clone()))).collect(),
            ))
        }
    }

    type Conn = PartitionServerConnection<NamedTransport>;

    fn build() -> (Coordinator, Domain, PartitionRouter<Conn>) {
        let coord = Coordinator::new(CoordinationStore::in_memory()).unwrap();
        let domain = coord.add_domain("d", 4, "", "", "", &[]).unwrap();
        domain.open_new_version().unwrap();
        coord.add_domain_group("dg").unwrap();
        coord
            .add_domain_group_version("dg", [("d".to_string(), 0)].into_iter().collect())
            .unwrap();
        let rg = coord.add_ring_group("rg", "dg").unwrap();
        rg.add_ring(0).unwrap();
        for name in ["a", "b"] {
            coord
                .add_host("rg", 0, &PartitionServerAddress::new(name, 1), &[])
                .unwrap();
        }
        coord
            .redistribute_partitions("rg", 0, &EqualSizePartitionAssigner)
            .unwrap();

        let router = PartitionRouter::build(&rg, &[domain.clone()], &ClientConfig::default(), |host| {
            Ok(vec![Arc::new(PartitionServerConnection::new(
                host.address().clone(),
                HostState::Serving,
                NamedTransport(host.address().hostname.clone()),
            ))])
        })
        .unwrap();
        (coord, domain, router)
    }

    #[tokio::test]
    async fn test_routes_to_assigned_host() {
        let (_coord, domain, router) = build();
        for i in 0..20 {
            let key = format!("key-{}", i);
            let partition = partition_for_key(key.as_bytes(), 4);
            // Partitions alternate between the two hosts in address order
            let expected = if partition % 2 == 0 { "a" } else { "b" };
            let response = router.get(domain.id(), key.as_bytes()).await.unwrap();
            assert_eq!(response, GetResponse::Found(Bytes::from(expected)));
        }
    }

    #[tokio::test]
    async fn test_bulk_keeps_key_order() {
        let (_coord, domain, router) = build();
        let keys: Vec<Bytes> = (0..10).map(|i| Bytes::from(format!("k{}", i))).collect();
        let results = router.get_bulk(domain.id(), &keys).await;
        assert_eq!(results.len(), 10);
        for (key, result) in keys.iter().zip(&results) {
            let expected = if partition_for_key(key, 4) % 2 == 0 { "a" } else { "b" };
            assert_eq!(result, &Ok(GetResponse::Found(Bytes::from(expected))));
        }
    }

    #[tokio::test]
    async fn test_unknown_domain() {
        let (_coord, _domain, router) = build();
        assert_eq!(router.get(99, b"k").await, Err(QueryError::NoConnectionAvailable));
        let results = router.get_bulk(99, &[Bytes::from_static(b"k")]).await;
        assert_eq!(results, vec![Err(QueryError::NoConnectionAvailable)]);
    }

    #[test]
    fn test_pools_and_load() {
        let (_coord, domain, router) = build();
        for partition in 0..4 {
            assert_eq!(router.pool(domain.id(), partition).unwrap().num_hosts(), 1);
        }
        assert!(router.pool(domain.id(), 4).is_none());
        // One connection per host, shared by that host's two partitions
        assert_eq!(router.connection_load(), ConnectionLoad::new(2, 0));
    }
}
