//! Query routing over replicated rings, with hosts changing state underneath

use bytes::Bytes;
use ringkv::client::{
    BulkResponse, GetResponse, HostConnection, PartitionRouter, PartitionServerConnection,
    QueryError, Transport,
};
use ringkv::common::{partition_for_key, ClientConfig, PartitionServerAddress};
use ringkv::coordinator::{Coordinator, EqualSizePartitionAssigner, HostState};
use ringkv::store::{CoordinationStore, Session};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NUM_PARTITIONS: u32 = 4;

struct FlakyTransport {
    name: String,
    fail: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl Transport for FlakyTransport {
    async fn get(&self, _domain_id: u32, _key: &[u8]) -> io::Result<GetResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        Ok(GetResponse::Found(Bytes::from(self.name.clone())))
    }

    async fn get_bulk(&self, _domain_id: u32, keys: &[Bytes]) -> io::Result<BulkResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        Ok(BulkResponse::new(
            keys.iter()
                .map(|_| GetResponse::Found(Bytes::from(self.name.clone())))
                .collect(),
        ))
    }
}

type Conn = PartitionServerConnection<FlakyTransport>;

struct Cluster {
    coord: Coordinator,
    session: Session,
    domain_id: u32,
    router: PartitionRouter<Conn>,
    fail: HashMap<String, Arc<AtomicBool>>,
    calls: HashMap<String, Arc<AtomicUsize>>,
}

impl Cluster {
    /// Two rings: a and b in ring 0, c and d in ring 1. Every partition has
    /// one replica per ring.
    async fn start(config: ClientConfig) -> Self {
        let coord = Coordinator::new(CoordinationStore::in_memory()).unwrap();
        let domain = coord
            .add_domain("users", NUM_PARTITIONS, "", "", "", &[])
            .unwrap();
        domain.open_new_version().unwrap();
        coord.add_domain_group("dg").unwrap();
        coord
            .add_domain_group_version("dg", [("users".to_string(), 0)].into_iter().collect())
            .unwrap();
        let rg = coord.add_ring_group("rg", "dg").unwrap();

        let session = coord.store().open_session();
        for (ring, names) in [(0, ["a", "b"]), (1, ["c", "d"])] {
            rg.add_ring(ring).unwrap();
            for name in names {
                let host = coord
                    .add_host("rg", ring, &PartitionServerAddress::new(name, 1), &[])
                    .unwrap();
                host.set_state(&session, HostState::Serving).unwrap();
            }
            coord
                .redistribute_partitions("rg", ring, &EqualSizePartitionAssigner)
                .unwrap();
        }

        let mut fail: HashMap<String, Arc<AtomicBool>> = HashMap::new();
        let mut calls: HashMap<String, Arc<AtomicUsize>> = HashMap::new();
        let router = PartitionRouter::build(&rg, &[domain.clone()], &config, |host| {
            let name = host.address().hostname.clone();
            let transport = FlakyTransport {
                name: name.clone(),
                fail: fail.entry(name.clone()).or_default().clone(),
                calls: calls.entry(name).or_default().clone(),
            };
            Ok(vec![Arc::new(PartitionServerConnection::follow(host, transport)?)])
        })
        .unwrap();

        Self {
            coord,
            session,
            domain_id: domain.id(),
            router,
            fail,
            calls,
        }
    }

    fn set_state(&self, name: &str, state: HostState) {
        let ring = if name == "a" || name == "b" { 0 } else { 1 };
        let host = self
            .coord
            .ring_group("rg")
            .unwrap()
            .ring(ring)
            .unwrap()
            .host(&PartitionServerAddress::new(name, 1))
            .unwrap()
            .unwrap();
        host.set_state(&self.session, state).unwrap();
    }

    /// Wait until the connection to `name` reflects `state`
    async fn wait_for(&self, name: &str, state: HostState) {
        for _ in 0..200 {
            let settled = (0..NUM_PARTITIONS)
                .filter_map(|p| self.router.pool(self.domain_id, p))
                .flat_map(|pool| pool.connections())
                .filter(|c| c.host_address().hostname == name)
                .all(|c| c.host_state() == state);
            if settled {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("connection to {} never became {}", name, state);
    }

    fn calls(&self, name: &str) -> usize {
        self.calls[name].load(Ordering::SeqCst)
    }

    fn key_for_partition(partition: u32) -> String {
        (0..)
            .map(|i| format!("key-{}", i))
            .find(|k| partition_for_key(k.as_bytes(), NUM_PARTITIONS) == partition)
            .unwrap()
    }
}

fn replicas(partition: u32) -> [&'static str; 2] {
    if partition % 2 == 0 {
        ["a", "c"]
    } else {
        ["b", "d"]
    }
}

#[tokio::test]
async fn test_every_partition_has_one_replica_per_ring() {
    let cluster = Cluster::start(ClientConfig::default()).await;
    for partition in 0..NUM_PARTITIONS {
        let pool = cluster.router.pool(cluster.domain_id, partition).unwrap();
        let mut hosts: Vec<String> = pool
            .host_addresses()
            .iter()
            .map(|a| a.hostname.clone())
            .collect();
        hosts.sort();
        assert_eq!(hosts, replicas(partition));
    }
}

#[tokio::test]
async fn test_round_robin_spreads_over_replicas() {
    let config = ClientConfig {
        use_key_hash: false,
        ..ClientConfig::default()
    };
    let cluster = Cluster::start(config).await;
    let key = Cluster::key_for_partition(0);
    for _ in 0..10 {
        cluster.router.get(cluster.domain_id, key.as_bytes()).await.unwrap();
    }
    assert_eq!(cluster.calls("a"), 5);
    assert_eq!(cluster.calls("c"), 5);
}

#[tokio::test]
async fn test_key_affinity_is_stable() {
    let cluster = Cluster::start(ClientConfig::default()).await;
    for i in 0..20 {
        let key = format!("user-{}", i);
        let first = cluster.router.get(cluster.domain_id, key.as_bytes()).await.unwrap();
        for _ in 0..3 {
            let again = cluster.router.get(cluster.domain_id, key.as_bytes()).await.unwrap();
            assert_eq!(again, first);
        }
    }
}

#[tokio::test]
async fn test_idle_replica_is_avoided() {
    let cluster = Cluster::start(ClientConfig::default()).await;
    cluster.set_state("a", HostState::Idle);
    cluster.wait_for("a", HostState::Idle).await;

    let key = Cluster::key_for_partition(0);
    for _ in 0..10 {
        let response = cluster.router.get(cluster.domain_id, key.as_bytes()).await.unwrap();
        assert_eq!(response, GetResponse::Found(Bytes::from_static(b"c")));
    }
    assert_eq!(cluster.calls("a"), 0);
}

#[tokio::test]
async fn test_offline_replica_is_last_resort() {
    let cluster = Cluster::start(ClientConfig::default()).await;
    let key = Cluster::key_for_partition(1);

    cluster.set_state("b", HostState::Offline);
    cluster.wait_for("b", HostState::Offline).await;
    let response = cluster.router.get(cluster.domain_id, key.as_bytes()).await.unwrap();
    assert_eq!(response, GetResponse::Found(Bytes::from_static(b"d")));

    // Idle is never picked, offline still is
    cluster.set_state("d", HostState::Idle);
    cluster.wait_for("d", HostState::Idle).await;
    let response = cluster.router.get(cluster.domain_id, key.as_bytes()).await.unwrap();
    assert_eq!(response, GetResponse::Found(Bytes::from_static(b"b")));
}

#[tokio::test]
async fn test_failover_to_other_ring() {
    let cluster = Cluster::start(ClientConfig::default()).await;
    cluster.fail["a"].store(true, Ordering::SeqCst);

    let key = Cluster::key_for_partition(0);
    for _ in 0..5 {
        let response = cluster.router.get(cluster.domain_id, key.as_bytes()).await.unwrap();
        assert_eq!(response, GetResponse::Found(Bytes::from_static(b"c")));
    }
}

#[tokio::test]
async fn test_retries_exhausted_when_every_replica_fails() {
    let config = ClientConfig {
        max_tries: 3,
        ..ClientConfig::default()
    };
    let cluster = Cluster::start(config).await;
    cluster.fail["b"].store(true, Ordering::SeqCst);
    cluster.fail["d"].store(true, Ordering::SeqCst);

    let key = Cluster::key_for_partition(1);
    assert_eq!(
        cluster.router.get(cluster.domain_id, key.as_bytes()).await,
        Err(QueryError::RetriesExhausted(3))
    );
    assert_eq!(cluster.calls("b") + cluster.calls("d"), 3);
}

#[tokio::test]
async fn test_no_connection_when_partition_unserved() {
    let cluster = Cluster::start(ClientConfig::default()).await;
    for name in ["a", "c"] {
        cluster.set_state(name, HostState::Idle);
        cluster.wait_for(name, HostState::Idle).await;
    }
    let key = Cluster::key_for_partition(0);
    assert_eq!(
        cluster.router.get(cluster.domain_id, key.as_bytes()).await,
        Err(QueryError::NoConnectionAvailable)
    );
}

#[tokio::test]
async fn test_bulk_partial_failure() {
    let cluster = Cluster::start(ClientConfig::default()).await;
    for name in ["b", "d"] {
        cluster.fail[name].store(true, Ordering::SeqCst);
    }
    let keys = vec![
        Bytes::from(Cluster::key_for_partition(0)),
        Bytes::from(Cluster::key_for_partition(1)),
        Bytes::from(Cluster::key_for_partition(2)),
    ];
    let results = cluster.router.get_bulk(cluster.domain_id, &keys).await;
    assert!(results[0].as_ref().unwrap().is_found());
    assert!(matches!(results[1], Err(QueryError::RetriesExhausted(_))));
    assert!(results[2].as_ref().unwrap().is_found());
}
