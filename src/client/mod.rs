//! Query client
//!
//! - [`HostConnection`]: the contract of one connection to a partition server
//! - [`HostConnectionPool`]: tiered connection selection with retries
//! - [`PartitionRouter`]: per-partition pools for a ring group
//! - [`ConnectionLoad`]: lock utilization of a set of connections

pub mod connection;
pub mod load;
pub mod pool;
pub mod response;
pub mod router;

pub use connection::{
    ConnectionGuard, ConnectionLock, HostConnection, HostStateCache, PartitionServerConnection,
    Transport,
};
pub use load::ConnectionLoad;
pub use pool::{HostConnectionPool, Selection};
pub use response::{BulkResponse, GetResponse, QueryError};
pub use router::PartitionRouter;
