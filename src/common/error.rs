//! Error types for ringkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Coordination Store Errors ===
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Version conflict on {path}: expected {expected}, got {actual}")]
    BadVersion {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Ephemeral nodes cannot have children: {0}")]
    EphemeralParent(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Coordination store closed")]
    StoreClosed,

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    // === Metadata Errors ===
    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    #[error("Domain {0} is in use by a ring group")]
    DomainInUse(String),

    #[error("Domain {domain} has no version {version}")]
    DomainVersionNotFound { domain: String, version: u32 },

    #[error("Domain {domain} version {version} is referenced by ring group {ring_group}")]
    DomainVersionInUse {
        domain: String,
        version: u32,
        ring_group: String,
    },

    #[error("Domain {domain} version {version} is closed")]
    DomainVersionClosed { domain: String, version: u32 },

    #[error("Domain group not found: {0}")]
    DomainGroupNotFound(String),

    #[error("Ring group not found: {0}")]
    RingGroupNotFound(String),

    #[error("Ring group {ring_group} does not have ring number {ring}")]
    RingNotFound { ring_group: String, ring: u32 },

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Ring group {ring_group} is already updating to version {version}")]
    RolloutInProgress { ring_group: String, version: u32 },

    #[error("No eligible hosts for domain {0}")]
    NoEligibleHosts(String),

    // === Client Errors ===
    #[error("Connection pool must be initialized with a non empty collection of connections")]
    EmptyPool,

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Can the caller resolve this by re-reading state and trying again?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BadVersion { .. } | Error::NodeExists(_) | Error::NodeNotFound(_)
        )
    }

    /// Is this a fault of the coordination store itself rather than of the model?
    pub fn is_store_fault(&self) -> bool {
        matches!(
            self,
            Error::NodeNotFound(_)
                | Error::NodeExists(_)
                | Error::NotEmpty(_)
                | Error::BadVersion { .. }
                | Error::SessionExpired(_)
                | Error::EphemeralParent(_)
                | Error::StoreClosed
                | Error::RocksDb(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::MetadataCorrupted(e.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
