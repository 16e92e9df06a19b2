//! Persistent node storage using RocksDB
//!
//! Stores every persistent node of the coordination tree, keyed by path.
//! Ephemeral nodes are session-scoped and never reach this layer.

use crate::common::Result;
use crate::store::NodeRecord;
use rocksdb::{Options, WriteBatch, DB};
use std::path::Path;

const CF_NODES: &str = "nodes";

/// One write in an atomic batch
#[derive(Debug)]
pub enum NodeWrite<'a> {
    Put(&'a str, &'a NodeRecord),
    Delete(&'a str),
}

/// RocksDB-backed node store
pub struct RocksBackend {
    db: DB,
}

impl RocksBackend {
    /// Open or create the node database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_NODES])?;

        Ok(Self { db })
    }

    fn nodes_cf(&self) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(CF_NODES)
            .ok_or_else(|| crate::Error::Internal("missing nodes column family".into()))
    }

    /// Apply writes atomically
    pub fn write(&self, writes: &[NodeWrite<'_>]) -> Result<()> {
        let cf = self.nodes_cf()?;
        let mut batch = WriteBatch::default();
        for write in writes {
            match write {
                NodeWrite::Put(path, record) => {
                    let value = bincode::serialize(*record)
                        .map_err(|e| crate::Error::Internal(format!("Serialize error: {}", e)))?;
                    batch.put_cf(cf, path.as_bytes(), value);
                }
                NodeWrite::Delete(path) => batch.delete_cf(cf, path.as_bytes()),
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Load every stored node
    pub fn load_all(&self) -> Result<Vec<(String, NodeRecord)>> {
        let cf = self.nodes_cf()?;
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        let mut nodes = Vec::new();
        for item in iter {
            let (key_bytes, value_bytes) = item?;
            let path = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| crate::Error::MetadataCorrupted("Invalid UTF-8 path".into()))?;
            let record: NodeRecord = bincode::deserialize(&value_bytes)
                .map_err(|e| crate::Error::MetadataCorrupted(e.to_string()))?;
            nodes.push((path, record));
        }

        Ok(nodes)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
