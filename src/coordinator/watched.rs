//! Typed nodes holding bincode-encoded metadata

use crate::common::Result;
use crate::store::{CoordinationStore, CreateMode, Session, Subscription};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// A coordination-store node whose data is one serialized `T`.
///
/// Reads always go to the store; [`WatchedNode::subscribe`] re-reads on
/// every notification.
pub struct WatchedNode<T> {
    store: CoordinationStore,
    path: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for WatchedNode<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            path: self.path.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> WatchedNode<T>
where
    T: Serialize + DeserializeOwned + Default + Send + 'static,
{
    pub fn new(store: CoordinationStore, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn decode(data: &[u8]) -> Result<Option<T>> {
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(bincode::deserialize(data)?))
    }

    fn encode(value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| crate::Error::Internal(format!("Serialize error: {}", e)))
    }

    /// Current value, `None` when the node is absent or empty
    pub fn get(&self) -> Result<Option<T>> {
        match self.store.get_data(&self.path) {
            Ok((data, _)) => Self::decode(&data),
            Err(crate::Error::NodeNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn get_or_default(&self) -> Result<T> {
        Ok(self.get()?.unwrap_or_default())
    }

    pub fn create(&self, value: &T) -> Result<()> {
        self.store
            .create(&self.path, &Self::encode(value)?, CreateMode::Persistent)?;
        Ok(())
    }

    /// Create the node as ephemeral for `session`, or take over a node left
    /// by an earlier session. Existing data is kept.
    pub fn ensure_created_ephemeral(&self, session: &Session) -> Result<()> {
        self.store
            .claim_ephemeral(session, &self.path, &Self::encode(&T::default())?)
    }

    pub fn set(&self, value: &T) -> Result<()> {
        self.store.set_or_create(&self.path, &Self::encode(value)?)
    }

    /// Read-modify-write with optimistic concurrency; retried on conflicts.
    /// The node must exist.
    pub fn update(&self, mut apply: impl FnMut(&mut T)) -> Result<T> {
        loop {
            let (data, stat) = self.store.get_data(&self.path)?;
            let mut value = Self::decode(&data)?.unwrap_or_default();
            apply(&mut value);
            match self
                .store
                .set_data(&self.path, &Self::encode(&value)?, Some(stat.version))
            {
                Ok(_) => return Ok(value),
                Err(crate::Error::BadVersion { .. }) => {
                    tracing::trace!("Concurrent update of {}, retrying", self.path);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove the node and anything below it
    pub fn delete(&self) -> Result<()> {
        self.store.delete_recursive(&self.path)
    }

    pub fn subscribe(&self) -> Subscription<Option<T>> {
        let node = self.clone();
        Subscription::new(vec![self.store.watch(&self.path)], move || node.get())
    }
}
