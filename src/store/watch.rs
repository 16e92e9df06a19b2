//! Change notification handles
//!
//! A watch fires at least once after any change to the watched node or to
//! its set of children. Notifications carry no payload and coalesce: the
//! consumer always re-reads the authoritative value.

use crate::common::Result;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::watch;

/// Subscription to changes of one node path
#[derive(Debug, Clone)]
pub struct NodeWatch {
    path: String,
    rx: watch::Receiver<u64>,
}

impl NodeWatch {
    pub(crate) fn new(path: String, rx: watch::Receiver<u64>) -> Self {
        Self { path, rx }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next change
    pub async fn changed(&mut self) -> Result<()> {
        self.rx
            .changed()
            .await
            .map_err(|_| crate::Error::StoreClosed)
    }

    /// Whether a change arrived that has not been consumed yet
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Consume any pending change without waiting
    pub fn mark_seen(&mut self) {
        let _ = self.rx.borrow_and_update();
    }
}

type ReadFn<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

/// Level-triggered subscription to a typed value.
///
/// Every `next` waits for a change notification on any of the watched paths
/// and then re-reads the value, so a missed notification is corrected by
/// the next read.
pub struct Subscription<T> {
    watches: Vec<NodeWatch>,
    read: ReadFn<T>,
}

impl<T> Subscription<T> {
    pub fn new(watches: Vec<NodeWatch>, read: impl Fn() -> Result<T> + Send + Sync + 'static) -> Self {
        Self {
            watches,
            read: Box::new(read),
        }
    }

    /// Read the current authoritative value
    pub fn current(&self) -> Result<T> {
        (self.read)()
    }

    /// Wait for a change, then return the fresh value
    pub async fn next(&mut self) -> Result<T> {
        if !self.watches.iter().any(NodeWatch::has_changed) {
            let waits: Vec<Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>> = self
                .watches
                .iter_mut()
                .map(|w| Box::pin(w.changed()) as Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>)
                .collect();
            if waits.is_empty() {
                return Err(crate::Error::StoreClosed);
            }
            let (result, _, _) = futures_util::future::select_all(waits).await;
            result?;
        }
        for watch in &mut self.watches {
            watch.mark_seen();
        }
        (self.read)()
    }
}
