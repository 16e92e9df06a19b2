//! Query results

use bytes::Bytes;
use thiserror::Error;

/// Application-level answer from a partition server. Every variant is a
/// successful round-trip and is never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetResponse {
    Found(Bytes),
    NotFound,
    /// The server refused the request
    Rejected(String),
}

impl GetResponse {
    pub fn is_found(&self) -> bool {
        matches!(self, GetResponse::Found(_))
    }

    pub fn value(&self) -> Option<&Bytes> {
        match self {
            GetResponse::Found(value) => Some(value),
            _ => None,
        }
    }
}

/// Answers to a bulk request, in key order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub responses: Vec<GetResponse>,
}

impl BulkResponse {
    pub fn new(responses: Vec<GetResponse>) -> Self {
        Self { responses }
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

/// Why a query produced no answer
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryError {
    #[error("No connection is available")]
    NoConnectionAvailable,

    #[error("Query failed after {0} tries")]
    RetriesExhausted(usize),
}
