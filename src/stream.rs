//! Result of an aggregation

use serde_json::Value;

use crate::aggregator::Tier;

/// Output documents of one execution, in pipeline order
#[derive(Debug, Clone)]
pub struct DocumentStream {
    documents: std::vec::IntoIter<Value>,
    /// Tier that produced the documents
    tier: Tier,
}

impl DocumentStream {
    /// Creates a stream over `documents`
    pub fn new(documents: Vec<Value>, tier: Tier) -> Self {
        Self {
            documents: documents.into_iter(),
            tier,
        }
    }

    /// Returns the tier that produced the result
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Returns the number of documents not yet consumed
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if no documents remain
    pub fn is_empty(&self) -> bool {
        self.documents.len() == 0
    }

    /// Collects the remaining documents
    pub fn into_vec(self) -> Vec<Value> {
        self.documents.collect()
    }
}

impl Iterator for DocumentStream {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        self.documents.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.documents.size_hint()
    }
}

impl ExactSizeIterator for DocumentStream {}
