use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::pool::NodePool;

/// Shared nodemanager state
#[derive(Clone)]
pub struct NodeManagerState {
    pub pool: Arc<NodePool>,
    /// Consumer -> start of its in-flight deallocation
    pub deallocations: Arc<DashMap<String, DateTime<Utc>>>,
}

impl NodeManagerState {
    pub fn new(pool: NodePool) -> Self {
        Self::with_pool(Arc::new(pool))
    }

    pub fn with_pool(pool: Arc<NodePool>) -> Self {
        Self {
            pool,
            deallocations: Arc::new(DashMap::new()),
        }
    }

    /// Mark a deallocation for `consumer` as running
    ///
    /// `None` when one is already in flight. The mark is cleared when the
    /// ticket drops.
    pub fn begin_deallocation(&self, consumer: &str) -> Option<DeallocationTicket> {
        match self.deallocations.entry(consumer.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Some(DeallocationTicket {
                    deallocations: Arc::clone(&self.deallocations),
                    consumer: consumer.to_string(),
                })
            }
        }
    }

    pub fn deallocations_in_flight(&self) -> usize {
        self.deallocations.len()
    }
}

pub struct DeallocationTicket {
    deallocations: Arc<DashMap<String, DateTime<Utc>>>,
    consumer: String,
}

impl Drop for DeallocationTicket {
    fn drop(&mut self) {
        self.deallocations.remove(&self.consumer);
    }
}
