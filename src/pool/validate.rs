//! Synchronization check against the managed system
//!
//! The pool does not talk to the managed system itself. Callers plug in a
//! [`SyncValidator`] that confirms which node ids are currently synchronized.

use std::collections::BTreeSet;

pub trait SyncValidator: Send + Sync {
    /// The subset of `ids` confirmed valid, in input order
    fn confirmed(&self, ids: &[String]) -> Vec<String>;
}

/// Treats every node as synchronized
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SyncValidator for AcceptAll {
    fn confirmed(&self, ids: &[String]) -> Vec<String> {
        ids.to_vec()
    }
}

/// Confirms a fixed set of ids, typically loaded from a sync report
#[derive(Debug, Clone, Default)]
pub struct StaticSyncValidator {
    synced: BTreeSet<String>,
}

impl StaticSyncValidator {
    pub fn new<I, S>(synced: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            synced: synced.into_iter().map(Into::into).collect(),
        }
    }
}

impl SyncValidator for StaticSyncValidator {
    fn confirmed(&self, ids: &[String]) -> Vec<String> {
        ids.iter()
            .filter(|id| self.synced.contains(*id))
            .cloned()
            .collect()
    }
}
