//! Node resource pool and allocation engine
//!
//! [`NodePool`] is the entry point: every mutating call takes the named pool
//! lock, runs the synchronous inventory or allocator operation, and releases
//! the lock on every exit path. Reads go through the cache and never lock.
//! Store work runs through [`store::offload`] so a file-backed pool does not
//! stall the async workers.

pub mod allocator;
pub mod cache;
pub mod cardinality;
pub mod error;
pub mod filter;
pub mod inventory;
pub mod lock;
pub mod node;
pub mod request;
pub mod resolve;
pub mod store;
pub mod types;
pub mod validate;

pub use allocator::{
    AllocationOutcome, AllocationState, AllocationWarning, Allocator, DeallocationReport,
    ExchangeOutcome, WarningSeverity,
};
pub use cardinality::{CardinalitySource, NodeCardinalitySource};
pub use error::{AttachError, PoolError, RejectReason};
pub use inventory::{AddReport, HostsView, Inventory, NodeSelector, RemoveReport, TypeSummary};
pub use lock::{PoolGuard, PoolLock};
pub use node::{Node, NodeDescriptor, NodeDict};
pub use request::{AllocationRequest, CardinalitySpec, Selection, FILL};
pub use store::{offload, FileStore, KvStore, MemoryStore, StoreError};
pub use types::TypeAliases;
pub use validate::{AcceptAll, StaticSyncValidator, SyncValidator};

use std::sync::Arc;

use tracing::error;

use crate::config::{PoolConfig, StoreBackend};

/// Thread-safe handle over one node pool
pub struct NodePool {
    inventory: Arc<Inventory>,
    allocator: Allocator,
    lock: PoolLock,
    validator: Arc<dyn SyncValidator>,
}

impl NodePool {
    pub fn new(store: Arc<dyn KvStore>, config: &PoolConfig) -> Self {
        let inventory = Arc::new(Inventory::new(
            Arc::clone(&store),
            config.known_types.clone(),
            config.type_aliases(),
        ));
        let allocator = Allocator::new(
            Arc::clone(&inventory),
            config.exclusive_consumers.clone(),
            config.consumers.clone(),
        )
        .with_seed(config.selection_seed);
        let lock = PoolLock::new(store, config.lock.name.clone())
            .with_poll_interval(config.lock.poll_interval());

        Self {
            inventory,
            allocator,
            lock,
            validator: Arc::new(AcceptAll),
        }
    }

    /// Open the store the config points at
    pub fn from_config(config: &PoolConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn KvStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::File => Arc::new(FileStore::open(config.store.resolved_path())?),
        };
        Ok(Self::new(store, config))
    }

    pub fn with_cardinality_source(mut self, source: Arc<dyn CardinalitySource>) -> Self {
        self.allocator = self.allocator.with_cardinality_source(source);
        self
    }

    pub fn with_sync_validator(mut self, validator: Arc<dyn SyncValidator>) -> Self {
        self.allocator = self.allocator.with_sync_validator(Arc::clone(&validator));
        self.validator = validator;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.allocator = self.allocator.with_seed(seed);
        self
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Run `op` while holding the pool lock
    async fn locked<T, F>(&self, op: F) -> Result<T, PoolError>
    where
        F: FnOnce(&PoolGuard) -> Result<T, PoolError>,
    {
        let guard = self.lock.acquire().await?;
        offload(|| {
            let result = op(&guard);
            if let Err(e) = guard.release() {
                // The operation already persisted its changes; report its result
                error!("Failed to release pool lock '{}': {}", self.lock.name(), e);
            }
            result
        })
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Import nodes; `validate` runs the sync check on each accepted node
    pub async fn add(&self, descriptors: Vec<NodeDescriptor>, validate: bool) -> Result<AddReport, PoolError> {
        let validator = validate.then(|| self.validator.as_ref());
        self.locked(|guard| self.inventory.add(guard, descriptors, validator))
            .await
    }

    pub async fn remove(&self, selector: NodeSelector, force: bool) -> Result<RemoveReport, PoolError> {
        self.locked(|guard| self.inventory.remove(guard, &selector, force))
            .await
    }

    pub async fn remove_all(&self, force: bool) -> Result<RemoveReport, PoolError> {
        self.locked(|guard| self.inventory.remove_all(guard, force))
            .await
    }

    /// Clear ownership of every consumer not in `active_consumers`
    pub async fn reset(&self, active_consumers: Vec<String>) -> Result<usize, PoolError> {
        self.locked(|guard| self.inventory.reset(guard, &active_consumers))
            .await
    }

    pub async fn allocate(&self, request: &AllocationRequest) -> Result<AllocationOutcome, PoolError> {
        self.locked(|guard| self.allocator.allocate(guard, request))
            .await
    }

    pub async fn deallocate(&self, consumer: &str) -> Result<DeallocationReport, PoolError> {
        self.locked(|guard| self.allocator.deallocate(guard, consumer))
            .await
    }

    pub async fn deallocate_unused(
        &self,
        consumer: &str,
        ids: &[String],
    ) -> Result<DeallocationReport, PoolError> {
        self.locked(|guard| self.allocator.deallocate_unused(guard, consumer, ids))
            .await
    }

    /// Deallocate then allocate under a single lock hold
    pub async fn exchange(&self, request: &AllocationRequest) -> Result<ExchangeOutcome, PoolError> {
        self.locked(|guard| self.allocator.exchange(guard, request))
            .await
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn available_nodes(&self, request: &AllocationRequest) -> Result<Vec<Node>, PoolError> {
        offload(|| self.allocator.available_nodes(request))
    }

    pub fn grep(&self, patterns: &[String]) -> Result<Vec<Node>, PoolError> {
        offload(|| self.inventory.grep(patterns))
    }

    pub fn filter(&self, ids: &[String]) -> Result<Vec<Node>, PoolError> {
        offload(|| self.inventory.filter(ids))
    }

    pub fn list(&self) -> Result<Vec<Node>, PoolError> {
        Ok(offload(|| self.inventory.nodes())?)
    }

    pub fn node_dict(&self) -> Result<NodeDict, PoolError> {
        Ok(offload(|| self.inventory.node_dict())?)
    }

    pub fn allocated_nodes(&self, consumer: &str) -> Result<Vec<Node>, PoolError> {
        Ok(offload(|| self.inventory.allocated_nodes(consumer))?)
    }

    pub fn summary(&self) -> Result<Vec<TypeSummary>, PoolError> {
        Ok(offload(|| self.inventory.summary())?)
    }

    pub fn hosts_view(&self) -> Result<HostsView, PoolError> {
        Ok(offload(|| self.inventory.hosts_view())?)
    }

    /// Reload the cache from the store
    pub fn refresh_cache(&self) -> Result<usize, PoolError> {
        Ok(offload(|| self.inventory.refresh_cache())?)
    }
}
