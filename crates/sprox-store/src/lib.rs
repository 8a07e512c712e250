//! sprox backing stores
//!
//! The backing store is the authority for every store's contents and version.
//! Each mutation advances the store's version by one; collection and variable
//! stores announce every mutation to subscribers as an [`UpdateEvent`].

pub mod error;
pub mod memory;

use async_trait::async_trait;
use sprox_core::{
    Barrier, ConsumerId, CursorId, CursorPage, Entity, RemoveData, SerializedEntry, StoreData,
    StoreRef, SyncModel, UpdateEvent, Version,
};
use tokio::sync::broadcast;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;

/// Backing store contract
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Subscribe to the update events of a store
    fn subscribe(&self, store: &StoreRef) -> StoreResult<broadcast::Receiver<UpdateEvent>>;

    /// The whole model and the version it reflects
    async fn full_sync(&self, store: &StoreRef) -> StoreResult<(Version, SyncModel)>;

    /// Current value of a variable store
    async fn get(&self, store: &StoreRef) -> StoreResult<Option<Entity>>;

    /// Every entry of a collection store
    async fn to_list(&self, store: &StoreRef) -> StoreResult<Vec<SerializedEntry>>;

    async fn store(
        &self,
        store: &StoreRef,
        data: StoreData,
        originator: &ConsumerId,
    ) -> StoreResult<Version>;

    /// Remove keys of one item; empty keys remove every key the store holds
    async fn remove(
        &self,
        store: &StoreRef,
        data: RemoveData,
        originator: &ConsumerId,
    ) -> StoreResult<Version>;

    /// Remove several items in one version; an empty list removes everything
    async fn remove_multiple(
        &self,
        store: &StoreRef,
        items: Vec<RemoveData>,
        originator: &ConsumerId,
    ) -> StoreResult<Version>;

    async fn set(
        &self,
        store: &StoreRef,
        value: Entity,
        originator: &ConsumerId,
        barrier: Option<Barrier>,
    ) -> StoreResult<Version>;

    async fn clear(
        &self,
        store: &StoreRef,
        originator: &ConsumerId,
        barrier: Option<Barrier>,
    ) -> StoreResult<Version>;

    /// Open a paged cursor over a big collection
    async fn stream(&self, store: &StoreRef, page_size: usize, forward: bool)
        -> StoreResult<CursorId>;

    async fn cursor_next(&self, store: &StoreRef, cursor: CursorId) -> StoreResult<CursorPage>;

    async fn cursor_close(&self, store: &StoreRef, cursor: CursorId) -> StoreResult<()>;

    /// Get store statistics
    async fn stats(&self) -> StoreResult<StoreStats>;
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub store_count: usize,
    pub item_count: usize,
    pub open_cursors: usize,
}
