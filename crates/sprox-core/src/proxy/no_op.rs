//! Proxy handed to consumers that have been disabled
//!
//! A disabled consumer may still be finishing work against its handles. The
//! no-op proxy lets it do so without side effects: registrations and writes
//! are dropped, pushes are absorbed, nothing is sent to the store, nothing is
//! reported and reads never resolve.

use crate::error::Result;
use crate::observer::{ProxyObserver, Snapshot};
use crate::types::{
    ConsumerId, CursorId, CursorPage, Entity, ProxyId, StoreKind, SyncModel, SyncState,
    UpdateEvent, Version,
};
use std::future;
use std::sync::Arc;

/// Stands in for a proxy of any kind and does nothing
#[derive(Debug, Clone)]
pub struct NoOpProxy {
    id: ProxyId,
    kind: StoreKind,
}

impl NoOpProxy {
    pub fn new(id: ProxyId, kind: StoreKind) -> Self {
        Self { id, kind }
    }

    pub fn id(&self) -> &ProxyId {
        &self.id
    }

    /// The kind of proxy this one replaces
    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn version(&self) -> Option<Version> {
        None
    }

    pub fn sync_state(&self) -> SyncState {
        SyncState::None
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::Empty
    }

    pub fn register(&self, _consumer: ConsumerId, _observer: Arc<dyn ProxyObserver>) {}

    pub fn deregister(&self, _consumer: &ConsumerId, _observer: &Arc<dyn ProxyObserver>) {}

    pub fn on_full_sync(&self, _version: Version, _model: SyncModel) -> Result<()> {
        Ok(())
    }

    pub fn on_update(&self, _update: UpdateEvent) -> Result<()> {
        Ok(())
    }

    pub fn store(&self, _value: Entity, _keys: Vec<String>, _consumer: &ConsumerId) -> Result<()> {
        Ok(())
    }

    pub fn remove(&self, _id: &str, _keys: Vec<String>, _consumer: &ConsumerId) -> Result<()> {
        Ok(())
    }

    pub fn clear(&self, _consumer: &ConsumerId) -> Result<()> {
        Ok(())
    }

    pub fn set(&self, _value: Entity, _consumer: &ConsumerId) -> Result<()> {
        Ok(())
    }

    pub async fn get(&self, _consumer: &ConsumerId) -> Result<Option<Entity>> {
        future::pending().await
    }

    pub async fn get_by_id(&self, _id: &str, _consumer: &ConsumerId) -> Result<Option<Entity>> {
        future::pending().await
    }

    pub async fn to_list(&self, _consumer: &ConsumerId) -> Result<Vec<Entity>> {
        future::pending().await
    }

    pub async fn stream(&self, _page_size: usize, _forward: bool) -> Result<CursorId> {
        future::pending().await
    }

    pub async fn cursor_next(&self, _cursor: CursorId) -> Result<CursorPage> {
        future::pending().await
    }

    pub async fn cursor_close(&self, _cursor: CursorId) -> Result<()> {
        future::pending().await
    }
}
