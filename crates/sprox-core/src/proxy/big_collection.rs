//! Unsynchronized proxy for collections too large to mirror
//!
//! Nothing is held locally; every operation is a round trip to the store and
//! reads go through paged cursors.

use super::{unexpected, StorageProxy, SyncCore, Variant};
use crate::error::{Error, Result};
use crate::observer::{Delta, Snapshot};
use crate::port::{Request, Response};
use crate::types::{
    entity_id, ConsumerId, CursorId, CursorPage, Entity, RemoveData, StoreData, StoreKind,
    SyncModel, UpdateEvent,
};

pub type BigCollectionProxy = StorageProxy<BigCollectionModel>;

#[derive(Debug, Default)]
pub struct BigCollectionModel;

impl Variant for BigCollectionModel {
    const KIND: StoreKind = StoreKind::BigCollection;
    const MIRRORED: bool = false;

    fn snapshot(&self) -> Snapshot {
        Snapshot::Empty
    }

    fn synchronize(&mut self, core: &mut SyncCore, _: SyncModel) -> Result<bool> {
        Err(core.programming_error("synchronize"))
    }

    fn fold(&mut self, core: &mut SyncCore, _: &UpdateEvent, _: bool) -> Result<Option<Delta>> {
        Err(core.programming_error("fold"))
    }
}

impl StorageProxy<BigCollectionModel> {
    async fn round_trip(&self, request: Request) -> Result<Response> {
        self.port.call(request).await
    }

    async fn acked(&self, name: &'static str, request: Request) -> Result<()> {
        match self.round_trip(request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(name, other)),
        }
    }

    pub async fn store(&self, value: Entity, keys: Vec<String>, consumer: &ConsumerId) -> Result<()> {
        let id = entity_id(&value)?;
        if keys.is_empty() {
            return Err(Error::MissingKeys(id.to_string()));
        }

        let request = Request::Store {
            store: self.store.clone(),
            data: StoreData { value, keys },
            consumer: consumer.clone(),
        };
        self.acked("Store", request).await
    }

    /// Remove an entity outright; the store resolves every key it holds
    pub async fn remove(&self, id: &str, consumer: &ConsumerId) -> Result<()> {
        let request = Request::Remove {
            store: self.store.clone(),
            data: RemoveData {
                id: id.to_string(),
                keys: Vec::new(),
            },
            consumer: consumer.clone(),
        };
        self.acked("Remove", request).await
    }

    /// Open a cursor over the collection, `page_size` entities per page
    pub async fn stream(&self, page_size: usize, forward: bool) -> Result<CursorId> {
        let request = Request::Stream {
            store: self.store.clone(),
            page_size,
            forward,
        };
        match self.round_trip(request).await? {
            Response::Cursor(cursor) => Ok(cursor),
            other => Err(unexpected("Stream", other)),
        }
    }

    pub async fn cursor_next(&self, cursor: CursorId) -> Result<CursorPage> {
        let request = Request::CursorNext {
            store: self.store.clone(),
            cursor,
        };
        match self.round_trip(request).await? {
            Response::Page(page) => Ok(page),
            other => Err(unexpected("CursorNext", other)),
        }
    }

    pub async fn cursor_close(&self, cursor: CursorId) -> Result<()> {
        let request = Request::CursorClose {
            store: self.store.clone(),
            cursor,
        };
        self.acked("CursorClose", request).await
    }

    pub fn to_list(&self) -> Result<Vec<Entity>> {
        Err(Error::Unsupported {
            operation: "to_list",
            kind: StoreKind::BigCollection,
        })
    }

    pub fn get(&self, _id: &str) -> Result<Option<Entity>> {
        Err(Error::Unsupported {
            operation: "get",
            kind: StoreKind::BigCollection,
        })
    }
}
