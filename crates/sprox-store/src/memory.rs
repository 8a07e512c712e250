//! In-memory backing store

use crate::{BackingStore, StoreError, StoreResult, StoreStats};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sprox_core::{
    entity_id, Barrier, Change, ConsumerId, CursorId, CursorPage, Entity, EntryChange, OrSet,
    ProxyId, RemoveData, SerializedEntry, StoreData, StoreKind, StoreRef, SyncModel, UpdateEvent,
    Version,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Default capacity of each store's update broadcast
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

struct BigItem {
    index: u64,
    value: Entity,
    keys: BTreeSet<String>,
}

struct Cursor {
    remaining: VecDeque<Entity>,
    page_size: usize,
}

#[derive(Default)]
struct BigCollection {
    items: HashMap<String, BigItem>,
    next_index: u64,
    cursors: HashMap<CursorId, Cursor>,
}

impl BigCollection {
    fn ordered(&self) -> Vec<(&String, &BigItem)> {
        let mut items: Vec<_> = self.items.iter().collect();
        items.sort_by_key(|(_, item)| item.index);
        items
    }
}

enum Contents {
    Collection(OrSet<Entity>),
    Variable(Option<Entity>),
    Big(BigCollection),
}

struct StoreState {
    kind: StoreKind,
    version: Version,
    contents: Contents,
    events: broadcast::Sender<UpdateEvent>,
}

impl StoreState {
    fn new(kind: StoreKind, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let contents = match kind {
            StoreKind::Collection => Contents::Collection(OrSet::new()),
            StoreKind::Variable => Contents::Variable(None),
            StoreKind::BigCollection => Contents::Big(BigCollection::default()),
        };
        Self {
            kind,
            version: 0,
            contents,
            events,
        }
    }

    fn unsupported(&self, operation: &'static str) -> StoreError {
        StoreError::Unsupported {
            operation,
            kind: self.kind,
        }
    }

    /// Advance the version and announce the change to subscribers.
    ///
    /// Called with the store locked so events leave in version order.
    fn publish(
        &mut self,
        originator: &ConsumerId,
        barrier: Option<Barrier>,
        change: Change,
    ) -> Version {
        self.version += 1;
        // No subscribers is fine
        let _ = self.events.send(UpdateEvent {
            version: self.version,
            originator_id: Some(originator.clone()),
            barrier,
            change,
        });
        self.version
    }

    fn item_count(&self) -> usize {
        match &self.contents {
            Contents::Collection(set) => set.len(),
            Contents::Variable(value) => usize::from(value.is_some()),
            Contents::Big(big) => big.items.len(),
        }
    }
}

/// In-memory backing store
///
/// Stores are created on first use with the kind named by the request.
/// Data is lost when the process exits.
pub struct MemoryStore {
    stores: DashMap<ProxyId, Arc<Mutex<StoreState>>>,
    next_cursor: AtomicU64,
    event_capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Subscribers falling more than `capacity` events behind lose events
    pub fn with_event_capacity(capacity: usize) -> Self {
        Self {
            stores: DashMap::new(),
            next_cursor: AtomicU64::new(1),
            event_capacity: capacity.max(1),
        }
    }

    fn state(&self, store: &StoreRef) -> StoreResult<Arc<Mutex<StoreState>>> {
        let state = self
            .stores
            .entry(store.id.clone())
            .or_insert_with(|| {
                debug!(store = %store.id, kind = %store.kind, "Creating store");
                Arc::new(Mutex::new(StoreState::new(store.kind, self.event_capacity)))
            })
            .value()
            .clone();

        let existing = state.lock().kind;
        if existing != store.kind {
            return Err(StoreError::KindMismatch {
                id: store.id.to_string(),
                existing,
                requested: store.kind,
            });
        }
        Ok(state)
    }

    /// Current version of a store, if it exists
    pub fn version(&self, id: &ProxyId) -> Option<Version> {
        self.stores.get(id).map(|s| s.value().lock().version)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn id_of(value: &Entity) -> StoreResult<String> {
    entity_id(value)
        .map(str::to_string)
        .map_err(|e| StoreError::InvalidEntity(e.to_string()))
}

#[async_trait]
impl BackingStore for MemoryStore {
    fn subscribe(&self, store: &StoreRef) -> StoreResult<broadcast::Receiver<UpdateEvent>> {
        let state = self.state(store)?;
        let receiver = state.lock().events.subscribe();
        Ok(receiver)
    }

    async fn full_sync(&self, store: &StoreRef) -> StoreResult<(Version, SyncModel)> {
        let state = self.state(store)?;
        let state = state.lock();
        let model = match &state.contents {
            Contents::Collection(set) => SyncModel::Entries(set.to_serialized()),
            Contents::Variable(value) => SyncModel::Value(value.clone()),
            Contents::Big(_) => return Err(state.unsupported("full_sync")),
        };
        Ok((state.version, model))
    }

    async fn get(&self, store: &StoreRef) -> StoreResult<Option<Entity>> {
        let state = self.state(store)?;
        let state = state.lock();
        match &state.contents {
            Contents::Variable(value) => Ok(value.clone()),
            _ => Err(state.unsupported("get")),
        }
    }

    async fn to_list(&self, store: &StoreRef) -> StoreResult<Vec<SerializedEntry>> {
        let state = self.state(store)?;
        let state = state.lock();
        match &state.contents {
            Contents::Collection(set) => Ok(set.to_serialized()),
            Contents::Big(big) => Ok(big
                .ordered()
                .into_iter()
                .map(|(id, item)| SerializedEntry {
                    id: id.clone(),
                    value: item.value.clone(),
                    keys: item.keys.iter().cloned().collect(),
                })
                .collect()),
            Contents::Variable(_) => Err(state.unsupported("to_list")),
        }
    }

    async fn store(
        &self,
        store: &StoreRef,
        data: StoreData,
        originator: &ConsumerId,
    ) -> StoreResult<Version> {
        let id = id_of(&data.value)?;
        if data.keys.is_empty() {
            return Err(StoreError::MissingKeys(id));
        }

        let state = self.state(store)?;
        let mut state = state.lock();
        match &mut state.contents {
            Contents::Collection(set) => {
                let effective = set.add(&id, data.value.clone(), data.keys.iter().cloned());
                let change = Change::Add(vec![EntryChange {
                    value: data.value,
                    keys: data.keys,
                    effective,
                }]);
                Ok(state.publish(originator, None, change))
            }
            Contents::Big(big) => {
                let next_index = big.next_index;
                let item = big.items.entry(id).or_insert_with(|| BigItem {
                    index: next_index,
                    value: Entity::Null,
                    keys: BTreeSet::new(),
                });
                if item.index == next_index {
                    big.next_index += 1;
                }
                item.value = data.value;
                item.keys.extend(data.keys);
                state.version += 1;
                Ok(state.version)
            }
            Contents::Variable(_) => Err(state.unsupported("store")),
        }
    }

    async fn remove(
        &self,
        store: &StoreRef,
        data: RemoveData,
        originator: &ConsumerId,
    ) -> StoreResult<Version> {
        self.remove_multiple(store, vec![data], originator).await
    }

    async fn remove_multiple(
        &self,
        store: &StoreRef,
        items: Vec<RemoveData>,
        originator: &ConsumerId,
    ) -> StoreResult<Version> {
        let state = self.state(store)?;
        let mut state = state.lock();
        match &mut state.contents {
            Contents::Collection(set) => {
                let items = if items.is_empty() {
                    set.ids()
                        .map(|id| RemoveData {
                            id: id.to_string(),
                            keys: Vec::new(),
                        })
                        .collect()
                } else {
                    items
                };

                let removed = items
                    .into_iter()
                    .map(|item| {
                        let keys: Vec<String> = if item.keys.is_empty() {
                            set.get_keys(&item.id).into_iter().collect()
                        } else {
                            item.keys
                        };
                        let value = set
                            .get_value(&item.id)
                            .cloned()
                            .unwrap_or_else(|| serde_json::json!({ "id": item.id }));
                        let effective = set.remove(&item.id, &keys);
                        EntryChange {
                            value,
                            keys,
                            effective,
                        }
                    })
                    .collect();
                Ok(state.publish(originator, None, Change::Remove(removed)))
            }
            Contents::Big(big) => {
                if items.is_empty() {
                    big.items.clear();
                }
                for item in items {
                    let gone = match big.items.get_mut(&item.id) {
                        Some(existing) if !item.keys.is_empty() => {
                            for key in &item.keys {
                                existing.keys.remove(key);
                            }
                            existing.keys.is_empty()
                        }
                        Some(_) => true,
                        None => false,
                    };
                    if gone {
                        big.items.remove(&item.id);
                    }
                }
                state.version += 1;
                Ok(state.version)
            }
            Contents::Variable(_) => Err(state.unsupported("remove")),
        }
    }

    async fn set(
        &self,
        store: &StoreRef,
        value: Entity,
        originator: &ConsumerId,
        barrier: Option<Barrier>,
    ) -> StoreResult<Version> {
        let state = self.state(store)?;
        let mut state = state.lock();
        let Contents::Variable(current) = &mut state.contents else {
            return Err(state.unsupported("set"));
        };

        // A barriered write always echoes so the writer can see it land
        if barrier.is_none() && current.as_ref() == Some(&value) {
            return Ok(state.version);
        }

        *current = Some(value.clone());
        Ok(state.publish(originator, barrier, Change::Write { data: Some(value) }))
    }

    async fn clear(
        &self,
        store: &StoreRef,
        originator: &ConsumerId,
        barrier: Option<Barrier>,
    ) -> StoreResult<Version> {
        let state = self.state(store)?;
        let mut state = state.lock();
        let Contents::Variable(current) = &mut state.contents else {
            return Err(state.unsupported("clear"));
        };

        if barrier.is_none() && current.is_none() {
            return Ok(state.version);
        }

        *current = None;
        Ok(state.publish(originator, barrier, Change::Write { data: None }))
    }

    async fn stream(
        &self,
        store: &StoreRef,
        page_size: usize,
        forward: bool,
    ) -> StoreResult<CursorId> {
        if page_size == 0 {
            return Err(StoreError::InvalidPageSize);
        }

        let state = self.state(store)?;
        let mut state = state.lock();
        let Contents::Big(big) = &mut state.contents else {
            return Err(state.unsupported("stream"));
        };

        let mut remaining: VecDeque<Entity> =
            big.ordered().into_iter().map(|(_, item)| item.value.clone()).collect();
        if !forward {
            remaining.make_contiguous().reverse();
        }

        let cursor = self.next_cursor.fetch_add(1, Ordering::Relaxed);
        big.cursors.insert(cursor, Cursor { remaining, page_size });
        Ok(cursor)
    }

    async fn cursor_next(&self, store: &StoreRef, cursor: CursorId) -> StoreResult<CursorPage> {
        let state = self.state(store)?;
        let mut state = state.lock();
        let Contents::Big(big) = &mut state.contents else {
            return Err(state.unsupported("cursor_next"));
        };

        let Some(open) = big.cursors.get_mut(&cursor) else {
            return Ok(CursorPage {
                done: true,
                value: Vec::new(),
            });
        };

        let take = open.page_size.min(open.remaining.len());
        let value: Vec<Entity> = open.remaining.drain(..take).collect();
        let done = value.is_empty();
        if done {
            big.cursors.remove(&cursor);
        }
        Ok(CursorPage { done, value })
    }

    async fn cursor_close(&self, store: &StoreRef, cursor: CursorId) -> StoreResult<()> {
        let state = self.state(store)?;
        let mut state = state.lock();
        if let Contents::Big(big) = &mut state.contents {
            big.cursors.remove(&cursor);
        }
        Ok(())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let mut stats = StoreStats {
            store_count: self.stores.len(),
            ..StoreStats::default()
        };
        for entry in self.stores.iter() {
            let state = entry.value().lock();
            stats.item_count += state.item_count();
            if let Contents::Big(big) = &state.contents {
                stats.open_cursors += big.cursors.len();
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_ref(id: &str, kind: StoreKind) -> StoreRef {
        StoreRef::new(ProxyId::new(id).unwrap(), kind)
    }

    fn data(id: &str, keys: &[&str]) -> StoreData {
        StoreData {
            value: json!({"id": id}),
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_collection_mutations_bump_version_and_publish() {
        let store = MemoryStore::new();
        let items = store_ref("arc:items", StoreKind::Collection);
        let p1 = ConsumerId::from("p1");
        let mut events = store.subscribe(&items).unwrap();

        assert_eq!(store.store(&items, data("a", &["k1"]), &p1).await.unwrap(), 1);
        assert_eq!(store.store(&items, data("a", &["k2"]), &p1).await.unwrap(), 2);
        assert_eq!(
            store
                .remove(&items, RemoveData { id: "a".into(), keys: vec!["k1".into()] }, &p1)
                .await
                .unwrap(),
            3
        );

        let first = events.recv().await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.originator_id, Some(p1.clone()));
        assert!(matches!(&first.change, Change::Add(e) if e[0].effective));

        let second = events.recv().await.unwrap();
        assert!(matches!(&second.change, Change::Add(e) if !e[0].effective));

        let third = events.recv().await.unwrap();
        assert!(matches!(&third.change, Change::Remove(e) if !e[0].effective));

        let (version, model) = store.full_sync(&items).await.unwrap();
        assert_eq!(version, 3);
        assert!(matches!(model, SyncModel::Entries(e) if e.len() == 1 && e[0].keys == vec!["k2"]));
    }

    #[tokio::test]
    async fn test_store_requires_keys_and_id() {
        let store = MemoryStore::new();
        let items = store_ref("arc:items", StoreKind::Collection);
        let p1 = ConsumerId::from("p1");

        assert!(matches!(
            store.store(&items, data("a", &[]), &p1).await,
            Err(StoreError::MissingKeys(_))
        ));
        let nameless = StoreData { value: json!({"n": 1}), keys: vec!["k".into()] };
        assert!(matches!(
            store.store(&items, nameless, &p1).await,
            Err(StoreError::InvalidEntity(_))
        ));
        assert_eq!(store.version(&items.id), Some(0));
    }

    #[tokio::test]
    async fn test_remove_without_keys_removes_observed_keys() {
        let store = MemoryStore::new();
        let items = store_ref("arc:items", StoreKind::Collection);
        let p1 = ConsumerId::from("p1");
        let mut events = store.subscribe(&items).unwrap();

        store.store(&items, data("a", &["k1", "k2"]), &p1).await.unwrap();
        store.store(&items, data("b", &["k3"]), &p1).await.unwrap();
        store
            .remove(&items, RemoveData { id: "a".into(), keys: vec![] }, &p1)
            .await
            .unwrap();
        assert_eq!(store.to_list(&items).await.unwrap().len(), 1);

        events.recv().await.unwrap();
        events.recv().await.unwrap();
        let removal = events.recv().await.unwrap();
        assert!(matches!(
            &removal.change,
            Change::Remove(e) if e[0].effective && e[0].keys == vec!["k1", "k2"]
        ));

        // an empty list clears everything in one version
        let version = store.remove_multiple(&items, vec![], &p1).await.unwrap();
        assert_eq!(version, 4);
        assert!(store.to_list(&items).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_variable_set_and_barrier_echo() {
        let store = MemoryStore::new();
        let var = store_ref("arc:var", StoreKind::Variable);
        let p1 = ConsumerId::from("p1");
        let mut events = store.subscribe(&var).unwrap();

        assert_eq!(store.set(&var, json!({"id": "e1"}), &p1, None).await.unwrap(), 1);
        // unchanged and unbarriered: nothing happens
        assert_eq!(store.set(&var, json!({"id": "e1"}), &p1, None).await.unwrap(), 1);

        let barrier = Barrier::from("arc:var:barrier:1");
        assert_eq!(
            store.set(&var, json!({"id": "e1"}), &p1, Some(barrier.clone())).await.unwrap(),
            2
        );
        assert_eq!(store.clear(&var, &p1, None).await.unwrap(), 3);
        assert_eq!(store.clear(&var, &p1, None).await.unwrap(), 3);
        assert_eq!(store.get(&var).await.unwrap(), None);

        assert_eq!(events.recv().await.unwrap().version, 1);
        let echo = events.recv().await.unwrap();
        assert_eq!(echo.barrier, Some(barrier));
        let cleared = events.recv().await.unwrap();
        assert!(matches!(cleared.change, Change::Write { data: None }));
    }

    #[tokio::test]
    async fn test_kind_is_fixed_on_first_use() {
        let store = MemoryStore::new();
        let p1 = ConsumerId::from("p1");
        store
            .set(&store_ref("arc:x", StoreKind::Variable), json!({"id": "a"}), &p1, None)
            .await
            .unwrap();

        let as_collection = store_ref("arc:x", StoreKind::Collection);
        assert!(matches!(
            store.to_list(&as_collection).await,
            Err(StoreError::KindMismatch { existing: StoreKind::Variable, .. })
        ));
        assert!(matches!(
            store.get(&store_ref("arc:y", StoreKind::Collection)).await,
            Err(StoreError::Unsupported { operation: "get", .. })
        ));
    }

    #[tokio::test]
    async fn test_big_collection_cursors() {
        let store = MemoryStore::new();
        let big = store_ref("arc:big", StoreKind::BigCollection);
        let p1 = ConsumerId::from("p1");

        for id in ["a", "b", "c", "d", "e"] {
            store.store(&big, data(id, &["k"]), &p1).await.unwrap();
        }
        // re-storing keeps the original position
        store.store(&big, data("a", &["k2"]), &p1).await.unwrap();
        assert_eq!(store.version(&big.id), Some(6));

        let cursor = store.stream(&big, 2, true).await.unwrap();
        let mut seen = Vec::new();
        loop {
            let page = store.cursor_next(&big, cursor).await.unwrap();
            if page.done {
                break;
            }
            seen.extend(page.value.into_iter().map(|v| v["id"].as_str().unwrap().to_string()));
        }
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(store.stats().await.unwrap().open_cursors, 0);

        let backward = store.stream(&big, 3, false).await.unwrap();
        let page = store.cursor_next(&big, backward).await.unwrap();
        assert_eq!(page.value[0]["id"], "e");
        store.cursor_close(&big, backward).await.unwrap();
        assert!(store.cursor_next(&big, backward).await.unwrap().done);

        assert!(matches!(store.stream(&big, 0, true).await, Err(StoreError::InvalidPageSize)));
        assert!(matches!(
            store.full_sync(&big).await,
            Err(StoreError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_big_collection_remove_is_outright() {
        let store = MemoryStore::new();
        let big = store_ref("arc:big", StoreKind::BigCollection);
        let p1 = ConsumerId::from("p1");

        store.store(&big, data("a", &["k1", "k2"]), &p1).await.unwrap();
        store
            .remove(&big, RemoveData { id: "a".into(), keys: vec![] }, &p1)
            .await
            .unwrap();
        assert!(store.to_list(&big).await.unwrap().is_empty());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.store_count, 1);
        assert_eq!(stats.item_count, 0);
    }
}
