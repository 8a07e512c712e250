//! OR-Set collection proxy

use super::{unexpected, ProxyInner, StorageProxy, SyncCore, Variant};
use crate::error::{Error, Result};
use crate::observer::{Delta, Notification, Snapshot};
use crate::orset::OrSet;
use crate::port::{Request, Response};
use crate::types::{
    entity_id, Change, ConsumerId, Entity, EntryChange, RemoveData, StoreData, StoreKind,
    SyncModel, SyncState, UpdateEvent,
};

pub type CollectionProxy = StorageProxy<CollectionModel>;

/// Local replica of a collection store
#[derive(Debug, Default)]
pub struct CollectionModel {
    model: OrSet<Entity>,
}

impl Variant for CollectionModel {
    const KIND: StoreKind = StoreKind::Collection;

    fn snapshot(&self) -> Snapshot {
        Snapshot::Collection(self.model.values())
    }

    fn synchronize(&mut self, core: &mut SyncCore, model: SyncModel) -> Result<bool> {
        match model {
            SyncModel::Entries(entries) => {
                self.model = OrSet::from_entries(entries);
                Ok(true)
            }
            SyncModel::Value(_) => Err(Error::MalformedUpdate {
                proxy: core.store.id.to_string(),
                reason: "full model for a collection carried a single value".into(),
            }),
        }
    }

    fn fold(
        &mut self,
        core: &mut SyncCore,
        update: &UpdateEvent,
        apply: bool,
    ) -> Result<Option<Delta>> {
        // Our own consumers already saw the change when they made it. The
        // echo is still folded: re-applying an add or remove is idempotent, and
        // a write issued before the proxy was full was never applied locally.
        let own_echo = core.state == SyncState::Full
            && update
                .originator_id
                .as_ref()
                .map_or(false, |originator| core.is_observed_by(originator));

        let mut added = Vec::new();
        let mut removed = Vec::new();

        match &update.change {
            Change::Add(entries) => {
                let ids = resolve_ids(core, update, entries, "added entity has no id")?;
                for (id, entry) in ids.into_iter().zip(entries) {
                    let effective = if apply {
                        self.model.add(id, entry.value.clone(), entry.keys.iter().cloned())
                    } else {
                        entry.effective
                    };
                    if effective {
                        added.push(entry.value.clone());
                    }
                }
            }
            Change::Remove(entries) => {
                let ids = resolve_ids(core, update, entries, "removed entity has no id")?;
                for (id, entry) in ids.into_iter().zip(entries) {
                    let local = self.model.get_value(id).cloned();
                    let effective = if apply {
                        self.model.remove(id, &entry.keys)
                    } else {
                        entry.effective
                    };
                    if effective {
                        removed.push(local.unwrap_or_else(|| entry.value.clone()));
                    }
                }
            }
            Change::Write { .. } => {
                return Err(core.malformed(update, "collections accept only add and remove"));
            }
        }

        if own_echo || (added.is_empty() && removed.is_empty()) {
            return Ok(None);
        }

        Ok(Some(Delta::Collection {
            originator_id: update.originator_id.clone(),
            added,
            removed,
        }))
    }
}

/// Every entry's id, resolved before any of them is applied
fn resolve_ids<'a>(
    core: &SyncCore,
    update: &UpdateEvent,
    entries: &'a [EntryChange],
    reason: &str,
) -> Result<Vec<&'a str>> {
    entries
        .iter()
        .map(|entry| entity_id(&entry.value).map_err(|_| core.malformed(update, reason)))
        .collect()
}

impl StorageProxy<CollectionModel> {
    fn local_list(&self) -> Option<Vec<Entity>> {
        let inner = self.inner.lock();
        (inner.core.state == SyncState::Full).then(|| inner.variant.model.values())
    }

    fn local_get(&self, id: &str) -> Option<Option<Entity>> {
        let inner = self.inner.lock();
        (inner.core.state == SyncState::Full).then(|| inner.variant.model.get_value(id).cloned())
    }

    /// Every entity in the collection, answered locally once synchronized
    pub async fn to_list(&self, consumer: &ConsumerId) -> Result<Vec<Entity>> {
        if let Some(values) = self.local_list() {
            return Ok(values);
        }

        let request = Request::ToList {
            store: self.store.clone(),
            consumer: consumer.clone(),
        };
        match self.port.call(request).await? {
            Response::Entries(entries) => Ok(entries.into_iter().map(|e| e.value).collect()),
            other => Err(unexpected("ToList", other)),
        }
    }

    /// Look up one entity by id
    pub async fn get(&self, id: &str, consumer: &ConsumerId) -> Result<Option<Entity>> {
        if let Some(value) = self.local_get(id) {
            return Ok(value);
        }

        let entries = self.to_list(consumer).await?;
        Ok(entries
            .into_iter()
            .find(|e| entity_id(e).map_or(false, |eid| eid == id)))
    }

    /// Add an entity under the given observation keys
    pub fn store(&self, value: Entity, keys: Vec<String>, consumer: &ConsumerId) -> Result<()> {
        let id = entity_id(&value)?.to_string();
        if keys.is_empty() {
            return Err(Error::MissingKeys(id));
        }

        let mut inner = self.inner.lock();
        let ProxyInner { core, variant } = &mut *inner;

        core.port.send(Request::Store {
            store: core.store.clone(),
            data: StoreData {
                value: value.clone(),
                keys: keys.clone(),
            },
            consumer: consumer.clone(),
        });

        if core.state != SyncState::Full || !variant.model.add(&id, value.clone(), keys) {
            return Ok(());
        }

        core.notify(
            Notification::Update(Delta::Collection {
                originator_id: Some(consumer.clone()),
                added: vec![value],
                removed: Vec::new(),
            }),
            |o| o.notify_update,
        );
        Ok(())
    }

    /// Remove an entity. Empty `keys` removes every key currently observed.
    pub fn remove(&self, id: &str, keys: Vec<String>, consumer: &ConsumerId) -> Result<()> {
        let mut inner = self.inner.lock();
        let ProxyInner { core, variant } = &mut *inner;

        if core.state != SyncState::Full {
            // The store resolves the keys itself
            core.port.send(Request::Remove {
                store: core.store.clone(),
                data: RemoveData {
                    id: id.to_string(),
                    keys: Vec::new(),
                },
                consumer: consumer.clone(),
            });
            return Ok(());
        }

        let Some(value) = variant.model.get_value(id).cloned() else {
            return Ok(());
        };

        let keys = if keys.is_empty() {
            variant.model.get_keys(id).into_iter().collect()
        } else {
            keys
        };

        core.port.send(Request::Remove {
            store: core.store.clone(),
            data: RemoveData {
                id: id.to_string(),
                keys: keys.clone(),
            },
            consumer: consumer.clone(),
        });

        if variant.model.remove(id, &keys) {
            core.notify(
                Notification::Update(Delta::Collection {
                    originator_id: Some(consumer.clone()),
                    added: Vec::new(),
                    removed: vec![value],
                }),
                |o| o.notify_update,
            );
        }
        Ok(())
    }

    /// Remove every entity the proxy has observed
    pub fn clear(&self, consumer: &ConsumerId) -> Result<()> {
        let mut inner = self.inner.lock();
        let ProxyInner { core, variant } = &mut *inner;

        if core.state != SyncState::Full {
            core.port.send(Request::RemoveMultiple {
                store: core.store.clone(),
                data: Vec::new(),
                consumer: consumer.clone(),
            });
            return Ok(());
        }

        let items: Vec<RemoveData> = variant
            .model
            .to_list()
            .into_iter()
            .map(|e| RemoveData {
                id: e.id,
                keys: e.keys.into_iter().collect(),
            })
            .collect();

        // An empty list means "everything" to the store, which would take
        // entries this proxy never observed.
        if items.is_empty() {
            return Ok(());
        }

        core.port.send(Request::RemoveMultiple {
            store: core.store.clone(),
            data: items.clone(),
            consumer: consumer.clone(),
        });

        let removed: Vec<Entity> = items
            .iter()
            .filter_map(|item| {
                let value = variant.model.get_value(&item.id).cloned();
                if variant.model.remove(&item.id, &item.keys) {
                    value
                } else {
                    None
                }
            })
            .collect();

        if !removed.is_empty() {
            core.notify(
                Notification::Update(Delta::Collection {
                    originator_id: Some(consumer.clone()),
                    added: Vec::new(),
                    removed,
                }),
                |o| o.notify_update,
            );
        }
        Ok(())
    }
}
