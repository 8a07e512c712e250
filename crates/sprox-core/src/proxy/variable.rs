//! Last-writer-wins variable proxy
//!
//! Local writes are applied immediately and tagged with a fresh barrier when a
//! listener is attached. Until the store echoes the write carrying that same
//! barrier, incoming writes from others are folded for version bookkeeping only,
//! and full models are refused, so the local value is not rolled back to one the
//! store has already superseded.

use super::{unexpected, ProxyInner, StorageProxy, SyncCore, Variant};
use crate::error::Result;
use crate::observer::{Delta, Notification, Snapshot};
use crate::port::{Request, Response};
use crate::types::{Barrier, Change, ConsumerId, Entity, StoreKind, SyncModel, SyncState, UpdateEvent};
use tracing::debug;

pub type VariableProxy = StorageProxy<VariableModel>;

/// Local replica of a variable store
#[derive(Debug, Default)]
pub struct VariableModel {
    model: Option<Entity>,
}

impl Variant for VariableModel {
    const KIND: StoreKind = StoreKind::Variable;

    fn snapshot(&self) -> Snapshot {
        Snapshot::Variable(self.model.clone())
    }

    fn synchronize(&mut self, core: &mut SyncCore, model: SyncModel) -> Result<bool> {
        if core.barrier.is_some() {
            debug!(proxy = %core.store.id, "Write in flight, refusing full model");
            return Ok(false);
        }

        self.model = match model {
            SyncModel::Value(value) => value,
            SyncModel::Entries(entries) => entries.into_iter().next().map(|e| e.value),
        };
        Ok(true)
    }

    fn fold(
        &mut self,
        core: &mut SyncCore,
        update: &UpdateEvent,
        apply: bool,
    ) -> Result<Option<Delta>> {
        let Change::Write { data } = &update.change else {
            return Err(core.malformed(update, "variables accept only writes"));
        };

        let delta = Delta::Variable {
            originator_id: update.originator_id.clone(),
            data: data.clone(),
        };

        if !apply {
            return Ok(Some(delta));
        }

        if core.barrier.is_some() {
            if update.barrier == core.barrier {
                core.barrier = None;
                // The echo of our own write may be what brings us up to date
                if core.state != SyncState::Full {
                    core.state = SyncState::Full;
                    core.notify(
                        Notification::Sync(self.snapshot()),
                        |o| o.keep_synced && o.notify_sync,
                    );
                }
            }
            return Ok(None);
        }

        self.model = data.clone();
        Ok(Some(delta))
    }
}

impl StorageProxy<VariableModel> {
    fn local_value(&self) -> Option<Option<Entity>> {
        let inner = self.inner.lock();
        (inner.core.state == SyncState::Full).then(|| inner.variant.model.clone())
    }

    /// The current value, answered locally once synchronized
    pub async fn get(&self, consumer: &ConsumerId) -> Result<Option<Entity>> {
        if let Some(value) = self.local_value() {
            return Ok(value);
        }

        let request = Request::Get {
            store: self.store.clone(),
            consumer: consumer.clone(),
        };
        match self.port.call(request).await? {
            Response::Value(value) => Ok(value),
            other => Err(unexpected("Get", other)),
        }
    }

    /// Overwrite the value. Writing the value already held is a no-op.
    pub fn set(&self, value: Entity, consumer: &ConsumerId) -> Result<()> {
        let mut inner = self.inner.lock();
        let ProxyInner { core, variant } = &mut *inner;

        if variant.model.as_ref() == Some(&value) {
            return Ok(());
        }

        let barrier = core.listener_attached.then(|| Barrier::mint(&core.store.id));
        variant.model = Some(value.clone());
        core.barrier = barrier.clone();

        core.port.send(Request::Set {
            store: core.store.clone(),
            data: value.clone(),
            consumer: consumer.clone(),
            barrier,
        });

        core.notify(
            Notification::Update(Delta::Variable {
                originator_id: Some(consumer.clone()),
                data: Some(value),
            }),
            |o| o.notify_update,
        );
        Ok(())
    }

    /// Reset the value to empty
    pub fn clear(&self, consumer: &ConsumerId) -> Result<()> {
        let mut inner = self.inner.lock();
        let ProxyInner { core, variant } = &mut *inner;

        if core.state == SyncState::Full && variant.model.is_none() {
            return Ok(());
        }

        let barrier = core.listener_attached.then(|| Barrier::mint(&core.store.id));
        variant.model = None;
        core.barrier = barrier.clone();

        core.port.send(Request::Clear {
            store: core.store.clone(),
            consumer: consumer.clone(),
            barrier,
        });

        core.notify(
            Notification::Update(Delta::Variable {
                originator_id: Some(consumer.clone()),
                data: None,
            }),
            |o| o.notify_update,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{drain, harness, observe};
    use super::*;
    use crate::error::Error;
    use crate::observer::HandleOptions;
    use serde_json::json;

    fn write(version: u64, data: Option<Entity>, barrier: Option<&Barrier>) -> UpdateEvent {
        UpdateEvent {
            version,
            originator_id: None,
            barrier: barrier.cloned(),
            change: Change::Write { data },
        }
    }

    fn last_barrier(port: &crate::port::testing::RecordingPort) -> Option<Barrier> {
        port.sent().into_iter().rev().find_map(|r| match r {
            Request::Set { barrier, .. } | Request::Clear { barrier, .. } => barrier,
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_set_applies_locally_and_mints_barrier() {
        let (proxy, port, scheduler) = harness::<VariableModel>("arc:var");
        let (_o, mut inbox) = observe(&*proxy, "p1", HandleOptions::default());
        proxy.on_full_sync(1, SyncModel::Value(None)).unwrap();

        let p1 = ConsumerId::from("p1");
        proxy.set(json!({"id": "e1"}), &p1).unwrap();
        assert_eq!(proxy.snapshot(), Snapshot::Variable(Some(json!({"id": "e1"}))));
        assert!(last_barrier(&port).is_some());

        // same value again does nothing
        proxy.set(json!({"id": "e1"}), &p1).unwrap();
        assert_eq!(port.count("Set"), 1);

        scheduler.idle().await;
        let kinds: Vec<_> = drain(&mut inbox).iter().map(|n| n.kind()).collect();
        assert_eq!(kinds, vec!["sync", "update"]);
    }

    #[tokio::test]
    async fn test_no_barrier_without_listener() {
        let (proxy, port, _) = harness::<VariableModel>("arc:var");
        proxy.set(json!({"id": "e1"}), &ConsumerId::from("p1")).unwrap();
        assert_eq!(port.count("Set"), 1);
        assert!(last_barrier(&port).is_none());
    }

    #[tokio::test]
    async fn test_echo_of_superseded_write_is_suppressed() {
        let (proxy, port, scheduler) = harness::<VariableModel>("arc:var");
        let (_o, mut inbox) = observe(&*proxy, "p1", HandleOptions::default());
        proxy.on_full_sync(1, SyncModel::Value(None)).unwrap();
        let p1 = ConsumerId::from("p1");

        proxy.set(json!({"id": "e1"}), &p1).unwrap();
        let b1 = last_barrier(&port).unwrap();
        proxy.set(json!({"id": "e2"}), &p1).unwrap();
        let b2 = last_barrier(&port).unwrap();
        assert_ne!(b1, b2);

        proxy.on_update(write(2, Some(json!({"id": "e1"})), Some(&b1))).unwrap();
        assert_eq!(proxy.snapshot(), Snapshot::Variable(Some(json!({"id": "e2"}))));
        assert_eq!(proxy.version(), Some(2));

        // another writer's value is ignored while our write is in flight
        proxy.on_update(write(3, Some(json!({"id": "other"})), None)).unwrap();
        assert_eq!(proxy.snapshot(), Snapshot::Variable(Some(json!({"id": "e2"}))));

        proxy.on_update(write(4, Some(json!({"id": "e2"})), Some(&b2))).unwrap();
        assert_eq!(proxy.version(), Some(4));

        // barrier cleared: later writes land
        proxy.on_update(write(5, Some(json!({"id": "e3"})), None)).unwrap();
        assert_eq!(proxy.snapshot(), Snapshot::Variable(Some(json!({"id": "e3"}))));

        // neither echo nor the write that raced them produced a notification
        scheduler.idle().await;
        assert_eq!(
            drain(&mut inbox),
            vec![
                Notification::Sync(Snapshot::Variable(None)),
                Notification::Update(Delta::Variable {
                    originator_id: Some(p1.clone()),
                    data: Some(json!({"id": "e1"})),
                }),
                Notification::Update(Delta::Variable {
                    originator_id: Some(p1.clone()),
                    data: Some(json!({"id": "e2"})),
                }),
                Notification::Update(Delta::Variable {
                    originator_id: None,
                    data: Some(json!({"id": "e3"})),
                }),
            ]
        );
    }

    #[tokio::test]
    async fn test_write_and_its_echo_notify_once() {
        let (proxy, port, scheduler) = harness::<VariableModel>("arc:var");
        let (_o, mut inbox) = observe(&*proxy, "p1", HandleOptions::default());
        proxy.on_full_sync(1, SyncModel::Value(None)).unwrap();
        scheduler.idle().await;
        drain(&mut inbox);

        let p1 = ConsumerId::from("p1");
        proxy.set(json!({"num": 3}), &p1).unwrap();
        let barrier = last_barrier(&port).unwrap();
        proxy.on_update(write(2, Some(json!({"num": 3})), Some(&barrier))).unwrap();
        assert_eq!(proxy.version(), Some(2));

        scheduler.idle().await;
        assert_eq!(
            drain(&mut inbox),
            vec![Notification::Update(Delta::Variable {
                originator_id: Some(p1),
                data: Some(json!({"num": 3})),
            })]
        );
    }

    #[tokio::test]
    async fn test_matching_barrier_is_next_regardless_of_version() {
        let (proxy, port, scheduler) = harness::<VariableModel>("arc:var");
        let (_o, mut inbox) = observe(&*proxy, "p1", HandleOptions::default());
        let p1 = ConsumerId::from("p1");

        // still pending: the full model is refused while the write is in flight
        proxy.set(json!({"id": "mine"}), &p1).unwrap();
        let barrier = last_barrier(&port).unwrap();
        proxy.on_full_sync(3, SyncModel::Value(Some(json!({"id": "old"})))).unwrap();
        assert_eq!(proxy.sync_state(), SyncState::Pending);
        assert_eq!(proxy.version(), None);

        proxy.on_update(write(7, Some(json!({"id": "mine"})), Some(&barrier))).unwrap();
        assert_eq!(proxy.sync_state(), SyncState::Full);
        assert_eq!(proxy.version(), Some(7));
        assert_eq!(proxy.snapshot(), Snapshot::Variable(Some(json!({"id": "mine"}))));

        scheduler.idle().await;
        let notifications = drain(&mut inbox);
        assert_eq!(
            notifications.last(),
            Some(&Notification::Sync(Snapshot::Variable(Some(json!({"id": "mine"})))))
        );
    }

    #[tokio::test]
    async fn test_queued_echo_skips_older_writes() {
        let (proxy, port, _) = harness::<VariableModel>("arc:var");
        let (_o, _) = observe(&*proxy, "p1", HandleOptions::default());

        proxy.set(json!({"id": "mine"}), &ConsumerId::from("p1")).unwrap();
        let barrier = last_barrier(&port).unwrap();

        // no version yet, so the older write can never become next on its own
        proxy.on_update(write(4, Some(json!({"id": "theirs"})), None)).unwrap();
        assert_eq!(proxy.queued_updates(), 1);

        proxy.on_update(write(5, Some(json!({"id": "mine"})), Some(&barrier))).unwrap();
        assert_eq!(proxy.queued_updates(), 0);
        assert_eq!(proxy.sync_state(), SyncState::Full);
        assert_eq!(proxy.version(), Some(5));

        proxy.on_update(write(6, Some(json!({"id": "next"})), None)).unwrap();
        assert_eq!(proxy.snapshot(), Snapshot::Variable(Some(json!({"id": "next"}))));
    }

    #[tokio::test]
    async fn test_clear_short_circuits_when_empty() {
        let (proxy, port, _) = harness::<VariableModel>("arc:var");
        let (_o, _) = observe(&*proxy, "p1", HandleOptions::default());
        let p1 = ConsumerId::from("p1");

        // not yet full: forwarded even though the local value is empty
        proxy.clear(&p1).unwrap();
        assert_eq!(port.count("Clear"), 1);

        proxy.on_update(write(1, None, last_barrier(&port).as_ref())).unwrap();
        assert_eq!(proxy.sync_state(), SyncState::Full);

        proxy.clear(&p1).unwrap();
        assert_eq!(port.count("Clear"), 1);
    }

    #[tokio::test]
    async fn test_get_round_trips_until_full() {
        let (proxy, port, _) = harness::<VariableModel>("arc:var");
        let p1 = ConsumerId::from("p1");

        port.reply(Response::Value(Some(json!({"id": "remote"}))));
        assert_eq!(proxy.get(&p1).await.unwrap(), Some(json!({"id": "remote"})));
        assert!(matches!(proxy.get(&p1).await, Err(Error::Disconnected)));

        let (_o, _) = observe(&*proxy, "p1", HandleOptions::default());
        proxy.on_full_sync(2, SyncModel::Value(Some(json!({"id": "local"})))).unwrap();
        assert_eq!(proxy.get(&p1).await.unwrap(), Some(json!({"id": "local"})));
        assert_eq!(port.count("Get"), 2);
    }

    #[tokio::test]
    async fn test_unsynced_observer_sees_every_write() {
        let (proxy, _, scheduler) = harness::<VariableModel>("arc:var");
        let (_o, mut inbox) = observe(&*proxy, "p1", HandleOptions::updates_only());

        proxy.on_update(write(1, Some(json!({"id": "a"})), None)).unwrap();
        proxy.on_update(write(2, None, None)).unwrap();

        scheduler.idle().await;
        let notifications = drain(&mut inbox);
        assert_eq!(
            notifications,
            vec![
                Notification::Update(Delta::Variable { originator_id: None, data: Some(json!({"id": "a"})) }),
                Notification::Update(Delta::Variable { originator_id: None, data: None }),
            ]
        );
    }
}
