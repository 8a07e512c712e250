//! Storage proxies
//!
//! A proxy mediates between one or more observers and the backing store. It
//! runs in one of two modes depending on how its observers are configured:
//!
//! - synchronized: the proxy keeps a full replica of the store, kept current
//!   by the store's pushed update events;
//! - unsynchronized: calls are passed through to the store.
//!
//! Disabled consumers get a [`NoOpProxy`] instead, which drops everything.
//!
//! In synchronized mode updates are queued sorted by version and folded in
//! strictly in order. While each update is exactly one version ahead of the
//! replica it is applied immediately. An update from the future means an event
//! was lost: the proxy flips to [`SyncState::None`], asks for the full model and
//! keeps queueing. Queued updates that become contiguous are still applied (the
//! proxy may catch up before the full model arrives); once the full model does
//! arrive, queued updates it already covers are dropped and the rest applied.

mod big_collection;
mod collection;
mod no_op;
mod variable;

pub use big_collection::{BigCollectionModel, BigCollectionProxy};
pub use collection::{CollectionModel, CollectionProxy};
pub use no_op::NoOpProxy;
pub use variable::{VariableModel, VariableProxy};

use crate::error::{Error, Result};
use crate::observer::{Delta, HandleOptions, Notification, ProxyObserver, Snapshot};
use crate::port::{ProxyPort, Request, Response, SystemException};
use crate::scheduler::Scheduler;
use crate::types::{
    Barrier, ConsumerId, ProxyId, StoreKind, StoreRef, SyncModel, SyncState, UpdateEvent, Version,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Data-shape specific half of a proxy
pub trait Variant: Default + Send + 'static {
    const KIND: StoreKind;

    /// Whether the proxy mirrors the store's contents locally
    const MIRRORED: bool = true;

    /// The model handed to observers on sync
    fn snapshot(&self) -> Snapshot;

    /// Replace local state with a full model. Returning false leaves the
    /// proxy's version and state untouched.
    fn synchronize(&mut self, core: &mut SyncCore, model: SyncModel) -> Result<bool>;

    /// Fold one update into local state (`apply`) or only compute the delta
    /// it represents (`!apply`, for observers that are not kept in sync).
    fn fold(
        &mut self,
        core: &mut SyncCore,
        update: &UpdateEvent,
        apply: bool,
    ) -> Result<Option<Delta>>;
}

struct Registration {
    consumer: ConsumerId,
    observer: Arc<dyn ProxyObserver>,
}

/// Version tracking, update queue and observer registry shared by all variants
pub struct SyncCore {
    store: StoreRef,
    port: Arc<dyn ProxyPort>,
    scheduler: Scheduler,
    version: Option<Version>,
    state: SyncState,
    updates: Vec<UpdateEvent>,
    observers: Vec<Registration>,
    listener_attached: bool,
    keep_synced: bool,
    barrier: Option<Barrier>,
}

impl SyncCore {
    fn new(store: StoreRef, port: Arc<dyn ProxyPort>, scheduler: Scheduler) -> Self {
        Self {
            store,
            port,
            scheduler,
            version: None,
            state: SyncState::None,
            updates: Vec::new(),
            observers: Vec::new(),
            listener_attached: false,
            keep_synced: false,
            barrier: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Queue `notification` for every observer whose options match
    fn notify(&self, notification: Notification, predicate: impl Fn(&HandleOptions) -> bool) {
        for registration in &self.observers {
            if predicate(&registration.observer.options()) {
                self.scheduler.enqueue(
                    &registration.consumer,
                    &registration.observer,
                    notification.clone(),
                );
            }
        }
    }

    fn is_observed_by(&self, consumer: &ConsumerId) -> bool {
        self.observers.iter().any(|r| &r.consumer == consumer)
    }

    fn is_next(&self, update: &UpdateEvent) -> bool {
        if self.version.map_or(false, |v| update.version == v + 1) {
            return true;
        }
        // A variable waiting on a barriered write treats the echo of that
        // write as next regardless of version.
        matches!((&self.barrier, &update.barrier), (Some(ours), Some(theirs)) if ours == theirs)
    }

    fn request_full_sync(&self) {
        self.port.send(Request::RequestFullSync {
            store: self.store.clone(),
        });
    }

    /// Drop back to [`SyncState::None`], ask for the full model and tell
    /// observers that want to know
    fn desync(&mut self) {
        self.state = SyncState::None;
        self.request_full_sync();
        self.notify(Notification::Desync, |o| o.notify_desync);
    }

    fn malformed(&self, update: &UpdateEvent, reason: &str) -> Error {
        Error::MalformedUpdate {
            proxy: self.store.id.to_string(),
            reason: format!("{} (version {}, {})", reason, update.version, update.change.name()),
        }
    }

    /// Report and build the error for a call that can never be valid here
    fn programming_error(&self, operation: &'static str) -> Error {
        let error = Error::Unsupported {
            operation,
            kind: self.store.kind,
        };
        self.port.report_exception(SystemException::new(
            error.to_string(),
            format!("StorageProxy::{}", operation),
            None,
        ));
        error
    }
}

struct ProxyInner<V> {
    core: SyncCore,
    variant: V,
}

impl<V: Variant> ProxyInner<V> {
    /// Fold every queued update that is next in line, then detect gaps
    fn process_updates(&mut self) -> Result<()> {
        let ProxyInner { core, variant } = self;

        // The echo of our own barriered write supersedes every write queued ahead of it
        let echo_at = core.barrier.as_ref().and_then(|ours| {
            core.updates
                .iter()
                .position(|u| u.barrier.as_ref() == Some(ours))
        });
        if let Some(at) = echo_at.filter(|at| *at > 0) {
            debug!(proxy = %core.store.id, skipped = at, "Skipping writes superseded by our own");
            core.updates.drain(..at);
        }

        while core.updates.first().map_or(false, |u| core.is_next(u)) {
            let update = core.updates.remove(0);
            let delta = match variant.fold(core, &update, true) {
                Ok(delta) => delta,
                Err(e) => {
                    // The rejected version leaves a hole only the full model can fill
                    warn!(
                        proxy = %core.store.id,
                        version = update.version,
                        error = %e,
                        "Rejected update, resynchronizing"
                    );
                    if core.state == SyncState::Full {
                        core.desync();
                    }
                    return Err(e);
                }
            };
            core.version = Some(update.version);

            if let Some(delta) = delta {
                core.notify(Notification::Update(delta), |o| o.keep_synced && o.notify_update);
            }
        }

        if !core.updates.is_empty() {
            if core.state == SyncState::Full {
                info!(
                    proxy = %core.store.id,
                    version = ?core.version,
                    next_queued = core.updates[0].version,
                    "Version gap detected, resynchronizing"
                );
                core.desync();
            }
        } else if core.state != SyncState::Full {
            debug!(proxy = %core.store.id, version = ?core.version, "Caught up with backing store");
            core.state = SyncState::Full;
        }

        Ok(())
    }
}

/// A proxy for one backing store, parameterised by its data shape
pub struct StorageProxy<V: Variant> {
    store: StoreRef,
    port: Arc<dyn ProxyPort>,
    inner: Mutex<ProxyInner<V>>,
}

impl<V: Variant> StorageProxy<V> {
    pub fn new(id: ProxyId, port: Arc<dyn ProxyPort>, scheduler: Scheduler) -> Self {
        let store = StoreRef::new(id, V::KIND);
        Self {
            inner: Mutex::new(ProxyInner {
                core: SyncCore::new(store.clone(), port.clone(), scheduler),
                variant: V::default(),
            }),
            store,
            port,
        }
    }

    pub fn id(&self) -> &ProxyId {
        &self.store.id
    }

    pub fn kind(&self) -> StoreKind {
        V::KIND
    }

    pub fn store_ref(&self) -> &StoreRef {
        &self.store
    }

    pub fn version(&self) -> Option<Version> {
        self.inner.lock().core.version
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.lock().core.state
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().core.observers.len()
    }

    /// Updates received but not yet folded in
    pub fn queued_updates(&self) -> usize {
        self.inner.lock().core.updates.len()
    }

    /// The current local model as observers would see it on sync
    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().variant.snapshot()
    }

    /// Associate a (consumer, observer) pair with this proxy.
    ///
    /// The first readable registration attaches the push listener; the first
    /// keep-synced one requests the full model.
    pub fn register(&self, consumer: ConsumerId, observer: Arc<dyn ProxyObserver>) {
        if !observer.can_read() {
            return;
        }

        let mut inner = self.inner.lock();
        let ProxyInner { core, variant } = &mut *inner;

        if !V::MIRRORED {
            core.scheduler
                .enqueue(&consumer, &observer, Notification::Sync(Snapshot::Empty));
            return;
        }

        let options = observer.options();
        core.observers.push(Registration {
            consumer: consumer.clone(),
            observer: observer.clone(),
        });

        if !core.listener_attached {
            core.port.send(Request::AttachListener {
                store: core.store.clone(),
            });
            core.listener_attached = true;
        }

        if options.keep_synced {
            if !core.keep_synced {
                core.keep_synced = true;
                if core.state == SyncState::None {
                    core.state = SyncState::Pending;
                }
                core.request_full_sync();
            }

            if options.notify_sync && core.state == SyncState::Full {
                core.scheduler
                    .enqueue(&consumer, &observer, Notification::Sync(variant.snapshot()));
            }
        }

        debug!(proxy = %self.store.id, consumer = %consumer, ?options, "Observer registered");
    }

    /// Dissociate a (consumer, observer) pair
    pub fn deregister(&self, consumer: &ConsumerId, observer: &Arc<dyn ProxyObserver>) {
        let target = Arc::as_ptr(observer) as *const ();
        self.inner.lock().core.observers.retain(|r| {
            &r.consumer != consumer || !std::ptr::eq(Arc::as_ptr(&r.observer) as *const (), target)
        });
    }

    /// Replace local state with the full model sent by the backing store
    pub fn on_full_sync(&self, version: Version, model: SyncModel) -> Result<()> {
        let mut inner = self.inner.lock();

        if !V::MIRRORED {
            return Err(inner.core.programming_error("on_full_sync"));
        }

        if let Some(current) = inner.core.version {
            if version <= current {
                warn!(
                    proxy = %self.store.id,
                    version,
                    current,
                    "Received stale model version"
                );
                return Ok(());
            }
        }

        let ProxyInner { core, variant } = &mut *inner;
        if !variant.synchronize(core, model)? {
            debug!(proxy = %self.store.id, version, "Full model not applied");
            return Ok(());
        }

        core.version = Some(version);
        core.state = SyncState::Full;
        // Drop queued updates the full model already covers
        core.updates.retain(|u| u.version > version);

        core.notify(
            Notification::Sync(variant.snapshot()),
            |o| o.keep_synced && o.notify_sync,
        );
        inner.process_updates()
    }

    /// Handle an update event pushed by the backing store
    pub fn on_update(&self, update: UpdateEvent) -> Result<()> {
        let mut inner = self.inner.lock();

        if !V::MIRRORED {
            return Err(inner.core.programming_error("on_update"));
        }

        let ProxyInner { core, variant } = &mut *inner;

        // Observers that are not kept in sync hear about every update as it arrives
        let passthrough = |o: &HandleOptions| !o.keep_synced && o.notify_update;
        if core.observers.iter().any(|r| passthrough(&r.observer.options())) {
            if let Some(delta) = variant.fold(core, &update, false)? {
                core.notify(Notification::Update(delta), passthrough);
            }
        }

        if !core.keep_synced {
            return Ok(());
        }

        if let Some(current) = core.version {
            if update.version <= current {
                warn!(
                    proxy = %self.store.id,
                    version = update.version,
                    current,
                    "Received stale update version"
                );
                return Ok(());
            }
        }

        let at = core.updates.partition_point(|u| u.version < update.version);
        if core.updates.get(at).map_or(false, |u| u.version == update.version) {
            warn!(proxy = %self.store.id, version = update.version, "Dropping duplicate update");
            return Ok(());
        }
        core.updates.insert(at, update);

        inner.process_updates()
    }
}

fn unexpected(request: &'static str, response: Response) -> Error {
    Error::UnexpectedResponse {
        request,
        response: response.name().to_string(),
    }
}
