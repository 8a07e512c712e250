//! Proxy factory - owns the proxies of one context and routes pushed messages to them

use crate::error::{Error, Result};
use crate::observer::{ProxyObserver, Snapshot};
use crate::port::{Push, PushRouter, ProxyPort};
use crate::proxy::{BigCollectionProxy, CollectionProxy, NoOpProxy, VariableProxy};
use crate::scheduler::Scheduler;
use crate::types::{ConsumerId, ProxyId, StoreKind, SyncModel, SyncState, UpdateEvent, Version};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A proxy of any kind
#[derive(Clone)]
pub enum AnyProxy {
    Collection(Arc<CollectionProxy>),
    Variable(Arc<VariableProxy>),
    BigCollection(Arc<BigCollectionProxy>),
}

macro_rules! dispatch {
    ($self:expr, $proxy:ident => $body:expr) => {
        match $self {
            AnyProxy::Collection($proxy) => $body,
            AnyProxy::Variable($proxy) => $body,
            AnyProxy::BigCollection($proxy) => $body,
        }
    };
}

impl AnyProxy {
    fn create(id: ProxyId, kind: StoreKind, port: Arc<dyn ProxyPort>, scheduler: Scheduler) -> Self {
        match kind {
            StoreKind::Collection => {
                AnyProxy::Collection(Arc::new(CollectionProxy::new(id, port, scheduler)))
            }
            StoreKind::Variable => {
                AnyProxy::Variable(Arc::new(VariableProxy::new(id, port, scheduler)))
            }
            StoreKind::BigCollection => {
                AnyProxy::BigCollection(Arc::new(BigCollectionProxy::new(id, port, scheduler)))
            }
        }
    }

    pub fn id(&self) -> &ProxyId {
        dispatch!(self, p => p.id())
    }

    pub fn kind(&self) -> StoreKind {
        dispatch!(self, p => p.kind())
    }

    pub fn version(&self) -> Option<Version> {
        dispatch!(self, p => p.version())
    }

    pub fn sync_state(&self) -> SyncState {
        dispatch!(self, p => p.sync_state())
    }

    pub fn snapshot(&self) -> Snapshot {
        dispatch!(self, p => p.snapshot())
    }

    pub fn register(&self, consumer: ConsumerId, observer: Arc<dyn ProxyObserver>) {
        dispatch!(self, p => p.register(consumer, observer))
    }

    pub fn deregister(&self, consumer: &ConsumerId, observer: &Arc<dyn ProxyObserver>) {
        dispatch!(self, p => p.deregister(consumer, observer))
    }

    pub fn on_full_sync(&self, version: Version, model: SyncModel) -> Result<()> {
        dispatch!(self, p => p.on_full_sync(version, model))
    }

    pub fn on_update(&self, update: UpdateEvent) -> Result<()> {
        dispatch!(self, p => p.on_update(update))
    }
}

/// Factory statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactoryStats {
    pub collections: usize,
    pub variables: usize,
    pub big_collections: usize,
    pub pending_notifications: usize,
}

/// Creates proxies on demand and keeps them addressable by id
pub struct ProxyFactory {
    port: Arc<dyn ProxyPort>,
    scheduler: Scheduler,
    proxies: DashMap<ProxyId, AnyProxy>,
}

impl ProxyFactory {
    pub fn new(port: Arc<dyn ProxyPort>, scheduler: Scheduler) -> Self {
        Self {
            port,
            scheduler,
            proxies: DashMap::new(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Get the proxy for `id`, creating it on first use
    pub fn get_or_create(&self, id: ProxyId, kind: StoreKind) -> Result<AnyProxy> {
        match self.proxies.entry(id.clone()) {
            Entry::Occupied(entry) => {
                let existing = entry.get().kind();
                if existing != kind {
                    return Err(Error::KindMismatch {
                        id: id.to_string(),
                        existing,
                        requested: kind,
                    });
                }
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                let proxy = AnyProxy::create(id.clone(), kind, self.port.clone(), self.scheduler.clone());
                entry.insert(proxy.clone());
                info!(proxy = %id, %kind, "Created storage proxy");
                Ok(proxy)
            }
        }
    }

    pub fn collection(&self, id: ProxyId) -> Result<Arc<CollectionProxy>> {
        match self.get_or_create(id, StoreKind::Collection)? {
            AnyProxy::Collection(proxy) => Ok(proxy),
            other => Err(mismatch(&other, StoreKind::Collection)),
        }
    }

    pub fn variable(&self, id: ProxyId) -> Result<Arc<VariableProxy>> {
        match self.get_or_create(id, StoreKind::Variable)? {
            AnyProxy::Variable(proxy) => Ok(proxy),
            other => Err(mismatch(&other, StoreKind::Variable)),
        }
    }

    pub fn big_collection(&self, id: ProxyId) -> Result<Arc<BigCollectionProxy>> {
        match self.get_or_create(id, StoreKind::BigCollection)? {
            AnyProxy::BigCollection(proxy) => Ok(proxy),
            other => Err(mismatch(&other, StoreKind::BigCollection)),
        }
    }

    /// A proxy for a disabled consumer. It is not tracked, so pushes for `id`
    /// still go to the live proxy, if any.
    pub fn no_op(&self, id: ProxyId, kind: StoreKind) -> Arc<NoOpProxy> {
        debug!(proxy = %id, %kind, "Handing out no-op proxy");
        Arc::new(NoOpProxy::new(id, kind))
    }

    pub fn get(&self, id: &ProxyId) -> Option<AnyProxy> {
        self.proxies.get(id).map(|r| r.value().clone())
    }

    /// Drop a proxy. Pushes for it are rejected from then on.
    pub fn remove(&self, id: &ProxyId) -> Option<AnyProxy> {
        self.proxies.remove(id).map(|(_, proxy)| proxy)
    }

    /// Ids of every proxy, optionally filtered by a `prefix*`, `*suffix` or exact pattern
    pub fn list(&self, pattern: Option<&str>) -> Vec<ProxyId> {
        let mut ids: Vec<ProxyId> = self
            .proxies
            .iter()
            .filter(|entry| pattern.map_or(true, |p| Self::matches_pattern(entry.key().as_str(), p)))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn stats(&self) -> FactoryStats {
        let mut stats = FactoryStats {
            pending_notifications: self.scheduler.outstanding(),
            ..FactoryStats::default()
        };
        for entry in self.proxies.iter() {
            match entry.value() {
                AnyProxy::Collection(_) => stats.collections += 1,
                AnyProxy::Variable(_) => stats.variables += 1,
                AnyProxy::BigCollection(_) => stats.big_collections += 1,
            }
        }
        stats
    }

    fn matches_pattern(key: &str, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }

        if let Some(prefix) = pattern.strip_suffix('*') {
            return key.starts_with(prefix);
        }

        if let Some(suffix) = pattern.strip_prefix('*') {
            return key.ends_with(suffix);
        }

        key == pattern
    }
}

impl PushRouter for ProxyFactory {
    fn route(&self, push: Push) -> Result<()> {
        // Clone out of the map so no shard lock is held while the proxy runs
        let proxy = self
            .get(push.proxy())
            .ok_or_else(|| Error::UnknownProxy(push.proxy().to_string()))?;

        match push {
            Push::Update { event, .. } => {
                debug!(proxy = %proxy.id(), version = event.version, "Routing update");
                proxy.on_update(event)
            }
            Push::FullSync { version, model, .. } => {
                debug!(proxy = %proxy.id(), version, "Routing full model");
                proxy.on_full_sync(version, model)
            }
        }
    }
}

fn mismatch(existing: &AnyProxy, requested: StoreKind) -> Error {
    Error::KindMismatch {
        id: existing.id().to_string(),
        existing: existing.kind(),
        requested,
    }
}
