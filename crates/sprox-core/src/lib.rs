//! sprox core - client-side storage proxies
//!
//! This crate provides the proxy side of the storage layer:
//! - An OR-Set model for collection stores
//! - Versioned synchronization with desync detection and resync
//! - Collection, variable and big-collection proxies
//! - A scheduler delivering observer notifications off the caller's stack

pub mod error;
pub mod factory;
pub mod observer;
pub mod orset;
pub mod port;
pub mod proxy;
pub mod scheduler;
pub mod types;

pub use error::{Error, Result};
pub use factory::{AnyProxy, FactoryStats, ProxyFactory};
pub use observer::{ChannelObserver, Delta, HandleOptions, Notification, ObserverError, ProxyObserver, Snapshot};
pub use orset::OrSet;
pub use port::{
    ExceptionReporter, PortReporter, Push, PushRouter, ProxyPort, Request, Response, SystemException,
};
pub use proxy::{BigCollectionProxy, CollectionProxy, NoOpProxy, StorageProxy, VariableProxy};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use types::*;
