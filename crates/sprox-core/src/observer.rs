//! Observers registered against a proxy and the notifications delivered to them

use crate::types::{ConsumerId, Entity};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Error returned by observer callbacks
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Per-handle delivery configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HandleOptions {
    /// Load the full model on registration and keep it up to date
    pub keep_synced: bool,
    /// Deliver `Sync` when the full model arrives (keep-synced handles only)
    pub notify_sync: bool,
    /// Deliver `Update` for every effective change
    pub notify_update: bool,
    /// Deliver `Desync` when a version gap is detected (keep-synced handles only)
    pub notify_desync: bool,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            keep_synced: true,
            notify_sync: true,
            notify_update: true,
            notify_desync: false,
        }
    }
}

impl HandleOptions {
    /// Options for a handle that only wants change notifications
    pub fn updates_only() -> Self {
        Self {
            keep_synced: false,
            notify_sync: false,
            notify_update: true,
            notify_desync: false,
        }
    }
}

/// Full model handed to observers on sync
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Collection(Vec<Entity>),
    Variable(Option<Entity>),
    Empty,
}

/// Change handed to observers on update
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Collection {
        originator_id: Option<ConsumerId>,
        added: Vec<Entity>,
        removed: Vec<Entity>,
    },
    Variable {
        originator_id: Option<ConsumerId>,
        data: Option<Entity>,
    },
}

impl Delta {
    pub fn originator_id(&self) -> Option<&ConsumerId> {
        match self {
            Delta::Collection { originator_id, .. } | Delta::Variable { originator_id, .. } => {
                originator_id.as_ref()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Sync(Snapshot),
    Update(Delta),
    Desync,
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Sync(_) => "sync",
            Notification::Update(_) => "update",
            Notification::Desync => "desync",
        }
    }
}

/// The handle half of a (consumer, handle) registration.
///
/// Observers do not own the proxy; they are only delivered to.
pub trait ProxyObserver: Send + Sync {
    fn options(&self) -> HandleOptions;

    fn can_read(&self) -> bool {
        true
    }

    fn on_notification(
        &self,
        consumer: &ConsumerId,
        notification: Notification,
    ) -> Result<(), ObserverError>;
}

/// Observer that forwards every notification into an unbounded channel
pub struct ChannelObserver {
    options: HandleOptions,
    sender: mpsc::UnboundedSender<(ConsumerId, Notification)>,
}

impl ChannelObserver {
    pub fn new(
        options: HandleOptions,
    ) -> (Self, mpsc::UnboundedReceiver<(ConsumerId, Notification)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { options, sender }, receiver)
    }
}

impl ProxyObserver for ChannelObserver {
    fn options(&self) -> HandleOptions {
        self.options
    }

    fn on_notification(
        &self,
        consumer: &ConsumerId,
        notification: Notification,
    ) -> Result<(), ObserverError> {
        self.sender
            .send((consumer.clone(), notification))
            .map_err(|_| "observer channel closed".into())
    }
}
