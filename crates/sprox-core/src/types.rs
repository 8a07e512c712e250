//! Identifiers, sync state and the update/entry shapes exchanged with the backing store

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Authoritative version number, owned by the backing store
pub type Version = u64;

/// Entities are opaque JSON objects carrying a string `id` field
pub type Entity = serde_json::Value;

/// Identifier of an open stream cursor on a big collection
pub type CursorId = u64;

/// Extract the `id` field of an entity
pub fn entity_id(value: &Entity) -> Result<&str> {
    value
        .get("id")
        .and_then(|id| id.as_str())
        .ok_or(Error::MissingEntityId)
}

/// Proxy identifier - UTF-8 string, max 512 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProxyId(String);

impl ProxyId {
    /// Create a new proxy ID, validating the format
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::InvalidProxyId("Proxy ID cannot be empty".into()));
        }

        if id.len() > 512 {
            return Err(Error::InvalidProxyId("Proxy ID exceeds 512 bytes".into()));
        }

        // Validate pattern: [a-zA-Z0-9:_.-]+
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.'))
        {
            return Err(Error::InvalidProxyId(
                "Proxy ID must match pattern [a-zA-Z0-9:_.-]+".into(),
            ));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProxyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the consumer (particle) that owns an observer or issued a write
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Token marking an in-flight variable write so its echo can be recognised
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Barrier(String);

impl Barrier {
    /// Mint a fresh barrier scoped to a proxy
    pub fn mint(proxy: &ProxyId) -> Self {
        Self(format!("{}:barrier:{}", proxy, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Barrier {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Shape of the data a proxy mirrors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    /// OR-Set collection, mirrored locally
    Collection,
    /// Single last-writer-wins value, mirrored locally
    Variable,
    /// Collection too large to mirror; every call is a round trip
    BigCollection,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Collection => write!(f, "collection"),
            StoreKind::Variable => write!(f, "variable"),
            StoreKind::BigCollection => write!(f, "big-collection"),
        }
    }
}

impl std::str::FromStr for StoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "collection" | "set" => Ok(StoreKind::Collection),
            "variable" | "singleton" => Ok(StoreKind::Variable),
            "big-collection" | "bigcollection" => Ok(StoreKind::BigCollection),
            _ => Err(Error::InvalidStoreKind(s.to_string())),
        }
    }
}

/// Reference to a backing store as carried on every port request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreRef {
    pub id: ProxyId,
    pub kind: StoreKind,
}

impl StoreRef {
    pub fn new(id: ProxyId, kind: StoreKind) -> Self {
        Self { id, kind }
    }
}

impl std::fmt::Display for StoreRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.id, self.kind)
    }
}

/// How far the local replica has caught up with the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No full-state request is outstanding and the replica is not trusted
    #[default]
    None,
    /// A full-state request is outstanding
    Pending,
    /// The replica is caught up
    Full,
}

/// A present collection member and the observation keys asserting it
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<T = Entity> {
    pub id: String,
    pub value: T,
    pub keys: BTreeSet<String>,
}

/// Wire form of a collection entry, used for full-state transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedEntry {
    pub id: String,
    pub value: Entity,
    #[serde(default)]
    pub keys: Vec<String>,
}

impl<T: Into<Entity>> From<Entry<T>> for SerializedEntry {
    fn from(entry: Entry<T>) -> Self {
        Self {
            id: entry.id,
            value: entry.value.into(),
            keys: entry.keys.into_iter().collect(),
        }
    }
}

/// One element of a collection add/remove event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryChange {
    pub value: Entity,
    pub keys: Vec<String>,
    /// Whether the sender's own apply changed presence
    #[serde(default)]
    pub effective: bool,
}

/// The payload of an update event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    Add(Vec<EntryChange>),
    Remove(Vec<EntryChange>),
    Write { data: Option<Entity> },
}

impl Change {
    pub fn name(&self) -> &'static str {
        match self {
            Change::Add(_) => "add",
            Change::Remove(_) => "remove",
            Change::Write { .. } => "write",
        }
    }
}

/// A versioned change pushed by the backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEvent {
    pub version: Version,
    #[serde(default)]
    pub originator_id: Option<ConsumerId>,
    #[serde(default)]
    pub barrier: Option<Barrier>,
    pub change: Change,
}

/// Full model returned by a full-state request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncModel {
    Entries(Vec<SerializedEntry>),
    Value(Option<Entity>),
}

/// Payload of a collection store request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreData {
    pub value: Entity,
    pub keys: Vec<String>,
}

/// Payload of a collection remove request; empty keys means "every key the store knows"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveData {
    pub id: String,
    #[serde(default)]
    pub keys: Vec<String>,
}

/// One page read from a big-collection cursor
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CursorPage {
    pub done: bool,
    #[serde(default)]
    pub value: Vec<Entity>,
}
