//! The port a proxy uses to reach its backing store
//!
//! Requests are either fire-and-forget (`send`) or round trips (`call`). The
//! store talks back through [`Push`] messages, which the transport routes to the
//! owning proxy through a [`PushRouter`].

use crate::error::Result;
use crate::types::{
    Barrier, ConsumerId, CursorId, CursorPage, Entity, ProxyId, RemoveData, SerializedEntry,
    StoreData, StoreRef, SyncModel, UpdateEvent, Version,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Requests a proxy issues to its backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    /// Subscribe to pushed update events for a store
    AttachListener { store: StoreRef },
    /// Ask for a `Push::FullSync` carrying the whole model
    RequestFullSync { store: StoreRef },
    Get { store: StoreRef, consumer: ConsumerId },
    ToList { store: StoreRef, consumer: ConsumerId },
    Store { store: StoreRef, data: StoreData, consumer: ConsumerId },
    Remove { store: StoreRef, data: RemoveData, consumer: ConsumerId },
    RemoveMultiple { store: StoreRef, data: Vec<RemoveData>, consumer: ConsumerId },
    Clear { store: StoreRef, consumer: ConsumerId, barrier: Option<Barrier> },
    Set { store: StoreRef, data: Entity, consumer: ConsumerId, barrier: Option<Barrier> },
    Stream { store: StoreRef, page_size: usize, forward: bool },
    CursorNext { store: StoreRef, cursor: CursorId },
    CursorClose { store: StoreRef, cursor: CursorId },
    ReportException(SystemException),
}

impl Request {
    /// Short name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Request::AttachListener { .. } => "AttachListener",
            Request::RequestFullSync { .. } => "RequestFullSync",
            Request::Get { .. } => "Get",
            Request::ToList { .. } => "ToList",
            Request::Store { .. } => "Store",
            Request::Remove { .. } => "Remove",
            Request::RemoveMultiple { .. } => "RemoveMultiple",
            Request::Clear { .. } => "Clear",
            Request::Set { .. } => "Set",
            Request::Stream { .. } => "Stream",
            Request::CursorNext { .. } => "CursorNext",
            Request::CursorClose { .. } => "CursorClose",
            Request::ReportException(_) => "ReportException",
        }
    }
}

/// Payload answering a round-trip request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
pub enum Response {
    Ack,
    Value(Option<Entity>),
    Entries(Vec<SerializedEntry>),
    Cursor(CursorId),
    Page(CursorPage),
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Ack => "Ack",
            Response::Value(_) => "Value",
            Response::Entries(_) => "Entries",
            Response::Cursor(_) => "Cursor",
            Response::Page(_) => "Page",
        }
    }
}

/// Messages the backing store pushes without being asked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Push {
    Update { proxy: ProxyId, event: UpdateEvent },
    FullSync { proxy: ProxyId, version: Version, model: SyncModel },
}

impl Push {
    pub fn proxy(&self) -> &ProxyId {
        match self {
            Push::Update { proxy, .. } | Push::FullSync { proxy, .. } => proxy,
        }
    }
}

/// An error raised in consumer code or by a programming-error assertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemException {
    pub message: String,
    pub method: String,
    pub consumer: Option<ConsumerId>,
}

impl SystemException {
    pub fn new(
        message: impl Into<String>,
        method: impl Into<String>,
        consumer: Option<ConsumerId>,
    ) -> Self {
        Self {
            message: message.into(),
            method: method.into(),
            consumer,
        }
    }
}

impl std::fmt::Display for SystemException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.consumer {
            Some(consumer) => write!(f, "{} in {} ({})", self.message, self.method, consumer),
            None => write!(f, "{} in {}", self.message, self.method),
        }
    }
}

/// Sink for exceptions that must be surfaced to the host
pub trait ExceptionReporter: Send + Sync {
    fn report_exception(&self, exception: SystemException);
}

/// Transport-agnostic connection to the backing store
#[async_trait]
pub trait ProxyPort: Send + Sync {
    /// Queue a request without waiting for an answer
    fn send(&self, request: Request);

    /// Issue a request and wait for its response
    async fn call(&self, request: Request) -> Result<Response>;

    fn report_exception(&self, exception: SystemException) {
        self.send(Request::ReportException(exception));
    }
}

/// Adapts a port into an [`ExceptionReporter`]
pub struct PortReporter(pub std::sync::Arc<dyn ProxyPort>);

impl ExceptionReporter for PortReporter {
    fn report_exception(&self, exception: SystemException) {
        self.0.report_exception(exception);
    }
}

/// Routes pushed messages to the proxy that owns them
pub trait PushRouter: Send + Sync {
    fn route(&self, push: Push) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording port used by the proxy tests

    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    pub struct RecordingPort {
        sent: Mutex<Vec<Request>>,
        replies: Mutex<VecDeque<Response>>,
    }

    impl RecordingPort {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue the response for the next `call`
        pub fn reply(&self, response: Response) {
            self.replies.lock().push_back(response);
        }

        pub fn sent(&self) -> Vec<Request> {
            self.sent.lock().clone()
        }

        pub fn take_sent(&self) -> Vec<Request> {
            std::mem::take(&mut *self.sent.lock())
        }

        pub fn count(&self, name: &str) -> usize {
            self.sent.lock().iter().filter(|r| r.name() == name).count()
        }
    }

    #[async_trait]
    impl ProxyPort for RecordingPort {
        fn send(&self, request: Request) {
            self.sent.lock().push(request);
        }

        async fn call(&self, request: Request) -> Result<Response> {
            self.sent.lock().push(request);
            self.replies.lock().pop_front().ok_or(Error::Disconnected)
        }
    }

    impl ExceptionReporter for RecordingPort {
        fn report_exception(&self, exception: SystemException) {
            ProxyPort::report_exception(self, exception);
        }
    }
}
