//! Store handler - executes proxy requests and forwards store updates

use dashmap::DashMap;
use sprox_core::{ProxyId, Push, Request, Response, StoreRef};
use sprox_protocol::{Envelope, HostMessage, Outcome};
use sprox_store::{BackingStore, StoreError};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handles the requests of a single client connection
pub struct StoreHandler {
    /// Unique client ID
    pub client_id: String,
    store: Arc<dyn BackingStore>,
    outbound: mpsc::UnboundedSender<HostMessage>,
    /// One update forwarder per attached proxy
    listeners: DashMap<ProxyId, JoinHandle<()>>,
}

impl StoreHandler {
    pub fn new(
        client_id: impl Into<String>,
        store: Arc<dyn BackingStore>,
        outbound: mpsc::UnboundedSender<HostMessage>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            store,
            outbound,
            listeners: DashMap::new(),
        }
    }

    /// Process envelopes until the client side closes
    pub async fn serve(self, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        info!(client = %self.client_id, "Client connected");
        while let Some(envelope) = inbound.recv().await {
            self.handle(envelope).await;
        }
        info!(client = %self.client_id, "Client disconnected");
    }

    /// Execute one envelope, replying when it carries a sequence number
    pub async fn handle(&self, envelope: Envelope) {
        let name = envelope.request.name();
        debug!(client = %self.client_id, request = name, seq = ?envelope.seq, "Processing request");

        let outcome = match self.execute(envelope.request).await {
            Ok(response) => Outcome::Ok(response),
            Err(e) => {
                warn!(client = %self.client_id, request = name, error = %e, "Request failed");
                Outcome::error(e.code(), e.to_string())
            }
        };

        if let Some(seq) = envelope.seq {
            self.emit(HostMessage::Reply { seq, outcome });
        }
    }

    /// Number of proxies with an attached update forwarder
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn emit(&self, message: HostMessage) {
        if self.outbound.send(message).is_err() {
            debug!(client = %self.client_id, "Client gone, dropping message");
        }
    }

    async fn execute(&self, request: Request) -> Result<Response, StoreError> {
        let store = self.store.as_ref();

        match request {
            Request::AttachListener { store: target } => {
                self.attach_listener(target)?;
                Ok(Response::Ack)
            }
            Request::RequestFullSync { store: target } => {
                let (version, model) = store.full_sync(&target).await?;
                self.emit(HostMessage::Push(Push::FullSync {
                    proxy: target.id,
                    version,
                    model,
                }));
                Ok(Response::Ack)
            }
            Request::Get { store: target, .. } => Ok(Response::Value(store.get(&target).await?)),
            Request::ToList { store: target, .. } => {
                Ok(Response::Entries(store.to_list(&target).await?))
            }
            Request::Store { store: target, data, consumer } => {
                store.store(&target, data, &consumer).await?;
                Ok(Response::Ack)
            }
            Request::Remove { store: target, data, consumer } => {
                store.remove(&target, data, &consumer).await?;
                Ok(Response::Ack)
            }
            Request::RemoveMultiple { store: target, data, consumer } => {
                store.remove_multiple(&target, data, &consumer).await?;
                Ok(Response::Ack)
            }
            Request::Set { store: target, data, consumer, barrier } => {
                store.set(&target, data, &consumer, barrier).await?;
                Ok(Response::Ack)
            }
            Request::Clear { store: target, consumer, barrier } => {
                store.clear(&target, &consumer, barrier).await?;
                Ok(Response::Ack)
            }
            Request::Stream { store: target, page_size, forward } => {
                Ok(Response::Cursor(store.stream(&target, page_size, forward).await?))
            }
            Request::CursorNext { store: target, cursor } => {
                Ok(Response::Page(store.cursor_next(&target, cursor).await?))
            }
            Request::CursorClose { store: target, cursor } => {
                store.cursor_close(&target, cursor).await?;
                Ok(Response::Ack)
            }
            Request::ReportException(exception) => {
                error!(client = %self.client_id, %exception, "Exception reported by proxy context");
                Ok(Response::Ack)
            }
        }
    }

    fn attach_listener(&self, target: StoreRef) -> Result<(), StoreError> {
        if self.listeners.contains_key(&target.id) {
            return Ok(());
        }

        // Subscribe before returning so no update after this request is missed
        let mut updates = self.store.subscribe(&target)?;
        let outbound = self.outbound.clone();
        let client = self.client_id.clone();
        let proxy = target.id.clone();

        let forwarder = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(event) => {
                        let push = Push::Update {
                            proxy: proxy.clone(),
                            event,
                        };
                        if outbound.send(HostMessage::Push(push)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(client = %client, proxy = %proxy, missed = n, "Client lagged behind updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        debug!(client = %self.client_id, proxy = %target.id, "Attached update listener");
        self.listeners.insert(target.id, forwarder);
        Ok(())
    }
}

impl Drop for StoreHandler {
    fn drop(&mut self) {
        for entry in self.listeners.iter() {
            entry.value().abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sprox_core::{ConsumerId, StoreData, StoreKind, SyncModel};
    use sprox_store::MemoryStore;

    fn collection() -> StoreRef {
        StoreRef::new(ProxyId::new("arc:items").unwrap(), StoreKind::Collection)
    }

    fn handler() -> (StoreHandler, mpsc::UnboundedReceiver<HostMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StoreHandler::new("test", Arc::new(MemoryStore::new()), tx), rx)
    }

    fn store_request(id: &str) -> Request {
        Request::Store {
            store: collection(),
            data: StoreData {
                value: json!({"id": id}),
                keys: vec!["k1".into()],
            },
            consumer: ConsumerId::from("p1"),
        }
    }

    #[tokio::test]
    async fn test_attach_forwards_updates_once() {
        let (handler, mut rx) = handler();

        let attach = Request::AttachListener { store: collection() };
        handler.handle(Envelope::send(attach.clone())).await;
        handler.handle(Envelope::send(attach)).await;
        assert_eq!(handler.listener_count(), 1);

        handler.handle(Envelope::send(store_request("a"))).await;

        let message = rx.recv().await.unwrap();
        assert!(matches!(
            message,
            HostMessage::Push(Push::Update { ref event, .. }) if event.version == 1
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_sync_is_pushed() {
        let (handler, mut rx) = handler();
        handler.handle(Envelope::send(store_request("a"))).await;
        handler
            .handle(Envelope::send(Request::RequestFullSync { store: collection() }))
            .await;

        match rx.recv().await.unwrap() {
            HostMessage::Push(Push::FullSync { version, model, .. }) => {
                assert_eq!(version, 1);
                assert!(matches!(model, SyncModel::Entries(e) if e.len() == 1));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_calls_are_answered_with_outcomes() {
        let (handler, mut rx) = handler();

        handler
            .handle(Envelope::call(1, Request::ToList { store: collection(), consumer: ConsumerId::from("p1") }))
            .await;
        assert_eq!(
            rx.recv().await.unwrap(),
            HostMessage::Reply { seq: 1, outcome: Outcome::Ok(Response::Entries(vec![])) }
        );

        let bad = Request::Get { store: collection(), consumer: ConsumerId::from("p1") };
        handler.handle(Envelope::call(2, bad)).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            HostMessage::Reply { seq: 2, outcome: Outcome::Err { ref code, .. } } if code == "UNSUPPORTED"
        ));
    }

    #[tokio::test]
    async fn test_failed_send_gets_no_reply() {
        let (handler, mut rx) = handler();
        let keyless = Request::Store {
            store: collection(),
            data: StoreData { value: json!({"id": "a"}), keys: vec![] },
            consumer: ConsumerId::from("p1"),
        };
        handler.handle(Envelope::send(keyless)).await;
        assert!(rx.try_recv().is_err());
    }
}
