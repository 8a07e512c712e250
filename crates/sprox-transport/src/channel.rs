//! Client-side port over tokio channels

use crate::handler::StoreHandler;
use async_trait::async_trait;
use dashmap::DashMap;
use sprox_core::{Error, ProxyPort, PushRouter, Request, Response};
use sprox_protocol::{Envelope, HostMessage, Outcome};
use sprox_store::BackingStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type Pending = Arc<DashMap<u64, oneshot::Sender<Outcome>>>;

/// A [`ProxyPort`] that writes envelopes to a channel and matches replies by sequence number
pub struct ChannelPort {
    outbound: mpsc::UnboundedSender<Envelope>,
    pending: Pending,
    next_seq: AtomicU64,
}

impl ChannelPort {
    /// Build a port and the inbound half that must be run to receive replies and pushes
    pub fn new(
        outbound: mpsc::UnboundedSender<Envelope>,
        inbound: mpsc::UnboundedReceiver<HostMessage>,
    ) -> (Self, PortInbound) {
        let pending: Pending = Arc::new(DashMap::new());
        let port = Self {
            outbound,
            pending: pending.clone(),
            next_seq: AtomicU64::new(1),
        };
        (port, PortInbound { inbound, pending })
    }

    /// Round trips still waiting for a reply
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl ProxyPort for ChannelPort {
    fn send(&self, request: Request) {
        let name = request.name();
        if self.outbound.send(Envelope::send(request)).is_err() {
            warn!(request = name, "Port closed, dropping request");
        }
    }

    async fn call(&self, request: Request) -> sprox_core::Result<Response> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        if self.outbound.send(Envelope::call(seq, request)).is_err() {
            self.pending.remove(&seq);
            return Err(Error::Disconnected);
        }

        rx.await.map_err(|_| Error::Disconnected)?.into_result()
    }
}

/// Receiving half of a [`ChannelPort`]
pub struct PortInbound {
    inbound: mpsc::UnboundedReceiver<HostMessage>,
    pending: Pending,
}

impl PortInbound {
    /// Deliver replies to waiting calls and pushes to `router` until the host side closes.
    ///
    /// Calls still waiting when the host goes away fail with `Disconnected`.
    pub async fn run(mut self, router: Arc<dyn PushRouter>) {
        while let Some(message) = self.inbound.recv().await {
            self.dispatch(message, router.as_ref());
        }
        debug!(abandoned = self.pending.len(), "Host closed the port");
        self.pending.clear();
    }

    fn dispatch(&self, message: HostMessage, router: &dyn PushRouter) {
        match message {
            HostMessage::Reply { seq, outcome } => match self.pending.remove(&seq) {
                Some((_, waiter)) => {
                    // The caller may have given up
                    let _ = waiter.send(outcome);
                }
                None => warn!(seq, "Reply for unknown request"),
            },
            HostMessage::Push(push) => {
                let proxy = push.proxy().clone();
                if let Err(e) = router.route(push) {
                    error!(proxy = %proxy, error = %e, "Failed to route push");
                }
            }
        }
    }
}

/// Connect a port directly to a backing store in this process.
///
/// Returns the port, its inbound half and the host task serving it.
pub fn in_process(
    store: Arc<dyn BackingStore>,
    client_id: impl Into<String>,
) -> (ChannelPort, PortInbound, JoinHandle<()>) {
    let (envelope_tx, envelope_rx) = mpsc::unbounded_channel();
    let (host_tx, host_rx) = mpsc::unbounded_channel();

    let handler = StoreHandler::new(client_id, store, host_tx);
    let host = tokio::spawn(handler.serve(envelope_rx));

    let (port, inbound) = ChannelPort::new(envelope_tx, host_rx);
    (port, inbound, host)
}
