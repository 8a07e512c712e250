//! Links between a proxy context and the backing store
//!
//! A jittered link is an in-process connection whose messages are each held
//! back for a random delay. Delivery order is preserved in both directions;
//! only timing varies, so replies, pushes and the writes of other contexts
//! interleave differently on every run.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sprox_protocol::{Codec, TransportConfig};
use sprox_store::BackingStore;
use sprox_transport::{connect, serve_connection, ChannelPort, PortInbound, StoreHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error};

const STREAM_BUFFER: usize = 64 * 1024;

/// Connect to `store` through a link delaying each message by up to `max_delay`
pub fn jittered(
    store: Arc<dyn BackingStore>,
    client_id: &str,
    max_delay: Duration,
    seed: u64,
) -> (ChannelPort, PortInbound) {
    let (envelope_tx, envelope_rx) = mpsc::unbounded_channel();
    let (delayed_envelope_tx, delayed_envelope_rx) = mpsc::unbounded_channel();
    let (host_tx, host_rx) = mpsc::unbounded_channel();
    let (delayed_host_tx, delayed_host_rx) = mpsc::unbounded_channel();

    tokio::spawn(relay(envelope_rx, delayed_envelope_tx, max_delay, seed));
    tokio::spawn(relay(host_rx, delayed_host_tx, max_delay, seed.wrapping_add(1)));

    let handler = StoreHandler::new(client_id, store, host_tx);
    tokio::spawn(handler.serve(delayed_envelope_rx));

    ChannelPort::new(envelope_tx, delayed_host_rx)
}

/// Connect to `store` over an in-memory byte stream using the framed codec
pub fn framed(
    store: Arc<dyn BackingStore>,
    client_id: &str,
    config: &TransportConfig,
) -> (ChannelPort, PortInbound) {
    let (client_io, host_io) = tokio::io::duplex(STREAM_BUFFER);
    let codec = Codec::new(config);
    let client = client_id.to_string();

    tokio::spawn(async move {
        if let Err(e) = serve_connection(host_io, store, client.clone(), codec).await {
            error!(client = %client, error = %e, "Simulated connection failed");
        }
    });

    let (port, inbound, _pump) = connect(client_io, config);
    (port, inbound)
}

/// Forward messages from `rx` to `tx`, each no earlier than a random delay
/// after it was received and never ahead of the message before it.
async fn relay<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<T>,
    tx: mpsc::UnboundedSender<T>,
    max_delay: Duration,
    seed: u64,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let max_micros = max_delay.as_micros() as u64;
    let mut last_delivery = Instant::now();

    while let Some(message) = rx.recv().await {
        if max_micros > 0 {
            let jitter = Duration::from_micros(rng.gen_range(0..=max_micros));
            let deliver_at = (Instant::now() + jitter).max(last_delivery);
            tokio::time::sleep_until(deliver_at).await;
            last_delivery = deliver_at;
        }
        if tx.send(message).is_err() {
            break;
        }
    }
    debug!("Link relay closed");
}
