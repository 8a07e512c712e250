//! Framed byte-stream transport

use crate::channel::{ChannelPort, PortInbound};
use crate::error::TransportResult;
use crate::handler::StoreHandler;
use sprox_protocol::{Codec, Envelope, FrameParser, HostMessage, Outcome, ProtocolError, TransportConfig};
use sprox_store::BackingStore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const READ_BUFFER: usize = 4096;

/// Connect a port to a host over `io`.
///
/// Returns the port, its inbound half and the task pumping frames. The task
/// ends when either the stream or the port closes.
pub fn connect<S>(
    io: S,
    config: &TransportConfig,
) -> (ChannelPort, PortInbound, JoinHandle<TransportResult<()>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (envelope_tx, envelope_rx) = mpsc::unbounded_channel();
    let (host_tx, host_rx) = mpsc::unbounded_channel();
    let codec = Codec::new(config);

    let pump = tokio::spawn(async move {
        let result = client_pump(io, codec, envelope_rx, host_tx).await;
        if let Err(e) = &result {
            error!(error = %e, "Client connection error");
        }
        result
    });

    let (port, inbound) = ChannelPort::new(envelope_tx, host_rx);
    (port, inbound, pump)
}

async fn client_pump<S>(
    io: S,
    codec: Codec,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    inbound: mpsc::UnboundedSender<HostMessage>,
) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut parser = FrameParser::new(codec);
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                let n = result?;
                if n == 0 {
                    debug!("Host closed the stream");
                    return Ok(());
                }
                parser.feed(&buf[..n]);
                while let Some(message) = parser.parse::<HostMessage>()? {
                    if inbound.send(message).is_err() {
                        return Ok(());
                    }
                }
            }

            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    writer.shutdown().await?;
                    return Ok(());
                };
                writer.write_all(&codec.encode(&envelope)?).await?;
            }
        }
    }
}

/// Serve one client connection until it closes
pub async fn serve_connection<S>(
    io: S,
    store: Arc<dyn BackingStore>,
    client_id: String,
    codec: Codec,
) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(io);
    let (host_tx, mut host_rx) = mpsc::unbounded_channel();
    let handler = StoreHandler::new(client_id.clone(), store, host_tx);
    let mut parser = FrameParser::new(codec);
    let mut buf = vec![0u8; READ_BUFFER];

    info!(client = %client_id, "Client connected");

    loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                let n = result?;
                if n == 0 {
                    info!(client = %client_id, "Client disconnected");
                    break;
                }
                parser.feed(&buf[..n]);
                while let Some(envelope) = parser.parse::<Envelope>()? {
                    handler.handle(envelope).await;
                }
            }

            Some(message) = host_rx.recv() => {
                if let Some(frame) = encode_host(&codec, &client_id, message)? {
                    writer.write_all(&frame).await?;
                }
            }
        }
    }

    Ok(())
}

/// Encode a host message. An oversized reply becomes an error reply; an
/// oversized push is dropped and the proxy recovers by resynchronizing.
fn encode_host(
    codec: &Codec,
    client_id: &str,
    message: HostMessage,
) -> TransportResult<Option<Vec<u8>>> {
    match codec.encode(&message) {
        Ok(frame) => Ok(Some(frame.to_vec())),
        Err(e @ ProtocolError::FrameTooLarge { .. }) => {
            error!(client = %client_id, error = %e, "Dropping oversized message");
            match message {
                HostMessage::Reply { seq, .. } => {
                    let reply = HostMessage::Reply {
                        seq,
                        outcome: Outcome::error("FRAME_TOO_LARGE", e.to_string()),
                    };
                    Ok(Some(codec.encode(&reply)?.to_vec()))
                }
                HostMessage::Push(_) => Ok(None),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// TCP host for a backing store
pub struct TcpServer {
    store: Arc<dyn BackingStore>,
    addr: SocketAddr,
    config: TransportConfig,
    client_counter: AtomicU64,
}

impl TcpServer {
    pub fn new(store: Arc<dyn BackingStore>, addr: SocketAddr, config: TransportConfig) -> Self {
        Self {
            store,
            addr,
            config,
            client_counter: AtomicU64::new(0),
        }
    }

    /// Bind and serve forever
    pub async fn run(&self) -> TransportResult<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> TransportResult<()> {
        info!(addr = %listener.local_addr()?, format = %self.config.format, "Store host listening");
        let codec = Codec::new(&self.config);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let client_id = format!(
                        "tcp:{}:{}",
                        peer_addr,
                        self.client_counter.fetch_add(1, Ordering::Relaxed)
                    );
                    let store = self.store.clone();

                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, store, client_id.clone(), codec).await {
                            error!(client = %client_id, error = %e, "Connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}
