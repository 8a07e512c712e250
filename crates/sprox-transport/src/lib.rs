//! sprox transport layer
//!
//! Connects proxy contexts to a backing store host:
//! - Handler: executes proxy requests against a [`BackingStore`] and forwards
//!   store updates as pushes
//! - Channel: an in-process [`ProxyPort`] over tokio channels
//! - Stream: the same port over any framed `AsyncRead + AsyncWrite`, plus a TCP
//!   accept loop for hosts
//!
//! [`BackingStore`]: sprox_store::BackingStore
//! [`ProxyPort`]: sprox_core::ProxyPort

pub mod channel;
pub mod error;
pub mod handler;
pub mod stream;

pub use channel::{in_process, ChannelPort, PortInbound};
pub use error::{TransportError, TransportResult};
pub use handler::StoreHandler;
pub use stream::{connect, serve_connection, TcpServer};
