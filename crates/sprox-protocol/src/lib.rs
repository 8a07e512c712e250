//! Wire protocol between a proxy context and its backing store host
//!
//! Every message travels as one frame:
//!
//! ```text
//! <u32 big-endian body length><body>
//! ```
//!
//! The body is a serialized [`Envelope`] (context to host) or [`HostMessage`]
//! (host to context), encoded as JSON or MessagePack. Envelopes with a `seq`
//! expect a [`HostMessage::Reply`] carrying the same `seq`; envelopes without
//! one are fire-and-forget.

pub mod codec;
pub mod error;
pub mod frame;
pub mod parser;

pub use codec::{Codec, Format, TransportConfig};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{Envelope, HostMessage, Outcome};
pub use parser::FrameParser;
