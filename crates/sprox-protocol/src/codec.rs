//! Body encoding and frame construction

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default maximum frame body size (1MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes
pub const PREFIX_LEN: usize = 4;

/// Body serialization format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    Msgpack,
}

impl std::str::FromStr for Format {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Format::Json),
            "msgpack" | "messagepack" => Ok(Format::Msgpack),
            _ => Err(ProtocolError::UnknownFormat(s.to_string())),
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Json => write!(f, "json"),
            Format::Msgpack => write!(f, "msgpack"),
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TransportConfig {
    pub format: Format,
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            format: Format::Json,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Encodes and decodes frame bodies in one format
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    format: Format,
    max_frame_size: usize,
}

impl Codec {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            format: config.format,
            max_frame_size: config.max_frame_size,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Serialize `message` and prepend its length
    pub fn encode<T: Serialize>(&self, message: &T) -> ProtocolResult<Bytes> {
        let body = match self.format {
            Format::Json => serde_json::to_vec(message)?,
            Format::Msgpack => rmp_serde::to_vec_named(message)?,
        };

        if body.len() > self.max_frame_size {
            debug!(
                size = body.len(),
                max = self.max_frame_size,
                format = %self.format,
                "Refusing to encode oversized frame"
            );
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }

        let mut frame = BytesMut::with_capacity(PREFIX_LEN + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    /// Deserialize a frame body (without its prefix)
    pub fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> ProtocolResult<T> {
        match self.format {
            Format::Json => Ok(serde_json::from_slice(body)?),
            Format::Msgpack => Ok(rmp_serde::from_slice(body)?),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(&TransportConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Envelope, HostMessage, Outcome};
    use serde_json::json;
    use sprox_core::{
        Change, ConsumerId, EntryChange, ProxyId, Push, Request, Response, StoreData, StoreKind,
        StoreRef, UpdateEvent,
    };

    fn codec(format: Format) -> Codec {
        Codec::new(&TransportConfig {
            format,
            ..TransportConfig::default()
        })
    }

    #[test]
    fn test_frame_prefix() {
        let frame = codec(Format::Json).encode(&json!({"a": 1})).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - PREFIX_LEN);
        assert_eq!(&frame[PREFIX_LEN..], br#"{"a":1}"#);
    }

    #[test]
    fn test_both_formats_carry_proxy_traffic() {
        let store = StoreRef::new(ProxyId::new("arc:items").unwrap(), StoreKind::Collection);
        let envelope = Envelope::call(
            7,
            Request::Store {
                store,
                data: StoreData {
                    value: json!({"id": "a", "tags": ["x"]}),
                    keys: vec!["k1".into()],
                },
                consumer: ConsumerId::from("p1"),
            },
        );
        let push = HostMessage::Push(Push::Update {
            proxy: ProxyId::new("arc:items").unwrap(),
            event: UpdateEvent {
                version: 3,
                originator_id: None,
                barrier: None,
                change: Change::Add(vec![EntryChange {
                    value: json!({"id": "a"}),
                    keys: vec!["k1".into()],
                    effective: true,
                }]),
            },
        });
        let reply = HostMessage::Reply {
            seq: 7,
            outcome: Outcome::Ok(Response::Cursor(2)),
        };

        for format in [Format::Json, Format::Msgpack] {
            let codec = codec(format);
            let frame = codec.encode(&envelope).unwrap();
            let decoded: Envelope = codec.decode(&frame[PREFIX_LEN..]).unwrap();
            assert_eq!(decoded, envelope, "{}", format);

            for message in [&push, &reply] {
                let frame = codec.encode(message).unwrap();
                let decoded: HostMessage = codec.decode(&frame[PREFIX_LEN..]).unwrap();
                assert_eq!(&decoded, message, "{}", format);
            }
        }
    }

    #[test]
    fn test_oversized_body_rejected() {
        let codec = Codec::new(&TransportConfig {
            format: Format::Json,
            max_frame_size: 8,
        });
        assert!(matches!(
            codec.encode(&"a long string body"),
            Err(ProtocolError::FrameTooLarge { max: 8, .. })
        ));
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("JSON".parse::<Format>().unwrap(), Format::Json);
        assert_eq!("msgpack".parse::<Format>().unwrap(), Format::Msgpack);
        assert!("xml".parse::<Format>().is_err());
    }
}
