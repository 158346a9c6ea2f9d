// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Wire serialization of message headers, bodies and events.
//!
//! Two formats are supported: msgpack (self-describing, the default) and JSON. The format is a
//! process-wide choice made once at container start; every `Message` body and `Event` payload in
//! a process uses the same format.
//!
//! The msgpack format additionally supports an "embed" extension which carries an
//! already-packed message without re-encoding, used by forwarding paths.

use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::message::{codec, Message, MessageError};

const LOG_TARGET: &str = "hive::serializer";

/// Extension type code carrying an embedded, already-packed message.
pub const EMBED_EXT_CODE: i8 = 0x42;

#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("failed to encode value: {0}")]
    Encode(String),
    #[error("failed to decode value: {0}")]
    Decode(String),
    #[error("value is not an embedded message")]
    NotEmbedded,
    #[error("embedding requires the msgpack format")]
    EmbedUnsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    MsgPack,
    Json,
}

impl SerializationFormat {
    pub fn name(&self) -> &'static str {
        match self {
            SerializationFormat::MsgPack => "msgpack",
            SerializationFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Serializer {
    format: SerializationFormat,
}

impl Serializer {
    pub fn new(format: SerializationFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }

    pub fn encode<T>(&self, value: &T) -> Result<Bytes, SerializerError>
    where T: Serialize + ?Sized {
        let buf = match self.format {
            SerializationFormat::MsgPack => {
                // Named serialization keeps struct fields as map keys, which is what parameter
                // binding on the receiving side expects.
                rmp_serde::to_vec_named(value).map_err(|e| SerializerError::Encode(e.to_string()))?
            },
            SerializationFormat::Json => {
                serde_json::to_vec(value).map_err(|e| SerializerError::Encode(e.to_string()))?
            },
        };
        Ok(Bytes::from(buf))
    }

    pub fn decode<T>(&self, bytes: &[u8]) -> Result<T, SerializerError>
    where T: DeserializeOwned {
        match self.format {
            SerializationFormat::MsgPack => {
                rmp_serde::from_slice(bytes).map_err(|e| SerializerError::Decode(e.to_string()))
            },
            SerializationFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| SerializerError::Decode(e.to_string()))
            },
        }
    }

    /// Pack an already-serialized message into an embed extension value without re-encoding any
    /// of its frames. Only supported by the msgpack format.
    pub fn embed_message(&self, message: &Message) -> Result<Bytes, SerializerError> {
        if self.format != SerializationFormat::MsgPack {
            return Err(SerializerError::EmbedUnsupported);
        }
        let frames = message
            .pack_frames()
            .map_err(|e| SerializerError::Encode(e.to_string()))?;
        let payload = codec::frames_to_vec(&frames);
        let value = rmpv::Value::Ext(EMBED_EXT_CODE, payload);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).map_err(|e| SerializerError::Encode(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    /// Extract a message from an embed extension produced by [`embed_message`](Self::embed_message).
    pub fn extract_embedded(&self, bytes: &[u8]) -> Result<Message, SerializerError> {
        if self.format != SerializationFormat::MsgPack {
            return Err(SerializerError::EmbedUnsupported);
        }
        let value =
            rmpv::decode::read_value(&mut &bytes[..]).map_err(|e| SerializerError::Decode(e.to_string()))?;
        let payload = match value {
            rmpv::Value::Ext(EMBED_EXT_CODE, payload) => payload,
            _ => return Err(SerializerError::NotEmbedded),
        };
        let frames = codec::frames_from_slice(&payload).map_err(|e| SerializerError::Decode(e.to_string()))?;
        Message::unpack_frames(&frames).map_err(|e: MessageError| SerializerError::Decode(e.to_string()))
    }
}

static DEFAULT_FORMAT: OnceCell<SerializationFormat> = OnceCell::new();

/// Fix the process-wide serialization format. Called once at container start; later calls with a
/// different format are ignored with a warning.
pub fn init(format: SerializationFormat) {
    let current = *DEFAULT_FORMAT.get_or_init(|| format);
    if current != format {
        log::warn!(
            target: LOG_TARGET,
            "serialization format already initialized to {:?}; keeping it",
            current
        );
    }
}

/// The process-wide serializer. Defaults to msgpack when [`init`] was never called.
pub fn default_serializer() -> Serializer {
    Serializer::new(DEFAULT_FORMAT.get().copied().unwrap_or(SerializationFormat::MsgPack))
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
    struct Sample {
        text: String,
        count: u32,
    }

    #[test]
    fn msgpack_roundtrip() {
        let serializer = Serializer::new(SerializationFormat::MsgPack);
        let sample = Sample {
            text: "hello".to_string(),
            count: 3,
        };
        let bytes = serializer.encode(&sample).unwrap();
        assert_eq!(serializer.decode::<Sample>(&bytes).unwrap(), sample);
    }

    #[test]
    fn msgpack_structs_encode_as_maps() {
        let serializer = Serializer::new(SerializationFormat::MsgPack);
        let bytes = serializer
            .encode(&Sample {
                text: "hi".to_string(),
                count: 1,
            })
            .unwrap();
        let as_map: HashMap<String, rmpv::Value> = serializer.decode(&bytes).unwrap();
        assert_eq!(as_map.get("text"), Some(&rmpv::Value::from("hi")));
    }

    #[test]
    fn json_roundtrip() {
        let serializer = Serializer::new(SerializationFormat::Json);
        let sample = Sample {
            text: "hello".to_string(),
            count: 3,
        };
        let bytes = serializer.encode(&sample).unwrap();
        assert_eq!(serializer.decode::<Sample>(&bytes).unwrap(), sample);
    }

    #[test]
    fn decode_failure_is_an_error() {
        let serializer = Serializer::new(SerializationFormat::Json);
        assert!(serializer.decode::<Sample>(b"{not json").is_err());
    }

    #[test]
    fn embed_is_msgpack_only() {
        let serializer = Serializer::new(SerializationFormat::Json);
        let msg = Message::request("echo.echo", "tcp://127.0.0.1:4000", Default::default(), &()).unwrap();
        assert!(matches!(
            serializer.embed_message(&msg),
            Err(SerializerError::EmbedUnsupported)
        ));
    }
}
