// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! The RPC wire message.
//!
//! A message is immutable once created. On the wire it is six frames in one multipart envelope:
//! `[source, id, type, subject, headers, body]`. For a REQ the subject is
//! `<interface>.<method>`; for any reply it is the id of the request being answered.

pub mod codec;
mod error;

use std::{collections::HashMap, fmt};

use bytes::Bytes;
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};

pub use error::MessageError;

use crate::{serializer, trace};

/// Subject of the builtin heartbeat request. Pings are "idle chatter": they refresh a
/// connection's `last_seen` but not its `last_message`.
pub const PING_SUBJECT: &str = "hive.ping";

/// A 128-bit message id, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(data_encoding::HEXLOWER.encode(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Req,
    Rep,
    Ack,
    Nack,
    Error,
}

impl MessageType {
    pub fn wire_tag(&self) -> &'static [u8] {
        match self {
            MessageType::Req => b"REQ",
            MessageType::Rep => b"REP",
            MessageType::Ack => b"ACK",
            MessageType::Nack => b"NACK",
            MessageType::Error => b"ERROR",
        }
    }

    pub fn from_wire_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"REQ" => Some(MessageType::Req),
            b"REP" => Some(MessageType::Rep),
            b"ACK" => Some(MessageType::Ack),
            b"NACK" => Some(MessageType::Nack),
            b"ERROR" => Some(MessageType::Error),
            _ => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            MessageType::Rep | MessageType::Ack | MessageType::Nack | MessageType::Error
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            MessageType::Req => "REQ",
            MessageType::Rep => "REP",
            MessageType::Ack => "ACK",
            MessageType::Nack => "NACK",
            MessageType::Error => "ERROR",
        };
        f.write_str(tag)
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    id: MessageId,
    msg_type: MessageType,
    subject: String,
    source: String,
    headers: HashMap<String, String>,
    body: Bytes,
}

impl Message {
    /// Compose a new REQ with a fresh id. The `trace_id` header is inherited from the ambient
    /// trace or freshly minted.
    pub fn request<T>(
        subject: &str,
        source: &str,
        headers: HashMap<String, String>,
        body: &T,
    ) -> Result<Self, MessageError>
    where
        T: Serialize + ?Sized,
    {
        let mut headers = headers;
        headers
            .entry(trace::TRACE_ID_HEADER.to_string())
            .or_insert_with(trace::current_or_new);
        Ok(Self {
            id: MessageId::random(),
            msg_type: MessageType::Req,
            subject: subject.to_string(),
            source: source.to_string(),
            headers,
            body: serializer::default_serializer().encode(body)?,
        })
    }

    /// Compose a reply to `request`. The subject is the id of the request being answered.
    pub fn reply(
        request: &Message,
        msg_type: MessageType,
        source: &str,
        mut headers: HashMap<String, String>,
        body: Bytes,
    ) -> Self {
        debug_assert!(msg_type.is_reply());
        if let Some(trace_id) = request.trace_id() {
            headers
                .entry(trace::TRACE_ID_HEADER.to_string())
                .or_insert_with(|| trace_id.to_string());
        }
        Self {
            id: MessageId::random(),
            msg_type,
            subject: request.id.as_str().to_string(),
            source: source.to_string(),
            headers,
            body,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.header(trace::TRACE_ID_HEADER)
    }

    /// The packed body. Decoding is deferred until [`decode_body`](Self::decode_body).
    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn decode_body<T>(&self) -> Result<T, MessageError>
    where T: DeserializeOwned {
        Ok(serializer::default_serializer().decode(&self.body)?)
    }

    pub fn is_request(&self) -> bool {
        self.msg_type == MessageType::Req
    }

    pub fn is_reply(&self) -> bool {
        self.msg_type.is_reply()
    }

    /// Idle chatter refreshes `last_seen` but not `last_message`: heartbeat pings and every kind
    /// of reply.
    pub fn is_idle_chatter(&self) -> bool {
        !self.is_request() || self.subject == PING_SUBJECT
    }

    /// Pack into the six wire frames: `[source, id, type, subject, headers, body]`.
    pub fn pack_frames(&self) -> Result<Vec<Bytes>, MessageError> {
        let headers = serializer::default_serializer().encode(&self.headers)?;
        Ok(vec![
            Bytes::copy_from_slice(self.source.as_bytes()),
            Bytes::copy_from_slice(self.id.as_str().as_bytes()),
            Bytes::from_static(self.msg_type.wire_tag()),
            Bytes::copy_from_slice(self.subject.as_bytes()),
            headers,
            self.body.clone(),
        ])
    }

    pub fn unpack_frames(frames: &[Bytes]) -> Result<Self, MessageError> {
        let [source, id, msg_type, subject, headers, body] = frames else {
            return Err(MessageError::BadFrameCount(frames.len()));
        };
        let source = std::str::from_utf8(source).map_err(|_| MessageError::InvalidUtf8("source"))?;
        let id = std::str::from_utf8(id).map_err(|_| MessageError::InvalidUtf8("id"))?;
        let subject = std::str::from_utf8(subject).map_err(|_| MessageError::InvalidUtf8("subject"))?;
        let msg_type =
            MessageType::from_wire_tag(msg_type).ok_or_else(|| MessageError::UnknownType(msg_type.to_vec()))?;
        let headers: HashMap<String, String> = serializer::default_serializer().decode(headers)?;
        Ok(Self {
            id: MessageId::from(id),
            msg_type,
            subject: subject.to_string(),
            source: source.to_string(),
            headers,
            body: body.clone(),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{type={} subject={} id={}..}}",
            self.msg_type,
            self.subject,
            &self.id.as_str()[..10.min(self.id.as_str().len())]
        )
    }
}
