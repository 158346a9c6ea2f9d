// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{discovery::DiscoveryError, message::{Message, MessageError}};

/// Body of an ERROR reply: `{type, message}`. NACK and ACK carry no body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReplyBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request was refused by the remote peer")]
    Nack,
    #[error("remote error ({kind}): {message}")]
    Remote { kind: String, message: String },
    #[error("not connected to {0}")]
    NotConnected(String),
    #[error("server is not running")]
    NotRunning,
    #[error("reply channel closed unexpectedly")]
    ChannelClosed,
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Lookup(#[from] DiscoveryError),
}

impl RpcError {
    /// Map an ERROR reply into a typed remote error. The kind is the payload's `type` field; a
    /// malformed payload maps to a generic `RemoteError`.
    pub fn from_error_reply(reply: &Message) -> Self {
        match reply.decode_body::<ErrorReplyBody>() {
            Ok(body) => RpcError::Remote {
                kind: body.kind,
                message: body.message,
            },
            Err(_) => RpcError::Remote {
                kind: "RemoteError".to_string(),
                message: "malformed error reply body".to_string(),
            },
        }
    }

    /// The remote error kind, if this is a remote error.
    pub fn remote_kind(&self) -> Option<&str> {
        match self {
            RpcError::Remote { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Short tag used as a metrics label.
    pub fn tag(&self) -> &'static str {
        match self {
            RpcError::Timeout(_) => "timeout",
            RpcError::Nack => "nack",
            RpcError::Remote { .. } => "remote",
            RpcError::NotConnected(_) => "not_connected",
            RpcError::NotRunning => "not_running",
            RpcError::ChannelClosed => "channel_closed",
            RpcError::Message(_) => "message",
            RpcError::Lookup(_) => "lookup",
        }
    }
}
