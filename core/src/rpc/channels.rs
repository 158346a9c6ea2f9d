// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Request and reply channels.
//!
//! A [`RequestChannel`] correlates one outbound request with its single reply. It is entered
//! into the server's channel table at send time and removes itself when [`get`](RequestChannel::get)
//! resolves, times out, or the channel is dropped.
//!
//! A [`ReplyChannel`] is handed to the handler of an inbound request. It accepts at most one
//! terminal send from {REP, ACK, NACK, ERROR}.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::{
    message::{Message, MessageType},
    rpc::{error::ErrorReplyBody, RpcError, RpcServer},
    serializer,
};

const LOG_TARGET: &str = "hive::rpc::channels";

/// The sending half of a request channel's single reply slot, kept in the server's channel table.
pub(crate) type ReplySlot = oneshot::Sender<Result<Message, RpcError>>;

#[derive(Debug)]
pub struct RequestChannel {
    request: Message,
    reply: Option<oneshot::Receiver<Result<Message, RpcError>>>,
    server: Weak<RpcServer>,
}

impl RequestChannel {
    pub(crate) fn new(
        request: Message,
        reply: oneshot::Receiver<Result<Message, RpcError>>,
        server: Weak<RpcServer>,
    ) -> Self {
        Self {
            request,
            reply: Some(reply),
            server,
        }
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    /// Wait up to `timeout` for the reply. A reply arriving as the deadline resolves wins the
    /// race. On return the channel is removed from the server's table; a reply that arrives
    /// later is logged and dropped by the receive path.
    ///
    /// NACK maps to [`RpcError::Nack`], ERROR to [`RpcError::Remote`] with the kind named by the
    /// payload, and an elapsed deadline to [`RpcError::Timeout`].
    pub async fn get(mut self, timeout: Duration) -> Result<Message, RpcError> {
        let reply = self.reply.take().expect("reply slot taken before get");
        let result = tokio::time::timeout(timeout, reply).await;
        self.remove_from_table();
        match result {
            Ok(Ok(Ok(msg))) => match msg.msg_type() {
                MessageType::Nack => Err(RpcError::Nack),
                MessageType::Error => Err(RpcError::from_error_reply(&msg)),
                _ => Ok(msg),
            },
            // A synthesized failure, e.g. NotConnected at send time
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(RpcError::ChannelClosed),
            Err(_) => Err(RpcError::Timeout(timeout)),
        }
    }

    fn remove_from_table(&self) {
        if let Some(server) = self.server.upgrade() {
            server.remove_channel(self.request.id());
        }
    }
}

impl Drop for RequestChannel {
    fn drop(&mut self) {
        // A channel abandoned without `get` must not leak its table entry
        if self.reply.is_some() {
            self.remove_from_table();
        }
    }
}

#[derive(Clone)]
pub struct ReplyChannel {
    request: Message,
    server: Arc<RpcServer>,
    reply_sent: Arc<AtomicBool>,
    headers: Arc<Mutex<HashMap<String, String>>>,
}

impl ReplyChannel {
    pub(crate) fn new(request: Message, server: Arc<RpcServer>) -> Self {
        Self {
            request,
            server,
            reply_sent: Arc::new(AtomicBool::new(false)),
            headers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn reply_sent(&self) -> bool {
        self.reply_sent.load(Ordering::SeqCst)
    }

    /// Add a header to the eventual reply, e.g. the interface `version`.
    pub fn add_header(&self, name: &str, value: &str) {
        self.headers
            .lock()
            .expect("reply header lock poisoned")
            .insert(name.to_string(), value.to_string());
    }

    pub async fn reply<T>(&self, body: &T) -> Result<(), RpcError>
    where T: Serialize + ?Sized {
        let body = serializer::default_serializer()
            .encode(body)
            .map_err(crate::message::MessageError::from)?;
        self.send_terminal(MessageType::Rep, body, false).await
    }

    /// Reply with an already-packed body, without re-encoding.
    pub async fn reply_raw(&self, body: Bytes) -> Result<(), RpcError> {
        self.send_terminal(MessageType::Rep, body, false).await
    }

    pub async fn ack(&self, unless_reply_sent: bool) -> Result<(), RpcError> {
        self.send_terminal(MessageType::Ack, Bytes::new(), unless_reply_sent).await
    }

    pub async fn nack(&self, unless_reply_sent: bool) -> Result<(), RpcError> {
        self.send_terminal(MessageType::Nack, Bytes::new(), unless_reply_sent).await
    }

    pub async fn error(&self, kind: &str, message: &str) -> Result<(), RpcError> {
        let body = serializer::default_serializer()
            .encode(&ErrorReplyBody {
                kind: kind.to_string(),
                message: message.to_string(),
            })
            .map_err(crate::message::MessageError::from)?;
        self.send_terminal(MessageType::Error, body, false).await
    }

    async fn send_terminal(&self, msg_type: MessageType, body: Bytes, quiet: bool) -> Result<(), RpcError> {
        if self.reply_sent.swap(true, Ordering::SeqCst) {
            if !quiet {
                log::warn!(
                    target: LOG_TARGET,
                    "ignoring {} for {}: a terminal reply was already sent",
                    msg_type,
                    self.request
                );
            }
            return Ok(());
        }
        let headers = self.headers.lock().expect("reply header lock poisoned").clone();
        self.server.send_reply(&self.request, msg_type, body, headers).await
    }
}
