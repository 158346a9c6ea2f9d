// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! TCP transport.
//!
//! Each container binds one listening socket; every inbound stream is read as a sequence of
//! multipart envelopes and surfaced as decoded [`Message`]s on a single channel. Outbound links
//! are one lazily-dialed writer task per remote endpoint; a connection's messages are queued to
//! its writer and sent in order.

pub mod sockets;

use std::{fmt, io, time::Duration};

use futures::{SinkExt, StreamExt};
use hive_shutdown::ShutdownSignal;
use rand::Rng;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::{
    config::RpcConfig,
    message::{
        codec::{CodecError, MultipartCodec},
        Message,
    },
};

pub use sockets::SocketError;

const LOG_TARGET: &str = "hive::transport";

// Matches the ephemeral range the random bind picks from.
const RANDOM_PORT_RANGE: std::ops::Range<u16> = 35536..65535;

const DIAL_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid endpoint '{0}': expected tcp://<host>:<port>")]
    InvalidEndpoint(String),
    #[error("failed to bind after {attempts} attempt(s): {last_error}")]
    BindFailed { attempts: usize, last_error: io::Error },
}

/// A URL-like string identifying a container's listening transport address, e.g.
/// `tcp://127.0.0.1:4321`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    raw: String,
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self, TransportError> {
        let authority = s
            .strip_prefix("tcp://")
            .ok_or_else(|| TransportError::InvalidEndpoint(s.to_string()))?;
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(Self { raw: s.to_string() }),
            _ => Err(TransportError::InvalidEndpoint(s.to_string())),
        }
    }

    pub fn from_parts(host: &str, port: u16) -> Self {
        Self {
            raw: format!("tcp://{}:{}", host, port),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The `<host>:<port>` part, suitable for `TcpStream::connect`.
    pub fn authority(&self) -> &str {
        self.raw.strip_prefix("tcp://").expect("validated at construction")
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

pub(crate) struct BoundListener {
    pub endpoint: Endpoint,
    pub incoming: mpsc::Receiver<Message>,
}

/// Bind the container's listening socket and spawn the accept loop. Prefers a shared socket fd
/// for a fixed port when the supervisor passed one; otherwise binds locally, with retries on
/// EADDRINUSE and a random port when none is configured.
pub(crate) async fn bind(config: &RpcConfig, shutdown: ShutdownSignal) -> Result<BoundListener, TransportError> {
    let (listener, port) = bind_listener(config).await?;
    let endpoint = Endpoint::from_parts(&config.ip, port);
    let (tx, rx) = mpsc::channel(config.outbound_buffer_size);
    tokio::spawn(accept_loop(
        listener,
        tx,
        config.max_envelope_size,
        shutdown,
        endpoint.clone(),
    ));
    Ok(BoundListener {
        endpoint,
        incoming: rx,
    })
}

async fn bind_listener(config: &RpcConfig) -> Result<(TcpListener, u16), TransportError> {
    let mut attempts = 0;
    loop {
        let port = config
            .port
            .unwrap_or_else(|| rand::thread_rng().gen_range(RANDOM_PORT_RANGE));

        if let Some(fixed_port) = config.port {
            match sockets::take_shared_listener(fixed_port) {
                Ok(std_listener) => {
                    std_listener.set_nonblocking(true)?;
                    let listener = TcpListener::from_std(std_listener)?;
                    log::info!(target: LOG_TARGET, "using shared socket for port {}", fixed_port);
                    return Ok((listener, fixed_port));
                },
                Err(err @ SocketError::InvalidFdMap(_)) => {
                    log::warn!(target: LOG_TARGET, "{}; falling back to local bind", err);
                },
                Err(err) => {
                    log::debug!(target: LOG_TARGET, "{}; binding locally", err);
                },
            }
        }

        match TcpListener::bind((config.ip.as_str(), port)).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                return Ok((listener, port));
            },
            Err(err) if err.kind() == io::ErrorKind::AddrInUse && attempts < config.bind_max_retries => {
                attempts += 1;
                log::info!(
                    target: LOG_TARGET,
                    "failed to bind to port {} (in use), trying again",
                    port
                );
                tokio::time::sleep(config.bind_retry_delay).await;
            },
            Err(err) => {
                return Err(TransportError::BindFailed {
                    attempts: attempts + 1,
                    last_error: err,
                });
            },
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<Message>,
    max_envelope_size: usize,
    mut shutdown: ShutdownSignal,
    endpoint: Endpoint,
) {
    log::debug!(target: LOG_TARGET, "listening on {}", endpoint);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::debug!(target: LOG_TARGET, "accepted stream from {}", peer);
                    tokio::spawn(read_stream(stream, tx.clone(), max_envelope_size, shutdown.clone()));
                },
                Err(err) => {
                    log::warn!(target: LOG_TARGET, "accept failed: {}", err);
                },
            },
        }
    }
    log::debug!(target: LOG_TARGET, "listener on {} shut down", endpoint);
}

async fn read_stream(
    stream: TcpStream,
    tx: mpsc::Sender<Message>,
    max_envelope_size: usize,
    mut shutdown: ShutdownSignal,
) {
    let mut framed = FramedRead::new(stream, MultipartCodec::new(max_envelope_size));
    loop {
        let frames = tokio::select! {
            _ = shutdown.wait() => break,
            maybe = framed.next() => match maybe {
                Some(Ok(frames)) => frames,
                Some(Err(CodecError::EnvelopeTooLarge { size, max })) => {
                    log::warn!(target: LOG_TARGET, "dropping stream: envelope of {} bytes exceeds {}", size, max);
                    break;
                },
                Some(Err(err)) => {
                    log::warn!(target: LOG_TARGET, "stream read failed: {}", err);
                    break;
                },
                None => break,
            },
        };
        match Message::unpack_frames(&frames) {
            Ok(msg) => {
                if tx.send(msg).await.is_err() {
                    break;
                }
            },
            Err(err) => {
                // Bad frames are discarded; the stream itself stays up.
                let msg_id = frames.get(1).map(|f| String::from_utf8_lossy(f).into_owned());
                log::warn!(
                    target: LOG_TARGET,
                    "bad message format: {} (msg-id={:?})",
                    err,
                    msg_id
                );
            },
        }
    }
}

/// Spawn the writer task for an outbound link and return its queue. The task dials lazily and
/// redials with backoff; it ends when the queue is dropped or the signal triggers.
pub(crate) fn spawn_writer(
    endpoint: Endpoint,
    mut shutdown: ShutdownSignal,
    buffer_size: usize,
    max_envelope_size: usize,
) -> mpsc::Sender<Message> {
    let (tx, mut rx) = mpsc::channel::<Message>(buffer_size);
    tokio::spawn(async move {
        'connect: loop {
            let stream = tokio::select! {
                _ = shutdown.wait() => break,
                stream = dial(&endpoint) => stream,
            };
            let mut framed = FramedWrite::new(stream, MultipartCodec::new(max_envelope_size));
            loop {
                let msg = tokio::select! {
                    _ = shutdown.wait() => break 'connect,
                    maybe = rx.recv() => match maybe {
                        Some(msg) => msg,
                        None => break 'connect,
                    },
                };
                let frames = match msg.pack_frames() {
                    Ok(frames) => frames,
                    Err(err) => {
                        log::warn!(target: LOG_TARGET, "failed to pack message for {}: {}", endpoint, err);
                        continue;
                    },
                };
                if let Err(err) = framed.send(frames).await {
                    log::warn!(
                        target: LOG_TARGET,
                        "write to {} failed ({}), redialling",
                        endpoint,
                        err
                    );
                    continue 'connect;
                }
            }
        }
        log::debug!(target: LOG_TARGET, "writer for {} ended", endpoint);
    });
    tx
}

async fn dial(endpoint: &Endpoint) -> TcpStream {
    let mut backoff = DIAL_BACKOFF_INITIAL;
    loop {
        match TcpStream::connect(endpoint.authority()).await {
            Ok(stream) => {
                log::debug!(target: LOG_TARGET, "connected to {}", endpoint);
                return stream;
            },
            Err(err) => {
                log::debug!(
                    target: LOG_TARGET,
                    "dial {} failed ({}), retrying in {:?}",
                    endpoint,
                    err,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(DIAL_BACKOFF_MAX);
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_valid_endpoints() {
        let ep = Endpoint::parse("tcp://127.0.0.1:4321").unwrap();
        assert_eq!(ep.as_str(), "tcp://127.0.0.1:4321");
        assert_eq!(ep.authority(), "127.0.0.1:4321");
    }

    #[test]
    fn rejects_invalid_endpoints() {
        for bad in ["127.0.0.1:4321", "tcp://", "tcp://:80", "tcp://host", "tcp://host:notaport"] {
            assert!(Endpoint::parse(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[tokio::test]
    async fn bind_and_deliver() {
        let config = RpcConfig::default();
        let shutdown = hive_shutdown::Shutdown::new();
        let mut bound = bind(&config, shutdown.to_signal()).await.unwrap();

        let writer = spawn_writer(bound.endpoint.clone(), shutdown.to_signal(), 8, config.max_envelope_size);
        let msg = Message::request("echo.echo", bound.endpoint.as_str(), Default::default(), &()).unwrap();
        writer.send(msg.clone()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), bound.incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id(), msg.id());
        assert_eq!(received.subject(), "echo.echo");
    }

    #[tokio::test]
    async fn random_ports_are_distinct() {
        let config = RpcConfig::default();
        let shutdown = hive_shutdown::Shutdown::new();
        let a = bind(&config, shutdown.to_signal()).await.unwrap();
        let b = bind(&config, shutdown.to_signal()).await.unwrap();
        assert_ne!(a.endpoint, b.endpoint);
    }
}
