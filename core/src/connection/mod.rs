// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Per-peer connection records and health tracking.
//!
//! The RPC server owns exactly one [`Connection`] per remote endpoint. Each connection runs two
//! cooperative loops: a heartbeat loop pinging the peer and recording round-trips, and a liveness
//! loop deriving the status from the time since the peer was last seen. A CLOSED connection is
//! never resurrected; reconnecting creates a new record.

use std::{
    fmt,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use hive_shutdown::{Shutdown, ShutdownSignal};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    config::{ConnectionConfig, RpcConfig},
    message::Message,
    metrics,
    rpc::RpcServer,
    stats::{SampleWindow, StatsSummary},
    transport::{self, Endpoint},
};

const LOG_TARGET: &str = "hive::connection";

/// Lower bound for the pause between heartbeats.
const HEARTBEAT_FLOOR: Duration = Duration::from_millis(10);

const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Unknown,
    Responsive,
    Idle,
    Unresponsive,
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Unknown => "unknown",
            ConnectionStatus::Responsive => "responsive",
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Unresponsive => "unresponsive",
            ConnectionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub endpoint: String,
    pub status: String,
    pub rtt_window: StatsSummary,
    pub rtt_total: StatsSummary,
    pub phi: f64,
    pub sent: u64,
    pub received: u64,
    pub heartbeats: u64,
}

struct ConnectionState {
    status: ConnectionStatus,
    last_seen: Option<Instant>,
    last_message: Instant,
    idle_since: Option<Instant>,
    unresponsive_since: Option<Instant>,
    heartbeat_samples: SampleWindow,
    heartbeat_count: u64,
    sent_count: u64,
    received_count: u64,
}

pub struct Connection {
    endpoint: Endpoint,
    config: ConnectionConfig,
    created_at: Instant,
    server: Weak<RpcServer>,
    outbound: mpsc::Sender<Message>,
    state: Mutex<ConnectionState>,
    shutdown: Mutex<Shutdown>,
}

impl Connection {
    /// Create the connection record, its writer task and both health loops.
    pub(crate) fn spawn(
        server: &Arc<RpcServer>,
        endpoint: Endpoint,
        config: ConnectionConfig,
        rpc_config: &RpcConfig,
        container_signal: ShutdownSignal,
    ) -> Arc<Self> {
        let shutdown = Shutdown::new();
        let signal = shutdown.to_signal();
        // The writer shares the connection's shutdown so closing the connection drops the link
        let outbound = transport::spawn_writer(
            endpoint.clone(),
            signal.clone(),
            rpc_config.outbound_buffer_size,
            rpc_config.max_envelope_size,
        );
        let conn = Arc::new(Self {
            endpoint,
            created_at: Instant::now(),
            server: Arc::downgrade(server),
            outbound,
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Unknown,
                last_seen: None,
                last_message: Instant::now(),
                idle_since: None,
                unresponsive_since: None,
                heartbeat_samples: SampleWindow::new(config.sample_window_size, 1000.0),
                heartbeat_count: 0,
                sent_count: 0,
                received_count: 0,
            }),
            config,
            shutdown: Mutex::new(shutdown),
        });
        tokio::spawn(Arc::clone(&conn).heartbeat_loop(signal.clone(), container_signal.clone()));
        tokio::spawn(Arc::clone(&conn).liveness_loop(signal, container_signal));
        conn
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().expect("connection state lock poisoned").status
    }

    /// A connection is alive unless it is known to be unresponsive or closed.
    pub fn is_alive(&self) -> bool {
        matches!(
            self.status(),
            ConnectionStatus::Responsive | ConnectionStatus::Idle | ConnectionStatus::Unknown
        )
    }

    /// The phi liveness estimator: `-log10` of the probability of the current heartbeat gap
    /// under the observed inter-arrival distribution. Infinite when the gap is impossible under
    /// the fit. Operator-facing; does not drive state transitions.
    pub fn phi(&self) -> f64 {
        let state = self.state.lock().expect("connection state lock poisoned");
        let dt = match state.last_seen {
            Some(last_seen) => last_seen.elapsed().as_secs_f64(),
            None => return 0.0,
        };
        let p = state.heartbeat_samples.p(dt);
        if p == 0.0 {
            return f64::INFINITY;
        }
        -p.log10()
    }

    pub fn stats(&self) -> ConnectionStats {
        let phi = self.phi();
        let state = self.state.lock().expect("connection state lock poisoned");
        ConnectionStats {
            endpoint: self.endpoint.to_string(),
            status: state.status.to_string(),
            rtt_window: state.heartbeat_samples.stats(),
            rtt_total: state.heartbeat_samples.total().stats(),
            phi,
            sent: state.sent_count,
            received: state.received_count,
            heartbeats: state.heartbeat_count,
        }
    }

    /// Queue a message on this connection's outbound link.
    pub(crate) async fn send(&self, msg: Message) -> Result<(), mpsc::error::SendError<Message>> {
        self.on_send(&msg);
        self.outbound.send(msg).await
    }

    pub(crate) fn on_send(&self, msg: &Message) {
        let mut state = self.state.lock().expect("connection state lock poisoned");
        if !msg.is_idle_chatter() {
            state.last_message = Instant::now();
        }
        state.sent_count += 1;
    }

    pub(crate) fn on_recv(&self, msg: &Message) {
        let mut state = self.state.lock().expect("connection state lock poisoned");
        let now = Instant::now();
        state.last_seen = Some(now);
        if !msg.is_idle_chatter() {
            state.last_message = now;
        }
        state.received_count += 1;
    }

    /// Close the connection. Idempotent: the first call transitions to CLOSED, cancels both
    /// loops and removes the record from the server's table; concurrent calls are no-ops.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().expect("connection state lock poisoned");
            if state.status == ConnectionStatus::Closed {
                return;
            }
            state.status = ConnectionStatus::Closed;
        }
        self.shutdown.lock().expect("connection shutdown lock poisoned").trigger();
        if let Some(server) = self.server.upgrade() {
            server.forget_connection(&self.endpoint);
        }
        log::debug!(target: LOG_TARGET, "closed connection to {}", self.endpoint);
    }

    async fn heartbeat_loop(self: Arc<Self>, mut signal: ShutdownSignal, mut container_signal: ShutdownSignal) {
        loop {
            let started = Instant::now();
            let Some(server) = self.server.upgrade() else { break };
            tokio::select! {
                _ = signal.wait() => break,
                _ = container_signal.wait() => break,
                _ = self.ping_once(server, started) => {},
            }
            let took = started.elapsed();
            let delay = self.config.heartbeat_interval.saturating_sub(took).max(HEARTBEAT_FLOOR);
            tokio::select! {
                _ = signal.wait() => break,
                _ = container_signal.wait() => break,
                _ = tokio::time::sleep(delay) => {},
            }
        }
        log::trace!(target: LOG_TARGET, "heartbeat loop for {} ended", self.endpoint);
    }

    async fn ping_once(&self, server: Arc<RpcServer>, started: Instant) {
        let channel = match server.ping(self.endpoint.clone()).await {
            Ok(channel) => channel,
            Err(err) => {
                log::debug!(target: LOG_TARGET, "heartbeat send to {} failed: {}", self.endpoint, err);
                return;
            },
        };
        drop(server);
        match channel.get(self.config.heartbeat_interval).await {
            Ok(_) => {
                let rtt = started.elapsed();
                let mut state = self.state.lock().expect("connection state lock poisoned");
                state.heartbeat_samples.add(rtt.as_secs_f64());
                state.heartbeat_count += 1;
                drop(state);
                metrics::heartbeats_total().inc();
            },
            Err(err) => {
                log::debug!(target: LOG_TARGET, "heartbeat error on {}: {}", self, err);
            },
        }
    }

    async fn liveness_loop(self: Arc<Self>, mut signal: ShutdownSignal, mut container_signal: ShutdownSignal) {
        loop {
            tokio::select! {
                _ = signal.wait() => break,
                _ = container_signal.wait() => break,
                _ = tokio::time::sleep(LIVENESS_CHECK_INTERVAL) => {},
            }
            self.update_status();
            if self.should_disconnect() {
                log::info!(
                    target: LOG_TARGET,
                    "disconnecting {} ({})",
                    self.endpoint,
                    self.status()
                );
                self.close();
                break;
            }
            self.log_stats();
        }
        log::trace!(target: LOG_TARGET, "liveness loop for {} ended", self.endpoint);
    }

    fn update_status(&self) {
        let mut state = self.state.lock().expect("connection state lock poisoned");
        if state.status == ConnectionStatus::Closed {
            return;
        }
        // Until the peer is seen once, the status stays UNKNOWN
        let Some(last_seen) = state.last_seen else { return };
        let now = Instant::now();
        if now.duration_since(last_seen) >= self.config.timeout {
            if state.status != ConnectionStatus::Unresponsive {
                state.unresponsive_since = Some(now);
            }
            state.status = ConnectionStatus::Unresponsive;
        } else if now.duration_since(state.last_message) >= self.config.idle_timeout {
            if state.status != ConnectionStatus::Idle {
                state.idle_since = Some(now);
            }
            state.status = ConnectionStatus::Idle;
        } else {
            state.status = ConnectionStatus::Responsive;
            state.unresponsive_since = None;
            state.idle_since = None;
        }
    }

    fn should_disconnect(&self) -> bool {
        let state = self.state.lock().expect("connection state lock poisoned");
        match state.status {
            ConnectionStatus::Unresponsive => match (self.config.unresponsive_disconnect, state.unresponsive_since) {
                (Some(limit), Some(since)) => since.elapsed() >= limit,
                _ => false,
            },
            ConnectionStatus::Idle => match (self.config.idle_disconnect, state.idle_since) {
                (Some(limit), Some(since)) => since.elapsed() >= limit,
                _ => false,
            },
            _ => false,
        }
    }

    fn log_stats(&self) {
        if log::log_enabled!(target: LOG_TARGET, log::Level::Debug) {
            let stats = self.stats();
            log::debug!(
                target: LOG_TARGET,
                "endpoint={}; window (mean rtt={:.1} ms; stddev rtt={:.1}); total (mean rtt={:.1} ms; stddev \
                 rtt={:.1}); phi={:.3}; ping/s={:.2}; status={}",
                stats.endpoint,
                stats.rtt_window.mean,
                stats.rtt_window.stddev,
                stats.rtt_total.mean,
                stats.rtt_total.stddev,
                stats.phi,
                stats.heartbeats as f64 / self.created_at.elapsed().as_secs_f64().max(1.0),
                stats.status,
            );
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last_seen = self
            .state
            .lock()
            .expect("connection state lock poisoned")
            .last_seen
            .map(|t| t.elapsed());
        match last_seen {
            Some(dt) => write!(f, "connection to={} last_seen={:?} ago", self.endpoint, dt),
            None => write!(f, "connection to={} never seen", self.endpoint),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_display() {
        assert_eq!(ConnectionStatus::Responsive.to_string(), "responsive");
        assert_eq!(ConnectionStatus::Closed.to_string(), "closed");
    }
}
