// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

use std::time::Duration;

use serde::Deserialize;

use crate::serializer::SerializationFormat;

/// Structural error in externally supplied configuration. Aborts container startup.
#[derive(Debug, thiserror::Error)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

/// Top-level configuration for a [`ServiceContainer`](crate::container::ServiceContainer).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Logical name of the service this container runs. Used for log/metric tags.
    pub service_name: Option<String>,
    pub rpc: RpcConfig,
    pub connection: ConnectionConfig,
    pub registry: RegistryConfig,
    pub events: EventsConfig,
    /// Wire format used for message headers, bodies and events.
    pub serialization: SerializationFormat,
    /// Default timeout for proxy calls.
    pub request_timeout: Duration,
    /// Interval at which the metrics aggregator publishes snapshots.
    pub metrics_interval: Duration,
    /// How long `stop()` waits for spawned handlers before aborting them.
    pub shutdown_grace: Duration,
    /// Auxiliary endpoints advertised alongside the RPC endpoint.
    pub log_endpoint: Option<String>,
    pub monitoring_endpoint: Option<String>,
    pub backdoor_endpoint: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            rpc: Default::default(),
            connection: Default::default(),
            registry: Default::default(),
            events: Default::default(),
            serialization: SerializationFormat::MsgPack,
            request_timeout: Duration::from_secs(3),
            metrics_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            log_endpoint: None,
            monitoring_endpoint: None,
            backdoor_endpoint: None,
        }
    }
}

impl ContainerConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.connection.validate()
    }
}

/// Configuration for the RPC server's listening socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub ip: String,
    /// Listening port. `None` picks a random port.
    pub port: Option<u16>,
    pub bind_max_retries: usize,
    pub bind_retry_delay: Duration,
    /// Upper bound for a single multipart envelope on the wire.
    pub max_envelope_size: usize,
    /// Per-connection outbound queue depth.
    pub outbound_buffer_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: None,
            bind_max_retries: 2,
            bind_retry_delay: Duration::from_millis(100),
            max_envelope_size: 4 * 1024 * 1024,
            outbound_buffer_size: 128,
        }
    }
}

/// Configuration for per-peer connection health tracking.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    /// Time since `last_seen` after which a connection is UNRESPONSIVE.
    pub timeout: Duration,
    /// Time since `last_message` after which a connection is IDLE.
    pub idle_timeout: Duration,
    /// Close the connection after being continuously UNRESPONSIVE for this long. `None` disables.
    pub unresponsive_disconnect: Option<Duration>,
    /// Close the connection after being continuously IDLE for this long. `None` disables.
    pub idle_disconnect: Option<Duration>,
    /// Number of heartbeat round-trip samples kept in the rolling window.
    pub sample_window_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(10),
            unresponsive_disconnect: Some(Duration::from_secs(30)),
            idle_disconnect: Some(Duration::from_secs(60)),
            sample_window_size: 100,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.heartbeat_interval >= self.timeout || self.timeout >= self.idle_timeout {
            return Err(ConfigurationError(format!(
                "connection timings must satisfy heartbeat_interval < timeout < idle_timeout (got {:?} / {:?} / \
                 {:?})",
                self.heartbeat_interval, self.timeout, self.idle_timeout
            )));
        }
        if self.sample_window_size == 0 {
            return Err(ConfigurationError("sample_window_size must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Configuration for the service registry client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root path prepended to all coordinator paths.
    pub chroot: String,
    /// Namespace under which local interfaces are advertised. Plugins may use their own.
    pub namespace: String,
    pub lookup_timeout: Duration,
    pub register_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            chroot: "/hive".to_string(),
            namespace: "services".to_string(),
            lookup_timeout: Duration::from_secs(1),
            register_timeout: Duration::from_secs(1),
        }
    }
}

/// Configuration for the broker-backed event system.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Name of the main topic exchange. The delay exchange is `<exchange>_waiting`.
    pub exchange: String,
    pub connect_max_retries: usize,
    /// Buffer size of each consumer's delivery channel.
    pub consumer_buffer_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            exchange: "hive".to_string(),
            connect_max_retries: 3,
            consumer_buffer_size: 16,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ContainerConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_timeouts() {
        let config = ConnectionConfig {
            heartbeat_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
