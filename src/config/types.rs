// Configuration types module
// Defines all configuration-related data structures

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server loop configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Literal IPv4/IPv6 address to bind
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pending-accept queue length of the listening socket
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Upper bound on one poll wait, so stop requests are noticed
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Receive buffer size in payload units
    #[serde(default = "default_read_buffer_units")]
    pub read_buffer_units: usize,
    /// Worker threads of the demo binary's runtime (CPU cores when unset)
    #[serde(default)]
    pub workers: Option<usize>,
}

#[allow(clippy::missing_const_for_fn)]
fn default_host() -> String {
    "127.0.0.1".to_string()
}

#[allow(clippy::missing_const_for_fn)]
fn default_port() -> u16 {
    9000
}

#[allow(clippy::missing_const_for_fn)]
fn default_backlog() -> i32 {
    6
}

#[allow(clippy::missing_const_for_fn)]
fn default_poll_timeout_ms() -> u64 {
    100
}

#[allow(clippy::missing_const_for_fn)]
fn default_read_buffer_units() -> usize {
    8
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            poll_timeout_ms: default_poll_timeout_ms(),
            read_buffer_units: default_read_buffer_units(),
            workers: None,
        }
    }
}

/// Transport engine tuning
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Packet payload unit; live-mode messages may not exceed it
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Silence from the peer after which a connection is broken
    #[serde(default = "default_peer_idle_timeout_ms")]
    pub peer_idle_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_handshake_retry_ms")]
    pub handshake_retry_ms: u64,
    /// How long a closed socket stays visible before it no longer exists
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// Receive queue length in messages
    #[serde(default = "default_receive_buffer")]
    pub receive_buffer: usize,
    /// Delivery delay in timestamp-based delivery mode
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

#[allow(clippy::missing_const_for_fn)]
fn default_payload_size() -> usize {
    1316
}

#[allow(clippy::missing_const_for_fn)]
fn default_connect_timeout_ms() -> u64 {
    3000
}

#[allow(clippy::missing_const_for_fn)]
fn default_peer_idle_timeout_ms() -> u64 {
    5000
}

#[allow(clippy::missing_const_for_fn)]
fn default_keepalive_interval_ms() -> u64 {
    1000
}

#[allow(clippy::missing_const_for_fn)]
fn default_handshake_retry_ms() -> u64 {
    250
}

#[allow(clippy::missing_const_for_fn)]
fn default_linger_ms() -> u64 {
    1000
}

#[allow(clippy::missing_const_for_fn)]
fn default_receive_buffer() -> usize {
    8192
}

#[allow(clippy::missing_const_for_fn)]
fn default_latency_ms() -> u64 {
    120
}

#[allow(clippy::missing_const_for_fn)]
fn default_worker_threads() -> usize {
    2
}

impl TransportConfig {
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub const fn peer_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_idle_timeout_ms)
    }

    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub const fn handshake_retry(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_ms)
    }

    pub const fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub const fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            payload_size: default_payload_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            peer_idle_timeout_ms: default_peer_idle_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            handshake_retry_ms: default_handshake_retry_ms(),
            linger_ms: default_linger_ms(),
            receive_buffer: default_receive_buffer(),
            latency_ms: default_latency_ms(),
            worker_threads: default_worker_threads(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "rust_rudp=debug"
    #[serde(default = "default_level")]
    pub level: String,
    /// Info log file path (optional, stdout if not set)
    #[serde(default)]
    pub info_log_file: Option<String>,
    /// Error log file path (optional, stderr if not set)
    #[serde(default)]
    pub error_log_file: Option<String>,
}

#[allow(clippy::missing_const_for_fn)]
fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            info_log_file: None,
            error_log_file: None,
        }
    }
}
