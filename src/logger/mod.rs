//! Logger module
//!
//! Provides logging utilities for the transport and server including:
//! - Subscriber setup (level filter, local timestamps, file targets)
//! - Server lifecycle logging
//! - Connection accept/reject/teardown logging
//! - Engine handshake and liveness warnings

pub mod writer;

use std::fmt;
use std::net::SocketAddr;

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use crate::config::{LoggingConfig, ServerConfig};
use crate::engine::SocketId;
use crate::error::{Error, ErrorCode};
use crate::stats::Stats;

/// Local wall-clock timestamps
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Initialize the logger with configuration
///
/// Should be called once at application startup.
pub fn init(config: &LoggingConfig) -> std::io::Result<()> {
    let writer = writer::LogWriter::new(
        config.info_log_file.as_deref(),
        config.error_log_file.as_deref(),
    )?;
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalTimer)
        .with_writer(writer)
        .with_ansi(config.info_log_file.is_none() && config.error_log_file.is_none())
        .with_target(false)
        .try_init()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::AlreadyExists, e.to_string()))
}

pub fn log_server_start(addr: &SocketAddr, server: &ServerConfig, logging: &LoggingConfig) {
    tracing::info!("======================================");
    tracing::info!("Reliable UDP server started");
    tracing::info!("Listening on: {addr}");
    tracing::info!("Backlog: {}", server.backlog);
    tracing::info!("Poll timeout: {}ms", server.poll_timeout_ms);
    tracing::info!("Log level: {}", logging.level);
    if let Some(ref path) = logging.info_log_file {
        tracing::info!("Info log: {path}");
    }
    if let Some(ref path) = logging.error_log_file {
        tracing::info!("Error log: {path}");
    }
    tracing::info!("======================================");
}

pub fn log_server_listening(listener: SocketId, addr: &SocketAddr) {
    tracing::debug!(%listener, "[Server] Listening on {addr}");
}

pub fn log_server_stopped(reason: &str, remaining: usize) {
    tracing::info!("[Server] Loop stopped ({reason}), {remaining} connection(s) open");
}

pub fn log_server_closed() {
    tracing::info!("[Server] Closed");
}

pub fn log_connection_accepted(socket: SocketId, peer: Option<&SocketAddr>, count: usize) {
    match peer {
        Some(peer) => tracing::info!("[Connection] {socket} accepted from {peer} (active: {count})"),
        None => tracing::info!("[Connection] {socket} accepted (active: {count})"),
    }
}

pub fn log_connection_rejected(socket: SocketId, count: usize) {
    tracing::info!("[Connection] {socket} rejected by acceptor (active: {count})");
}

pub fn log_connection_closed(socket: SocketId, count: usize) {
    tracing::info!("[Connection] {socket} closed (active: {count})");
}

pub fn log_connection_stats(socket: SocketId, stats: &Stats) {
    tracing::info!(
        "[Stats] {socket} sent {} pkts / {} bytes, received {} pkts / {} bytes, dropped {}",
        stats.pkt_sent_total,
        stats.byte_sent_total,
        stats.pkt_recv_total,
        stats.byte_recv_total,
        stats.pkt_rcv_drop_total
    );
}

pub fn log_receive_skipped(socket: SocketId, err: &Error) {
    tracing::debug!("[Connection] {socket} receive skipped: {err}");
}

pub fn log_stale_event(socket: SocketId) {
    tracing::debug!("[Poll] Dropping event for unregistered socket {socket}");
}

pub fn log_callback_panic(callback: &str, socket: SocketId) {
    tracing::error!("[ERROR] {callback} callback panicked for {socket}");
}

pub fn log_counter_underflow() {
    tracing::error!("[BUG] Live connection counter would go negative");
}

pub fn log_handshake_rejected(listener: SocketId, peer: &SocketAddr, code: ErrorCode) {
    tracing::warn!("[Handshake] {listener} rejected {peer}: {code}");
}

pub fn log_connect_timeout(socket: SocketId, target: &SocketAddr) {
    tracing::warn!("[Handshake] {socket} got no answer from {target}");
}

pub fn log_peer_timeout(socket: SocketId, peer: &SocketAddr) {
    tracing::warn!("[Connection] {socket} lost contact with {peer}");
}

pub fn log_signal(name: &str) {
    tracing::info!("[SIGNAL] {name} received, initiating graceful shutdown");
}

pub fn log_error(message: &str) {
    tracing::error!("[ERROR] {message}");
}

pub fn log_warning(message: &str) {
    tracing::warn!("[WARN] {message}");
}
