//! Transport engine
//!
//! A small message-oriented reliable-datagram engine over UDP. It exposes the
//! capability set the socket, poll and server layers are built on:
//! - socket lifecycle (create, bind, listen, connect, accept, close)
//! - message send/receive with blocking or non-blocking semantics
//! - socket options and live state queries
//! - readiness poll groups
//! - traffic counters
//!
//! Every socket record lives in one table behind a single mutex. Blocking
//! calls park on a condition variable that is signalled on every readiness
//! change, so no lock is held while a caller waits.

mod driver;
mod epoll;
mod options;
mod packet;
mod state;
mod table;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Notify;

pub use epoll::{Events, PollEvent};
pub use options::{
    validate_passphrase, validate_stream_id, OptionName, SocketOption, TransmissionType,
    PASSPHRASE_MAX_LEN, PASSPHRASE_MIN_LEN, STREAM_ID_MAX_LEN,
};
pub use state::SocketState;

use crate::config::TransportConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::stats::Stats;
use options::Options;
use packet::{Handshake, Packet};
use table::{Connecting, Io, ListenerState, SocketEntry, Table};

/// Largest message accepted in file mode.
pub const FILE_MAX_MESSAGE: usize = 65_000;
/// Reported segment size.
const MSS: u64 = 1500;
/// Longest wait between attempts when the OS send buffer is full.
const SEND_RETRY: Duration = Duration::from_millis(1);

/// Engine socket identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) i32);

impl SocketId {
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Engine poll group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollId(pub(crate) i32);

impl fmt::Display for PollId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poll#{}", self.0)
    }
}

/// What a listener learns about a peer before the handshake completes.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub listener: SocketId,
    pub peer: SocketAddr,
    pub version: u32,
    pub stream_id: String,
}

/// Accept gate consulted during the handshake. Returning false rejects the peer.
pub type ListenCallback = Arc<dyn Fn(&HandshakeInfo) -> bool + Send + Sync>;

pub(crate) struct Shared {
    table: Mutex<Table>,
    changed: Condvar,
    config: TransportConfig,
    handle: Handle,
}

impl Shared {
    fn wake(&self) {
        self.changed.notify_all();
    }

    /// Park until the next send attempt of a blocking sender.
    ///
    /// Wakes early on any state change. Fails once the socket is no longer connected.
    fn await_send_retry(&self, id: SocketId) -> Result<()> {
        let mut table = self.table.lock();
        match table.socket(id)?.state {
            SocketState::Connected => {}
            SocketState::Broken => return Err(Error::transport(ErrorCode::ConnLost)),
            _ => return Err(Error::transport(ErrorCode::InvSock)),
        }
        self.changed.wait_for(&mut table, SEND_RETRY);
        Ok(())
    }

    /// Largest message a socket may send in the given mode.
    const fn message_limit(&self, trans_type: TransmissionType) -> usize {
        match trans_type {
            TransmissionType::Live => self.config.payload_size,
            TransmissionType::File => FILE_MAX_MESSAGE,
        }
    }
}

struct EngineInner {
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Cloneable handle to one transport engine instance.
///
/// The engine runs its socket drivers on a private tokio runtime, which is
/// shut down when the last handle goes away.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.shared().table.lock();
        f.debug_struct("Engine")
            .field("sockets", &table.sockets.len())
            .field("polls", &table.polls.len())
            .finish()
    }
}

impl Engine {
    pub fn new() -> Result<Self> {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Result<Self> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder
            .enable_all()
            .thread_name("rudp-engine")
            .worker_threads(config.worker_threads.max(1));
        let runtime = builder.build()?;

        let shared = Arc::new(Shared {
            table: Mutex::new(Table::default()),
            changed: Condvar::new(),
            config,
            handle: runtime.handle().clone(),
        });
        runtime.spawn(driver::reap(Arc::downgrade(&shared)));

        Ok(Self {
            inner: Arc::new(EngineInner {
                shared,
                runtime: Some(runtime),
            }),
        })
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared().config
    }

    /// Packet payload unit used for live-mode messages.
    pub fn payload_size(&self) -> usize {
        self.shared().config.payload_size
    }

    // ---------------------------------------------------------------------
    // Socket lifecycle
    // ---------------------------------------------------------------------

    pub fn create_socket(&self) -> SocketId {
        let shared = self.shared();
        let entry = SocketEntry::new(Options::from_config(&shared.config), Instant::now());
        shared.table.lock().insert_socket(entry)
    }

    /// Live state; unknown ids report `NonExistent`.
    pub fn state(&self, id: SocketId) -> SocketState {
        self.shared()
            .table
            .lock()
            .sockets
            .get(&id)
            .map_or(SocketState::NonExistent, |entry| entry.state)
    }

    pub fn bind(&self, id: SocketId, addr: SocketAddr) -> Result<()> {
        let shared = self.shared();
        Self::check_unbound(shared.table.lock().socket(id)?.state)?;

        let (sender, receiver) = shared.open_io(addr).map_err(|err| {
            Error::transport_with(ErrorCode::SockFail, format!("cannot bind {addr}: {err}"))
        })?;
        let local = receiver.local_addr()?;
        let stop = Arc::new(Notify::new());

        {
            let mut table = shared.table.lock();
            let entry = table.socket_mut(id)?;
            Self::check_unbound(entry.state)?;
            entry.local = Some(local);
            entry.io = Some(Io {
                sender,
                stop: Arc::clone(&stop),
            });
            entry.set_state(SocketState::Opened);
        }
        shared.spawn_driver(id, receiver, stop);
        tracing::debug!(socket = %id, %local, "socket bound");
        Ok(())
    }

    fn check_unbound(state: SocketState) -> Result<()> {
        match state {
            SocketState::Ready => Ok(()),
            SocketState::Opened | SocketState::Listening => {
                Err(Error::transport(ErrorCode::BoundSock))
            }
            SocketState::Connecting | SocketState::Connected => {
                Err(Error::transport(ErrorCode::ConnSock))
            }
            _ => Err(Error::transport(ErrorCode::InvSock)),
        }
    }

    pub fn listen(&self, id: SocketId, backlog: i32) -> Result<()> {
        let backlog = usize::try_from(backlog)
            .ok()
            .filter(|backlog| *backlog > 0)
            .ok_or_else(|| Error::transport(ErrorCode::InvParam))?;

        let shared = self.shared();
        let mut table = shared.table.lock();
        let entry = table.socket_mut(id)?;
        match entry.state {
            SocketState::Opened => {
                entry.listener = Some(ListenerState::new(backlog));
                entry.set_state(SocketState::Listening);
                Ok(())
            }
            SocketState::Listening => {
                if let Some(listener) = entry.listener.as_mut() {
                    listener.backlog = backlog;
                }
                Ok(())
            }
            SocketState::Ready => Err(Error::transport(ErrorCode::UnboundSock)),
            SocketState::Connecting | SocketState::Connected => {
                Err(Error::transport(ErrorCode::ConnSock))
            }
            _ => Err(Error::transport(ErrorCode::InvSock)),
        }
    }

    /// Install or clear the handshake accept gate of a listener.
    pub fn set_listen_callback(&self, id: SocketId, callback: Option<ListenCallback>) -> Result<()> {
        let mut table = self.shared().table.lock();
        let previous = std::mem::replace(&mut table.socket_mut(id)?.listen_callback, callback);
        drop(table);
        drop(previous);
        Ok(())
    }

    /// Start a connection to `addr`, binding to a wildcard address first if needed.
    ///
    /// With receive-sync on this blocks until the handshake completes or
    /// fails; otherwise it returns with the socket in `connecting`.
    pub fn connect(&self, id: SocketId, addr: SocketAddr) -> Result<()> {
        let shared = self.shared();
        let needs_bind = {
            let mut table = shared.table.lock();
            let entry = table.socket_mut(id)?;
            match entry.state {
                SocketState::Ready => true,
                SocketState::Opened => false,
                // a failed attempt may be retried against another address
                SocketState::Broken if entry.connect_error.is_some() => false,
                SocketState::Listening => return Err(Error::transport(ErrorCode::InvOp)),
                SocketState::Connecting | SocketState::Connected => {
                    return Err(Error::transport(ErrorCode::ConnSock))
                }
                _ => return Err(Error::transport(ErrorCode::InvSock)),
            }
        };
        if needs_bind {
            let wildcard = match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            self.bind(id, SocketAddr::new(wildcard, 0))?;
        }

        let now = Instant::now();
        let (sender, request, rcv_syn) = {
            let mut table = shared.table.lock();
            let entry = table.socket_mut(id)?;
            let request = Packet::Handshake(Handshake {
                version: packet::VERSION,
                trans_type: entry.options.trans_type,
                tsbpd: entry.options.tsbpd,
                digest: packet::passphrase_digest(&entry.options.passphrase),
                stream_id: entry.options.stream_id.clone(),
            })
            .encode();
            entry.peer = Some(addr);
            entry.connect_error = None;
            entry.peer_closed = false;
            entry.connecting = Some(Connecting {
                target: addr,
                request: request.clone(),
                started: now,
                last_sent: now,
            });
            entry.set_state(SocketState::Connecting);
            let sender = entry
                .sender()
                .ok_or_else(|| Error::transport(ErrorCode::UnboundSock))?;
            (sender, request, entry.options.rcv_syn)
        };
        shared.wake();
        if let Err(err) = sender.send_to(&request, addr) {
            tracing::debug!(socket = %id, %addr, error = %err, "handshake send failed");
        }

        if !rcv_syn {
            return Ok(());
        }

        let mut table = shared.table.lock();
        loop {
            let entry = table.socket(id)?;
            match entry.state {
                SocketState::Connected => return Ok(()),
                SocketState::Connecting => {}
                SocketState::Broken => {
                    return Err(Error::transport(
                        entry.connect_error.unwrap_or(ErrorCode::ConnFail),
                    ))
                }
                _ => return Err(Error::transport(ErrorCode::ConnFail)),
            }
            shared
                .changed
                .wait_for(&mut table, shared.config.handshake_retry());
        }
    }

    /// Take the next accepted connection from a listener.
    pub fn accept(&self, id: SocketId) -> Result<SocketId> {
        let shared = self.shared();
        let mut table = shared.table.lock();
        loop {
            let entry = table.socket_mut(id)?;
            if entry.state != SocketState::Listening {
                return Err(Error::transport(ErrorCode::NoListen));
            }
            let rcv_syn = entry.options.rcv_syn;
            if let Some(accepted) = entry
                .listener
                .as_mut()
                .and_then(|listener| listener.pending.pop_front())
            {
                return Ok(accepted);
            }
            if !rcv_syn {
                return Err(Error::transport(ErrorCode::AsyncRcv));
            }
            shared.changed.wait(&mut table);
        }
    }

    /// Close a socket. Closing an already closed socket is a no-op.
    pub fn close(&self, id: SocketId) -> Result<()> {
        let shared = self.shared();
        let now = Instant::now();
        let mut teardowns = Vec::new();
        {
            let mut table = shared.table.lock();
            table.socket(id)?;
            let mut queue = vec![id];
            while let Some(next) = queue.pop() {
                if let Some(teardown) = table.mark_closed(next, now) {
                    queue.extend(teardown.pending.iter().copied());
                    teardowns.push(teardown);
                }
            }
        }
        shared.wake();

        let shutdown = Packet::Shutdown.encode();
        for teardown in teardowns {
            drop(teardown.callback);
            if let Some(io) = teardown.io {
                if let Some(peer) = teardown.shutdown_peer {
                    let _ = io.sender.send_to(&shutdown, peer);
                }
                io.stop.notify_one();
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Data transfer
    // ---------------------------------------------------------------------

    /// Send one message. Returns the number of bytes accepted.
    pub fn send(&self, id: SocketId, data: &[u8]) -> Result<usize> {
        let shared = self.shared();
        let now = Instant::now();
        let (sender, peer, wire, snd_syn) = {
            let mut table = shared.table.lock();
            let entry = table.socket_mut(id)?;
            match entry.state {
                SocketState::Connected => {}
                SocketState::Broken => return Err(Error::transport(ErrorCode::ConnLost)),
                SocketState::Closing | SocketState::Closed => {
                    return Err(Error::transport(ErrorCode::InvSock))
                }
                _ => return Err(Error::transport(ErrorCode::NoConn)),
            }
            if data.len() > shared.message_limit(entry.options.trans_type) {
                return Err(Error::transport(ErrorCode::LargeMsg));
            }
            let (Some(sender), Some(peer)) = (entry.sender(), entry.peer) else {
                return Err(Error::transport(ErrorCode::NoConn));
            };

            let seq = entry.next_seq;
            entry.next_seq = entry.next_seq.wrapping_add(1);
            // sender clock wraps every ~71 minutes
            let timestamp = (now.duration_since(entry.created).as_micros() % (1 << 32)) as u32;
            let wire = Packet::Data {
                seq,
                timestamp,
                payload: bytes::Bytes::copy_from_slice(data),
            }
            .encode();
            entry.record_sent(data.len(), now);
            (sender, peer, wire, entry.options.snd_syn)
        };

        loop {
            match sender.send_to(&wire, peer) {
                Ok(_) => return Ok(data.len()),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if !snd_syn {
                        return Err(Error::transport(ErrorCode::AsyncSnd));
                    }
                    shared.await_send_retry(id)?;
                }
                Err(err) => {
                    return Err(Error::transport_with(ErrorCode::ConnFail, err.to_string()))
                }
            }
        }
    }

    /// Receive one message into `buf`, truncating if it does not fit.
    pub fn recv(&self, id: SocketId, buf: &mut [u8]) -> Result<usize> {
        let shared = self.shared();
        let mut table = shared.table.lock();
        loop {
            let now = Instant::now();
            let entry = table.socket_mut(id)?;
            let before = entry.state;
            if let Some(payload) = entry.pop_message(now) {
                let len = payload.len().min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                if entry.state != before {
                    shared.wake();
                }
                return Ok(len);
            }
            match entry.state {
                SocketState::Connected => {}
                SocketState::Broken => return Err(Error::transport(ErrorCode::ConnLost)),
                SocketState::Closing | SocketState::Closed => {
                    return Err(Error::transport(ErrorCode::InvSock))
                }
                _ => return Err(Error::transport(ErrorCode::NoConn)),
            }
            if !entry.options.rcv_syn {
                return Err(Error::transport(ErrorCode::AsyncRcv));
            }
            match entry.next_due(now) {
                Some(due) => {
                    shared.changed.wait_until(&mut table, due);
                }
                None => shared.changed.wait(&mut table),
            }
        }
    }

    // ---------------------------------------------------------------------
    // Options and addresses
    // ---------------------------------------------------------------------

    pub fn set_option(&self, id: SocketId, option: SocketOption) -> Result<()> {
        let mut table = self.shared().table.lock();
        let entry = table.socket_mut(id)?;
        match entry.state {
            SocketState::Connecting | SocketState::Connected
                if option.name().is_pre_connect() =>
            {
                Err(Error::transport(ErrorCode::ConnSock))
            }
            SocketState::Closing | SocketState::Closed => Err(Error::transport(ErrorCode::InvSock)),
            _ => entry.options.set(option),
        }
    }

    pub fn get_option(&self, id: SocketId, name: OptionName) -> Result<SocketOption> {
        let table = self.shared().table.lock();
        Ok(table.socket(id)?.options.get(name))
    }

    pub fn local_addr(&self, id: SocketId) -> Result<SocketAddr> {
        let table = self.shared().table.lock();
        table
            .socket(id)?
            .local
            .ok_or_else(|| Error::transport(ErrorCode::UnboundSock))
    }

    pub fn peer_addr(&self, id: SocketId) -> Result<SocketAddr> {
        let table = self.shared().table.lock();
        let entry = table.socket(id)?;
        match entry.state {
            SocketState::Connected | SocketState::Broken => entry
                .peer
                .ok_or_else(|| Error::transport(ErrorCode::NoConn)),
            _ => Err(Error::transport(ErrorCode::NoConn)),
        }
    }

    /// Snapshot traffic counters, optionally restarting the interval.
    pub fn stats(&self, id: SocketId, clear: bool) -> Result<Stats> {
        let mut table = self.shared().table.lock();
        Ok(table.socket_mut(id)?.snapshot(Instant::now(), clear, MSS))
    }

    // ---------------------------------------------------------------------
    // Poll groups
    // ---------------------------------------------------------------------

    pub fn epoll_create(&self) -> PollId {
        self.shared().table.lock().insert_poll()
    }

    pub fn epoll_release(&self, poll: PollId) -> Result<()> {
        let shared = self.shared();
        let removed = shared.table.lock().polls.remove(&poll);
        shared.wake();
        removed
            .map(|_| ())
            .ok_or_else(|| Error::transport(ErrorCode::InvPollId))
    }

    /// Watch a socket. A socket that is already watched gets its interest replaced.
    pub fn epoll_add(&self, poll: PollId, socket: SocketId, events: Events) -> Result<()> {
        self.epoll_upsert(poll, socket, events)
    }

    /// Replace the interest of a socket and re-arm its writable edge.
    pub fn epoll_update(&self, poll: PollId, socket: SocketId, events: Events) -> Result<()> {
        self.epoll_upsert(poll, socket, events)
    }

    fn epoll_upsert(&self, poll: PollId, socket: SocketId, events: Events) -> Result<()> {
        let shared = self.shared();
        {
            let mut table = shared.table.lock();
            table.socket(socket)?;
            table.poll_mut(poll)?.upsert(socket, events);
        }
        shared.wake();
        Ok(())
    }

    /// Stop watching a socket. Removing a socket that is not watched is not an error.
    pub fn epoll_remove(&self, poll: PollId, socket: SocketId) -> Result<()> {
        let mut table = self.shared().table.lock();
        table.poll_mut(poll)?.remove(socket);
        Ok(())
    }

    /// Wait until at least one watched socket is ready or the timeout expires.
    ///
    /// `None` waits indefinitely. At most `capacity` events are returned, in
    /// registration order. The table lock is released while parked.
    pub fn epoll_wait(
        &self,
        poll: PollId,
        capacity: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<PollEvent>> {
        if capacity == 0 {
            return Err(Error::transport(ErrorCode::InvParam));
        }
        let shared = self.shared();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut table = shared.table.lock();
        loop {
            let now = Instant::now();
            let (events, next_due) = table.collect_events(poll, capacity, now)?;
            if !events.is_empty() || deadline.is_some_and(|deadline| now >= deadline) {
                return Ok(events);
            }
            let wake_at = match (deadline, next_due) {
                (Some(deadline), Some(due)) => Some(deadline.min(due)),
                (deadline, due) => deadline.or(due),
            };
            match wake_at {
                Some(at) => {
                    shared.changed.wait_until(&mut table, at);
                }
                None => shared.changed.wait(&mut table),
            }
        }
    }
}
