// Socket driver module
// One task per bound socket: datagram intake, handshake admission and timers

use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};

use super::options::Options;
use super::packet::{self, Handshake, Packet};
use super::state::SocketState;
use super::table::{Io, SocketEntry, Table};
use super::{HandshakeInfo, ListenCallback, Shared, SocketId};
use crate::error::ErrorCode;
use crate::logger;

/// Timer granularity of a driver.
const TICK: Duration = Duration::from_millis(50);
/// How often closed sockets are checked for expired linger.
const REAP_INTERVAL: Duration = Duration::from_millis(50);
/// Receive buffer for one datagram.
const MAX_DATAGRAM: usize = 65_536;

/// Outcome of checking a handshake request against a listener.
enum Screening {
    Ignore,
    /// Already admitted: repeat the accept from the accepted socket.
    Resend(Arc<StdUdpSocket>),
    Reject(Arc<StdUdpSocket>, ErrorCode),
    Admit {
        callback: Option<ListenCallback>,
        template: Options,
        bind_addr: SocketAddr,
        reply: Arc<StdUdpSocket>,
    },
}

impl Table {
    fn screen(&self, listener: SocketId, request: &Handshake, from: SocketAddr) -> Screening {
        let Some(entry) = self.sockets.get(&listener) else {
            return Screening::Ignore;
        };
        let (Some(listening), Some(reply), Some(local)) =
            (entry.listener.as_ref(), entry.sender(), entry.local)
        else {
            return Screening::Ignore;
        };
        if entry.state != SocketState::Listening {
            return Screening::Ignore;
        }

        if let Some(existing) = listening
            .peers
            .get(&from)
            .and_then(|id| self.sockets.get(id))
            .filter(|accepted| accepted.state == SocketState::Connected)
        {
            if let Some(sender) = existing.sender() {
                return Screening::Resend(sender);
            }
        }

        if request.version != packet::VERSION {
            return Screening::Reject(reply, ErrorCode::ConnRej);
        }
        if packet::passphrase_digest(&entry.options.passphrase) != request.digest {
            return Screening::Reject(reply, ErrorCode::SecFail);
        }
        // both ends must use the same transmission mode
        if request.trans_type != entry.options.trans_type {
            return Screening::Reject(reply, ErrorCode::ConnRej);
        }
        if listening.pending.len() >= listening.backlog {
            return Screening::Reject(reply, ErrorCode::ConnRej);
        }

        let mut template = entry.options.clone();
        template.tsbpd |= request.tsbpd;
        Screening::Admit {
            callback: entry.listen_callback.clone(),
            template,
            bind_addr: SocketAddr::new(local.ip(), 0),
            reply,
        }
    }
}

impl Shared {
    /// Create a non-blocking UDP socket bound to `addr`.
    ///
    /// Returns a synchronous send handle and the async receive half used by the driver.
    pub(super) fn open_io(
        &self,
        addr: SocketAddr,
    ) -> std::io::Result<(Arc<StdUdpSocket>, UdpSocket)> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let std_socket: StdUdpSocket = socket.into();
        let sender = std_socket.try_clone()?;
        let _guard = self.handle.enter();
        let receiver = UdpSocket::from_std(std_socket)?;
        Ok((Arc::new(sender), receiver))
    }

    pub(super) fn spawn_driver(self: &Arc<Self>, id: SocketId, io: UdpSocket, stop: Arc<Notify>) {
        self.handle.spawn(run(Arc::clone(self), id, io, stop));
    }

    fn on_datagram(self: &Arc<Self>, id: SocketId, datagram: &[u8], from: SocketAddr) {
        let Some(packet) = Packet::decode(datagram) else {
            tracing::debug!(socket = %id, %from, len = datagram.len(), "dropping foreign datagram");
            return;
        };
        if let Packet::Handshake(request) = packet {
            self.admit(id, &request, from);
            return;
        }

        let changed = {
            let mut table = self.table.lock();
            let Ok(entry) = table.socket_mut(id) else {
                return;
            };
            entry.on_packet(packet, from, Instant::now(), self.config.receive_buffer)
        };
        if changed {
            self.wake();
        }
    }

    /// Handle a connection request arriving at a listener.
    fn admit(self: &Arc<Self>, listener: SocketId, request: &Handshake, from: SocketAddr) {
        let screening = self.table.lock().screen(listener, request, from);
        let accept = Packet::Accept {
            version: packet::VERSION,
        }
        .encode();

        match screening {
            Screening::Ignore => {}
            Screening::Resend(sender) => send_quietly(&sender, &accept, from),
            Screening::Reject(reply, code) => self.reject(listener, &reply, from, code),
            Screening::Admit {
                callback,
                template,
                bind_addr,
                reply,
            } => {
                let info = HandshakeInfo {
                    listener,
                    peer: from,
                    version: request.version,
                    stream_id: request.stream_id.clone(),
                };
                if !run_listen_callback(callback.as_ref(), &info) {
                    self.reject(listener, &reply, from, ErrorCode::ConnRej);
                    return;
                }
                match self.open_accepted(listener, from, template, &request.stream_id, bind_addr) {
                    Ok(sender) => send_quietly(&sender, &accept, from),
                    Err(code) => self.reject(listener, &reply, from, code),
                }
            }
        }
    }

    fn reject(&self, listener: SocketId, reply: &StdUdpSocket, peer: SocketAddr, code: ErrorCode) {
        logger::log_handshake_rejected(listener, &peer, code);
        send_quietly(reply, &Packet::Reject { code: code.code() }.encode(), peer);
    }

    /// Create the socket that serves one admitted peer and queue it on the listener.
    fn open_accepted(
        self: &Arc<Self>,
        listener: SocketId,
        peer: SocketAddr,
        mut options: Options,
        stream_id: &str,
        bind_addr: SocketAddr,
    ) -> Result<Arc<StdUdpSocket>, ErrorCode> {
        let (sender, receiver) = self.open_io(bind_addr).map_err(|err| {
            tracing::warn!(%listener, %peer, error = %err, "cannot open accepted socket");
            ErrorCode::SockFail
        })?;
        options.stream_id = stream_id.to_string();

        let now = Instant::now();
        let stop = Arc::new(Notify::new());
        let mut entry = SocketEntry::new(options, now);
        entry.local = receiver.local_addr().ok();
        entry.peer = Some(peer);
        entry.accepted_by = Some(listener);
        entry.io = Some(Io {
            sender: Arc::clone(&sender),
            stop: Arc::clone(&stop),
        });
        entry.set_state(SocketState::Connected);

        let id = {
            let mut table = self.table.lock();
            let still_listening = table
                .sockets
                .get(&listener)
                .is_some_and(|entry| entry.state == SocketState::Listening);
            if !still_listening {
                return Err(ErrorCode::ConnRej);
            }
            let id = table.insert_socket(entry);
            if let Some(listening) = table.sockets.get_mut(&listener) {
                if let Some(state) = listening.listener.as_mut() {
                    state.pending.push_back(id);
                    state.peers.insert(peer, id);
                }
                listening.data_gen += 1;
            }
            id
        };
        self.spawn_driver(id, receiver, stop);
        self.wake();
        tracing::debug!(%listener, socket = %id, %peer, "handshake admitted");
        Ok(sender)
    }

    /// Timer work for one socket. Returns false once the driver should stop.
    fn on_tick(&self, id: SocketId, now: Instant) -> bool {
        let mut outgoing: Option<(Arc<StdUdpSocket>, SocketAddr, Bytes)> = None;
        let mut changed = false;
        {
            let mut table = self.table.lock();
            let Some(entry) = table.sockets.get_mut(&id) else {
                return false;
            };
            match entry.state {
                SocketState::Closed | SocketState::NonExistent => return false,
                SocketState::Connecting => {
                    let timeout = entry.options.connect_timeout;
                    let sender = entry.sender();
                    let mut timed_out = None;
                    if let Some(connecting) = entry.connecting.as_mut() {
                        if now.duration_since(connecting.started) >= timeout {
                            timed_out = Some(connecting.target);
                        } else if now.duration_since(connecting.last_sent)
                            >= self.config.handshake_retry()
                        {
                            connecting.last_sent = now;
                            outgoing = sender.map(|sender| {
                                (sender, connecting.target, connecting.request.clone())
                            });
                        }
                    }
                    if let Some(target) = timed_out {
                        logger::log_connect_timeout(id, &target);
                        entry.connecting = None;
                        entry.connect_error = Some(ErrorCode::NoServer);
                        entry.set_state(SocketState::Broken);
                        changed = true;
                    }
                }
                SocketState::Connected => {
                    if now.duration_since(entry.last_heard) >= entry.options.peer_idle_timeout {
                        if let Some(peer) = entry.peer {
                            logger::log_peer_timeout(id, &peer);
                        }
                        entry.set_state(SocketState::Broken);
                        changed = true;
                    } else if now.duration_since(entry.last_sent)
                        >= self.config.keepalive_interval()
                    {
                        entry.last_sent = now;
                        if let (Some(sender), Some(peer)) = (entry.sender(), entry.peer) {
                            outgoing = Some((sender, peer, Packet::Keepalive.encode()));
                        }
                    }
                }
                _ => {}
            }
        }

        if changed {
            self.wake();
        }
        if let Some((sender, target, wire)) = outgoing {
            send_quietly(&sender, &wire, target);
        }
        true
    }

    fn reap_closed(&self, now: Instant) {
        let reaped = self.table.lock().reap(now, self.config.linger());
        if reaped {
            self.wake();
        }
    }
}

fn run_listen_callback(callback: Option<&ListenCallback>, info: &HandshakeInfo) -> bool {
    let Some(callback) = callback else {
        return true;
    };
    panic::catch_unwind(AssertUnwindSafe(|| callback(info))).unwrap_or_else(|_| {
        logger::log_callback_panic("listen", info.listener);
        false
    })
}

fn send_quietly(socket: &StdUdpSocket, wire: &[u8], target: SocketAddr) {
    if let Err(err) = socket.send_to(wire, target) {
        tracing::debug!(%target, error = %err, "control packet not sent");
    }
}

/// Driver loop of one bound socket.
async fn run(shared: Arc<Shared>, id: SocketId, io: UdpSocket, stop: Arc<Notify>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut ticker = time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = stop.notified() => break,
            received = io.recv_from(&mut buf) => match received {
                Ok((len, from)) => shared.on_datagram(id, &buf[..len], from),
                Err(err) => {
                    // ICMP errors surface here on some platforms; the socket stays usable
                    tracing::debug!(socket = %id, error = %err, "receive error");
                }
            },
            _ = ticker.tick() => {
                if !shared.on_tick(id, Instant::now()) {
                    break;
                }
            }
        }
    }
    tracing::debug!(socket = %id, "driver stopped");
}

/// Periodically drop closed sockets whose linger expired.
pub(super) async fn reap(shared: Weak<Shared>) {
    let mut ticker = time::interval(REAP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.reap_closed(Instant::now());
    }
}
