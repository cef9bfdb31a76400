// Socket table module
// Engine-side socket records, traffic counters and readiness queries

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;

use super::epoll::{PollEntry, PollEvent, Readiness};
use super::options::Options;
use super::packet::Packet;
use super::state::SocketState;
use super::{ListenCallback, PollId, SocketId};
use crate::error::{Error, ErrorCode, Result};
use crate::stats::Stats;

/// Send half of a bound socket plus the stop signal of its driver task.
pub(crate) struct Io {
    pub sender: Arc<UdpSocket>,
    pub stop: Arc<Notify>,
}

pub(crate) struct Inbound {
    pub payload: Bytes,
    pub ready_at: Instant,
}

pub(crate) struct ListenerState {
    pub backlog: usize,
    /// Accepted sockets not yet handed out by `accept`.
    pub pending: VecDeque<SocketId>,
    /// Peer address to the socket created for it.
    pub peers: HashMap<SocketAddr, SocketId>,
}

impl ListenerState {
    pub fn new(backlog: usize) -> Self {
        Self {
            backlog,
            pending: VecDeque::new(),
            peers: HashMap::new(),
        }
    }
}

/// An outstanding connection request.
pub(crate) struct Connecting {
    pub target: SocketAddr,
    pub request: Bytes,
    pub started: Instant,
    pub last_sent: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Counters {
    pub pkt_sent: u64,
    pub pkt_recv: u64,
    pub pkt_rcv_loss: u64,
    pub pkt_rcv_drop: u64,
    pub byte_sent: u64,
    pub byte_recv: u64,
    pub byte_rcv_drop: u64,
}

pub(crate) struct Traffic {
    pub total: Counters,
    pub interval: Counters,
    pub interval_start: Instant,
}

impl Traffic {
    fn new(now: Instant) -> Self {
        Self {
            total: Counters::default(),
            interval: Counters::default(),
            interval_start: now,
        }
    }

    fn update(&mut self, apply: impl Fn(&mut Counters)) {
        apply(&mut self.total);
        apply(&mut self.interval);
    }
}

/// Things to do outside the table lock after a socket was closed.
pub(crate) struct Teardown {
    pub io: Option<Io>,
    pub shutdown_peer: Option<SocketAddr>,
    pub pending: Vec<SocketId>,
    /// Released only after the lock, since it may own socket handles.
    pub callback: Option<ListenCallback>,
}

pub(crate) struct SocketEntry {
    pub state: SocketState,
    pub options: Options,
    pub local: Option<SocketAddr>,
    pub peer: Option<SocketAddr>,
    pub io: Option<Io>,
    pub listener: Option<ListenerState>,
    pub listen_callback: Option<ListenCallback>,
    pub accepted_by: Option<SocketId>,
    pub connecting: Option<Connecting>,
    pub connect_error: Option<ErrorCode>,
    pub inbox: VecDeque<Inbound>,
    pub inbox_bytes: usize,
    pub peer_closed: bool,
    pub last_heard: Instant,
    pub last_sent: Instant,
    pub next_seq: u32,
    pub expected_seq: Option<u32>,
    pub data_gen: u64,
    pub state_gen: u64,
    pub traffic: Traffic,
    pub created: Instant,
    pub closed_at: Option<Instant>,
}

impl SocketEntry {
    pub fn new(options: Options, now: Instant) -> Self {
        Self {
            state: SocketState::Ready,
            options,
            local: None,
            peer: None,
            io: None,
            listener: None,
            listen_callback: None,
            accepted_by: None,
            connecting: None,
            connect_error: None,
            inbox: VecDeque::new(),
            inbox_bytes: 0,
            peer_closed: false,
            last_heard: now,
            last_sent: now,
            next_seq: 0,
            expected_seq: None,
            data_gen: 0,
            state_gen: 0,
            traffic: Traffic::new(now),
            created: now,
            closed_at: None,
        }
    }

    pub fn set_state(&mut self, state: SocketState) {
        if self.state != state {
            self.state = state;
            self.state_gen += 1;
        }
    }

    pub fn sender(&self) -> Option<Arc<UdpSocket>> {
        self.io.as_ref().map(|io| Arc::clone(&io.sender))
    }

    fn has_deliverable(&self, now: Instant) -> bool {
        self.inbox.front().is_some_and(|msg| msg.ready_at <= now)
    }

    pub fn readiness(&self, now: Instant) -> Readiness {
        let readable = match self.state {
            SocketState::Listening => self
                .listener
                .as_ref()
                .is_some_and(|listener| !listener.pending.is_empty()),
            SocketState::Connected => self.has_deliverable(now),
            _ => false,
        };
        Readiness {
            readable,
            writable: self.state == SocketState::Connected,
            erroring: self.state.is_error(),
            data_gen: self.data_gen,
            state_gen: self.state_gen,
        }
    }

    /// When the next held-back message becomes deliverable.
    pub fn next_due(&self, now: Instant) -> Option<Instant> {
        self.inbox
            .front()
            .map(|msg| msg.ready_at)
            .filter(|ready_at| *ready_at > now)
    }

    /// Take the next deliverable message. Drains the queue of a peer-closed
    /// socket into `broken`.
    pub fn pop_message(&mut self, now: Instant) -> Option<Bytes> {
        if !self.has_deliverable(now) {
            return None;
        }
        let message = self.inbox.pop_front()?;
        self.inbox_bytes -= message.payload.len();
        if self.peer_closed && self.inbox.is_empty() {
            self.set_state(SocketState::Broken);
        }
        Some(message.payload)
    }

    pub fn record_sent(&mut self, bytes: usize, now: Instant) {
        self.last_sent = now;
        let bytes = bytes as u64;
        self.traffic.update(|c| {
            c.pkt_sent += 1;
            c.byte_sent += bytes;
        });
    }

    /// Apply a non-handshake packet. Returns true when waiters must be woken.
    pub fn on_packet(
        &mut self,
        packet: Packet,
        from: SocketAddr,
        now: Instant,
        receive_limit: usize,
    ) -> bool {
        match packet {
            Packet::Accept { .. } if self.state == SocketState::Connecting => {
                self.peer = Some(from);
                self.connecting = None;
                self.last_heard = now;
                self.set_state(SocketState::Connected);
                true
            }
            Packet::Reject { code } if self.state == SocketState::Connecting => {
                self.connecting = None;
                self.connect_error = Some(ErrorCode::from_code(code));
                self.set_state(SocketState::Broken);
                true
            }
            Packet::Data { seq, payload, .. } if self.accepts_from(from) => {
                self.last_heard = now;
                self.on_data(seq, payload, now, receive_limit);
                true
            }
            Packet::Keepalive if self.peer == Some(from) => {
                self.last_heard = now;
                false
            }
            Packet::Shutdown if self.accepts_from(from) => {
                self.peer_closed = true;
                if self.inbox.is_empty() {
                    self.set_state(SocketState::Broken);
                }
                true
            }
            _ => false,
        }
    }

    fn accepts_from(&self, from: SocketAddr) -> bool {
        self.state == SocketState::Connected && self.peer == Some(from) && !self.peer_closed
    }

    fn on_data(&mut self, seq: u32, payload: Bytes, now: Instant, receive_limit: usize) {
        let lost = match self.expected_seq {
            Some(expected) if seq > expected => u64::from(seq - expected),
            _ => 0,
        };
        self.expected_seq = Some(seq.wrapping_add(1));
        let bytes = payload.len() as u64;

        if self.inbox.len() >= receive_limit {
            self.traffic.update(|c| {
                c.pkt_recv += 1;
                c.byte_recv += bytes;
                c.pkt_rcv_loss += lost;
                c.pkt_rcv_drop += 1;
                c.byte_rcv_drop += bytes;
            });
            return;
        }
        self.traffic.update(|c| {
            c.pkt_recv += 1;
            c.byte_recv += bytes;
            c.pkt_rcv_loss += lost;
        });

        let ready_at = if self.options.tsbpd {
            now + self.options.latency
        } else {
            now
        };
        self.inbox_bytes += payload.len();
        self.inbox.push_back(Inbound { payload, ready_at });
        self.data_gen += 1;
    }

    /// Copy the counters into a snapshot, optionally restarting the interval.
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&mut self, now: Instant, clear: bool, mss: u64) -> Stats {
        let total = self.traffic.total;
        let interval = self.traffic.interval;
        let elapsed_us = now
            .duration_since(self.traffic.interval_start)
            .as_micros()
            .max(1) as f64;
        let rate = |bytes: u64| bytes as f64 * 8.0 / elapsed_us;

        let stats = Stats {
            ms_timestamp: i64::try_from(now.duration_since(self.created).as_millis())
                .unwrap_or(i64::MAX),
            pkt_sent_total: total.pkt_sent,
            pkt_recv_total: total.pkt_recv,
            pkt_snd_loss_total: 0,
            pkt_rcv_loss_total: total.pkt_rcv_loss,
            pkt_retrans_total: 0,
            pkt_rcv_drop_total: total.pkt_rcv_drop,
            byte_sent_total: total.byte_sent,
            byte_recv_total: total.byte_recv,
            byte_rcv_drop_total: total.byte_rcv_drop,
            pkt_sent: interval.pkt_sent,
            pkt_recv: interval.pkt_recv,
            pkt_rcv_loss: interval.pkt_rcv_loss,
            pkt_retrans: 0,
            pkt_rcv_drop: interval.pkt_rcv_drop,
            byte_sent: interval.byte_sent,
            byte_recv: interval.byte_recv,
            byte_rcv_drop: interval.byte_rcv_drop,
            mbps_send_rate: rate(interval.byte_sent),
            mbps_recv_rate: rate(interval.byte_recv),
            ms_rtt: 0.0,
            pkt_rcv_buf: self.inbox.len() as u64,
            byte_rcv_buf: self.inbox_bytes as u64,
            ms_rcv_tsbpd_delay: if self.options.tsbpd {
                u64::try_from(self.options.latency.as_millis()).unwrap_or(u64::MAX)
            } else {
                0
            },
            byte_mss: mss,
        };

        if clear {
            self.traffic.interval = Counters::default();
            self.traffic.interval_start = now;
        }
        stats
    }
}

#[derive(Default)]
pub(crate) struct Table {
    next_socket: i32,
    next_poll: i32,
    pub sockets: HashMap<SocketId, SocketEntry>,
    pub polls: HashMap<PollId, PollEntry>,
}

impl Table {
    pub fn insert_socket(&mut self, entry: SocketEntry) -> SocketId {
        self.next_socket += 1;
        let id = SocketId(self.next_socket);
        self.sockets.insert(id, entry);
        id
    }

    pub fn insert_poll(&mut self) -> PollId {
        self.next_poll += 1;
        let id = PollId(self.next_poll);
        self.polls.insert(id, PollEntry::default());
        id
    }

    pub fn socket(&self, id: SocketId) -> Result<&SocketEntry> {
        self.sockets
            .get(&id)
            .ok_or_else(|| Error::transport(ErrorCode::InvSock))
    }

    pub fn socket_mut(&mut self, id: SocketId) -> Result<&mut SocketEntry> {
        self.sockets
            .get_mut(&id)
            .ok_or_else(|| Error::transport(ErrorCode::InvSock))
    }

    pub fn poll_mut(&mut self, id: PollId) -> Result<&mut PollEntry> {
        self.polls
            .get_mut(&id)
            .ok_or_else(|| Error::transport(ErrorCode::InvPollId))
    }

    /// Mark one socket closed. Returns `None` when it was already closed.
    pub fn mark_closed(&mut self, id: SocketId, now: Instant) -> Option<Teardown> {
        let entry = self.sockets.get_mut(&id)?;
        if entry.state == SocketState::Closed {
            return None;
        }
        let shutdown_peer = if entry.state == SocketState::Connected {
            entry.peer
        } else {
            None
        };
        entry.set_state(SocketState::Closed);
        entry.closed_at = Some(now);
        entry.connecting = None;
        let callback = entry.listen_callback.take();
        let io = entry.io.take();
        let pending = entry
            .listener
            .take()
            .map(|listener| listener.pending.into_iter().collect())
            .unwrap_or_default();
        let accepted_by = entry.accepted_by;

        if let Some(listener) = accepted_by.and_then(|l| self.sockets.get_mut(&l)) {
            if let Some(state) = listener.listener.as_mut() {
                state.peers.retain(|_, accepted| *accepted != id);
            }
        }

        Some(Teardown {
            io,
            shutdown_peer,
            pending,
            callback,
        })
    }

    /// Drop closed sockets whose linger expired. Returns true if any went away.
    pub fn reap(&mut self, now: Instant, linger: Duration) -> bool {
        let before = self.sockets.len();
        self.sockets.retain(|_, entry| {
            entry
                .closed_at
                .map_or(true, |closed_at| now.duration_since(closed_at) < linger)
        });
        before != self.sockets.len()
    }

    /// Gather ready members of a poll group, at most `capacity` of them.
    /// Also returns the earliest instant a held-back message becomes due.
    pub fn collect_events(
        &mut self,
        poll: PollId,
        capacity: usize,
        now: Instant,
    ) -> Result<(Vec<PollEvent>, Option<Instant>)> {
        let entry = self
            .polls
            .get_mut(&poll)
            .ok_or_else(|| Error::transport(ErrorCode::InvPollId))?;
        let mut events = Vec::new();
        let mut next_due: Option<Instant> = None;

        for member in &mut entry.members {
            if events.len() >= capacity {
                break;
            }
            let readiness = match self.sockets.get(&member.socket) {
                Some(socket) => {
                    if member.interest.is_readable() {
                        if let Some(due) = socket.next_due(now) {
                            next_due = Some(next_due.map_or(due, |current| current.min(due)));
                        }
                    }
                    socket.readiness(now)
                }
                None => Readiness::vanished(),
            };
            let ready = member.check(readiness);
            if !ready.is_empty() {
                events.push(PollEvent {
                    socket: member.socket,
                    events: ready,
                });
            }
        }
        Ok((events, next_due))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    fn connected_entry(peer: SocketAddr) -> SocketEntry {
        let mut entry =
            SocketEntry::new(Options::from_config(&TransportConfig::default()), Instant::now());
        entry.peer = Some(peer);
        entry.set_state(SocketState::Connected);
        entry
    }

    fn data(seq: u32, payload: &'static [u8]) -> Packet {
        Packet::Data {
            seq,
            timestamp: 0,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_data_from_stranger_is_ignored() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let stranger: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let mut entry = connected_entry(peer);
        assert!(!entry.on_packet(data(0, b"x"), stranger, Instant::now(), 8));
        assert!(entry.inbox.is_empty());
    }

    #[test]
    fn test_receive_buffer_overflow_drops() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut entry = connected_entry(peer);
        let now = Instant::now();
        entry.on_packet(data(0, b"a"), peer, now, 1);
        entry.on_packet(data(1, b"b"), peer, now, 1);
        assert_eq!(entry.inbox.len(), 1);
        assert_eq!(entry.traffic.total.pkt_rcv_drop, 1);
    }

    #[test]
    fn test_sequence_gap_counts_loss() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut entry = connected_entry(peer);
        let now = Instant::now();
        entry.on_packet(data(0, b"a"), peer, now, 8);
        entry.on_packet(data(3, b"b"), peer, now, 8);
        assert_eq!(entry.traffic.total.pkt_rcv_loss, 2);
    }

    #[test]
    fn test_shutdown_breaks_after_drain() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut entry = connected_entry(peer);
        let now = Instant::now();
        entry.on_packet(data(0, b"last words"), peer, now, 8);
        entry.on_packet(Packet::Shutdown, peer, now, 8);
        assert_eq!(entry.state, SocketState::Connected);

        assert_eq!(entry.pop_message(now).as_deref(), Some(&b"last words"[..]));
        assert_eq!(entry.state, SocketState::Broken);
    }

    #[test]
    fn test_snapshot_clear_resets_interval_only() {
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let mut entry = connected_entry(peer);
        let now = Instant::now();
        entry.record_sent(100, now);

        let first = entry.snapshot(now, true, 1500);
        assert_eq!(first.pkt_sent, 1);
        let second = entry.snapshot(now, false, 1500);
        assert_eq!(second.pkt_sent, 0);
        assert_eq!(second.pkt_sent_total, 1);
        assert_eq!(second.byte_sent_total, 100);
    }
}
