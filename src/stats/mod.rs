//! Statistics snapshot
//!
//! A point-in-time copy of a socket's traffic counters. Taking the snapshot is
//! the only engine call; every field read afterwards is a plain accessor.

use serde::Serialize;

use crate::error::Result;
use crate::socket::Socket;

/// Traffic counters of one socket.
///
/// `*_total` fields cover the socket's lifetime, the unsuffixed counters cover
/// the interval since the last clearing snapshot, and the remaining fields are
/// instantaneous.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    /// Milliseconds since the socket was created
    pub ms_timestamp: i64,

    pub pkt_sent_total: u64,
    pub pkt_recv_total: u64,
    pub pkt_snd_loss_total: u64,
    pub pkt_rcv_loss_total: u64,
    pub pkt_retrans_total: u64,
    pub pkt_rcv_drop_total: u64,
    pub byte_sent_total: u64,
    pub byte_recv_total: u64,
    pub byte_rcv_drop_total: u64,

    pub pkt_sent: u64,
    pub pkt_recv: u64,
    pub pkt_rcv_loss: u64,
    pub pkt_retrans: u64,
    pub pkt_rcv_drop: u64,
    pub byte_sent: u64,
    pub byte_recv: u64,
    pub byte_rcv_drop: u64,
    pub mbps_send_rate: f64,
    pub mbps_recv_rate: f64,

    pub ms_rtt: f64,
    /// Messages waiting in the receive queue
    pub pkt_rcv_buf: u64,
    pub byte_rcv_buf: u64,
    pub ms_rcv_tsbpd_delay: u64,
    pub byte_mss: u64,
}

impl Stats {
    /// Snapshot `socket`'s counters. With `clear` the interval counters restart.
    pub fn capture(socket: &Socket, clear: bool) -> Result<Self> {
        socket.engine().stats(socket.id(), clear)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::error::ErrorCode;

    #[test]
    fn test_capture_fresh_socket() {
        let engine = Engine::new().unwrap();
        let socket = Socket::new(&engine).unwrap();
        let stats = Stats::capture(&socket, false).unwrap();
        assert_eq!(stats.pkt_sent_total, 0);
        assert_eq!(stats.byte_mss, 1500);
    }

    #[test]
    fn test_capture_invalid_socket_is_transport_error() {
        let engine = Engine::new().unwrap();
        let socket = Socket::new(&engine).unwrap();
        socket.close().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1300));

        let err = Stats::capture(&socket, false).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::InvSock));
    }

    #[test]
    fn test_json_field_names() {
        let stats = Stats {
            pkt_sent_total: 3,
            ..Stats::default()
        };
        let json = stats.to_json().unwrap();
        assert!(json.contains("\"pkt_sent_total\":3"));
        assert!(json.contains("\"mbps_recv_rate\""));
    }
}
