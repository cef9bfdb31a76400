// Readiness module
// Interest masks and per-poll-group readiness bookkeeping

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use super::SocketId;

/// Bit set of readiness interests or readiness results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Events(u8);

impl Events {
    pub const READABLE: Self = Self(0b0001);
    pub const WRITABLE: Self = Self(0b0010);
    pub const ERROR: Self = Self(0b0100);
    /// Report only changes since the previous report.
    pub const EDGE: Self = Self(0b1000);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(0b1111)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub const fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }
}

impl BitOr for Events {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READABLE, "in"),
            (Self::WRITABLE, "out"),
            (Self::ERROR, "err"),
            (Self::EDGE, "et"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// One ready socket returned by a poll wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub socket: SocketId,
    pub events: Events,
}

/// Readiness facts about one socket at one instant.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub erroring: bool,
    pub data_gen: u64,
    pub state_gen: u64,
}

impl Readiness {
    /// Readiness of a socket the engine no longer knows.
    pub const fn vanished() -> Self {
        Self {
            readable: false,
            writable: false,
            erroring: true,
            data_gen: u64::MAX,
            state_gen: u64::MAX,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Member {
    pub socket: SocketId,
    pub interest: Events,
    seen_data: Option<u64>,
    seen_state: Option<u64>,
    write_reported: bool,
}

impl Member {
    pub const fn new(socket: SocketId, interest: Events) -> Self {
        Self {
            socket,
            interest,
            seen_data: None,
            seen_state: None,
            write_reported: false,
        }
    }

    /// Replace the interest and re-arm the writable edge.
    pub fn rearm(&mut self, interest: Events) {
        self.interest = interest;
        self.write_reported = false;
    }

    /// Compute what to report and remember it for edge-triggered interest.
    pub fn check(&mut self, readiness: Readiness) -> Events {
        let edge = self.interest.contains(Events::EDGE);
        let mut ready = Events::empty();

        if self.interest.is_readable()
            && readiness.readable
            && (!edge || self.seen_data != Some(readiness.data_gen))
        {
            ready |= Events::READABLE;
            self.seen_data = Some(readiness.data_gen);
        }
        if self.interest.is_writable() && readiness.writable && !self.write_reported {
            ready |= Events::WRITABLE;
            self.write_reported = true;
        }
        if self.interest.is_error()
            && readiness.erroring
            && (!edge || self.seen_state != Some(readiness.state_gen))
        {
            ready |= Events::ERROR;
            self.seen_state = Some(readiness.state_gen);
        }
        ready
    }
}

/// Engine-side poll group: members in registration order.
#[derive(Debug, Default)]
pub(crate) struct PollEntry {
    pub members: Vec<Member>,
}

impl PollEntry {
    pub fn position(&self, socket: SocketId) -> Option<usize> {
        self.members.iter().position(|member| member.socket == socket)
    }

    /// Add, or update the interest of an existing member.
    pub fn upsert(&mut self, socket: SocketId, interest: Events) {
        match self.position(socket) {
            Some(index) => self.members[index].rearm(interest),
            None => self.members.push(Member::new(socket, interest)),
        }
    }

    pub fn remove(&mut self, socket: SocketId) -> bool {
        let before = self.members.len();
        self.members.retain(|member| member.socket != socket);
        before != self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readiness(readable: bool, data_gen: u64) -> Readiness {
        Readiness {
            readable,
            writable: false,
            erroring: false,
            data_gen,
            state_gen: 0,
        }
    }

    #[test]
    fn test_level_triggered_repeats() {
        let mut member = Member::new(SocketId(1), Events::READABLE);
        assert_eq!(member.check(readiness(true, 1)), Events::READABLE);
        assert_eq!(member.check(readiness(true, 1)), Events::READABLE);
        assert!(member.check(readiness(false, 1)).is_empty());
    }

    #[test]
    fn test_edge_triggered_reports_once_per_change() {
        let mut member = Member::new(SocketId(1), Events::READABLE | Events::EDGE);
        assert_eq!(member.check(readiness(true, 1)), Events::READABLE);
        assert!(member.check(readiness(true, 1)).is_empty());
        assert_eq!(member.check(readiness(true, 2)), Events::READABLE);
    }

    #[test]
    fn test_writable_is_rearmed_by_update() {
        let mut member = Member::new(SocketId(1), Events::WRITABLE);
        let connected = Readiness {
            writable: true,
            ..readiness(false, 0)
        };
        assert_eq!(member.check(connected), Events::WRITABLE);
        assert!(member.check(connected).is_empty());
        member.rearm(Events::WRITABLE);
        assert_eq!(member.check(connected), Events::WRITABLE);
    }

    #[test]
    fn test_upsert_keeps_registration_order() {
        let mut entry = PollEntry::default();
        entry.upsert(SocketId(3), Events::READABLE);
        entry.upsert(SocketId(1), Events::READABLE);
        entry.upsert(SocketId(3), Events::ERROR);
        let order: Vec<_> = entry.members.iter().map(|m| m.socket).collect();
        assert_eq!(order, vec![SocketId(3), SocketId(1)]);
        assert_eq!(entry.members[0].interest, Events::ERROR);
        assert!(entry.remove(SocketId(3)));
        assert!(!entry.remove(SocketId(3)));
    }

    #[test]
    fn test_events_display() {
        assert_eq!((Events::READABLE | Events::ERROR).to_string(), "in|err");
        assert_eq!(Events::empty().to_string(), "");
    }
}
