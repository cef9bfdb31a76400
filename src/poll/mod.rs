//! Readiness poll module
//!
//! `PollGroup` wraps one engine poll group and tracks which sockets it
//! watches. `Poll<T>` layers an owner map on top so ready events come back
//! as the caller's own values, sorted into readable, writable and error
//! buckets.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use crate::engine::{Events, PollEvent};

use crate::engine::{Engine, PollId, SocketId};
use crate::error::{Error, Result};
use crate::logger;
use crate::socket::{run_blocking, Socket};

/// Smallest event buffer handed to the engine.
const MIN_EVENT_CAPACITY: usize = 8;

/// One readiness interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
    Error,
    EdgeTriggered,
}

impl Interest {
    pub const fn events(self) -> Events {
        match self {
            Self::Readable => Events::READABLE,
            Self::Writable => Events::WRITABLE,
            Self::Error => Events::ERROR,
            Self::EdgeTriggered => Events::EDGE,
        }
    }
}

impl FromStr for Interest {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self> {
        match token.to_ascii_lowercase().as_str() {
            "in" | "read" | "readable" => Ok(Self::Readable),
            "out" | "write" | "writable" => Ok(Self::Writable),
            "err" | "error" => Ok(Self::Error),
            "et" | "edge" => Ok(Self::EdgeTriggered),
            _ => Err(Error::invalid_argument(format!(
                "unknown poll interest '{token}'"
            ))),
        }
    }
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Readable => "in",
            Self::Writable => "out",
            Self::Error => "err",
            Self::EdgeTriggered => "et",
        })
    }
}

/// Fold a set of interests into one mask.
pub fn interest_mask(interests: &[Interest]) -> Events {
    interests
        .iter()
        .fold(Events::empty(), |mask, interest| mask | interest.events())
}

/// Parse string tokens into a mask, failing on the first unknown token.
pub fn parse_interest<S: AsRef<str>>(tokens: &[S]) -> Result<Events> {
    let interests = tokens
        .iter()
        .map(|token| token.as_ref().parse())
        .collect::<Result<Vec<Interest>>>()?;
    Ok(interest_mask(&interests))
}

const fn event_capacity(watched: usize) -> usize {
    if watched < MIN_EVENT_CAPACITY {
        MIN_EVENT_CAPACITY
    } else {
        watched + MIN_EVENT_CAPACITY
    }
}

// ============================================================================
// PollGroup
// ============================================================================

/// An engine poll group plus the set of sockets registered with it.
///
/// Dropping the group unregisters every member and releases the engine
/// resource.
pub struct PollGroup {
    engine: Engine,
    id: PollId,
    members: HashMap<SocketId, Events>,
    released: bool,
}

impl fmt::Debug for PollGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollGroup")
            .field("id", &self.id)
            .field("members", &self.members.len())
            .field("released", &self.released)
            .finish()
    }
}

impl PollGroup {
    pub fn new(engine: &Engine) -> Self {
        Self {
            engine: engine.clone(),
            id: engine.epoll_create(),
            members: HashMap::new(),
            released: false,
        }
    }

    pub const fn id(&self) -> PollId {
        self.id
    }

    /// Start watching `socket`. A socket can only be added once.
    pub fn add(&mut self, socket: SocketId, events: Events) -> Result<()> {
        if self.members.contains_key(&socket) {
            return Err(Error::AlreadyRegistered(socket));
        }
        self.engine.epoll_add(self.id, socket, events)?;
        self.members.insert(socket, events);
        Ok(())
    }

    /// Replace the interest of a watched socket.
    pub fn update(&mut self, socket: SocketId, events: Events) -> Result<()> {
        if !self.members.contains_key(&socket) {
            return Err(Error::InvalidSocket(socket));
        }
        self.engine.epoll_update(self.id, socket, events)?;
        self.members.insert(socket, events);
        Ok(())
    }

    /// Stop watching `socket`. Returns whether it was watched.
    pub fn remove(&mut self, socket: SocketId) -> bool {
        if self.members.remove(&socket).is_none() {
            return false;
        }
        if let Err(err) = self.engine.epoll_remove(self.id, socket) {
            tracing::debug!(poll = %self.id, %socket, error = %err, "engine remove failed");
        }
        true
    }

    pub fn contains(&self, socket: SocketId) -> bool {
        self.members.contains_key(&socket)
    }

    pub fn interest(&self, socket: SocketId) -> Option<Events> {
        self.members.get(&socket).copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = SocketId> + '_ {
        self.members.keys().copied()
    }

    /// Block until a member is ready or `timeout` passes. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<PollEvent>> {
        self.engine
            .epoll_wait(self.id, event_capacity(self.members.len()), timeout)
    }

    /// `wait` on tokio's blocking pool.
    pub async fn wait_async(&self, timeout: Option<Duration>) -> Result<Vec<PollEvent>> {
        let engine = self.engine.clone();
        let (id, capacity) = (self.id, event_capacity(self.members.len()));
        run_blocking(move || engine.epoll_wait(id, capacity, timeout)).await
    }

    /// Unregister every member and release the engine group. Safe to call twice.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        for socket in self.members.keys() {
            let _ = self.engine.epoll_remove(self.id, *socket);
        }
        self.members.clear();
        self.released = true;
        self.engine.epoll_release(self.id)
    }
}

impl Drop for PollGroup {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::debug!(poll = %self.id, error = %err, "poll group release failed");
        }
    }
}

// ============================================================================
// Poll<T>
// ============================================================================

/// Anything that can be watched by a [`Poll`].
pub trait PollTarget {
    fn socket_id(&self) -> SocketId;
}

impl PollTarget for Socket {
    fn socket_id(&self) -> SocketId {
        self.id()
    }
}

impl PollTarget for SocketId {
    fn socket_id(&self) -> SocketId {
        *self
    }
}

/// Owners of the sockets that became ready in one wait.
#[derive(Debug, Clone)]
pub struct Ready<T> {
    pub readable: Vec<T>,
    pub writable: Vec<T>,
    pub errors: Vec<T>,
}

impl<T> Default for Ready<T> {
    fn default() -> Self {
        Self {
            readable: Vec::new(),
            writable: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> Ready<T> {
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty() && self.errors.is_empty()
    }
}

/// Poll group that hands back caller-owned values on readiness.
pub struct Poll<T> {
    group: PollGroup,
    owners: HashMap<SocketId, T>,
}

impl<T> fmt::Debug for Poll<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poll").field("group", &self.group).finish()
    }
}

impl<T: PollTarget + Clone> Poll<T> {
    pub fn new(engine: &Engine) -> Self {
        Self {
            group: PollGroup::new(engine),
            owners: HashMap::new(),
        }
    }

    /// Watch `owner`'s socket under `interests`.
    pub fn add(&mut self, owner: T, interests: &[Interest]) -> Result<()> {
        let socket = owner.socket_id();
        self.group.add(socket, interest_mask(interests))?;
        self.owners.insert(socket, owner);
        Ok(())
    }

    /// `add` with textual interest tokens such as `"in"` or `"edge"`.
    pub fn add_tokens<S: AsRef<str>>(&mut self, owner: T, tokens: &[S]) -> Result<()> {
        let mask = parse_interest(tokens)?;
        let socket = owner.socket_id();
        self.group.add(socket, mask)?;
        self.owners.insert(socket, owner);
        Ok(())
    }

    pub fn update(&mut self, owner: &T, interests: &[Interest]) -> Result<()> {
        self.group.update(owner.socket_id(), interest_mask(interests))
    }

    /// Stop watching `owner`'s socket, handing back the stored owner.
    pub fn remove(&mut self, owner: &T) -> Option<T> {
        let socket = owner.socket_id();
        self.group.remove(socket);
        self.owners.remove(&socket)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Result<Ready<T>> {
        let events = self.group.wait(timeout)?;
        Ok(self.classify(&events))
    }

    pub async fn wait_async(&self, timeout: Option<Duration>) -> Result<Ready<T>> {
        let events = self.group.wait_async(timeout).await?;
        Ok(self.classify(&events))
    }

    fn classify(&self, events: &[PollEvent]) -> Ready<T> {
        let mut ready = Ready::default();
        for event in events {
            let Some(owner) = self.owners.get(&event.socket) else {
                logger::log_stale_event(event.socket);
                continue;
            };
            if event.events.is_readable() {
                ready.readable.push(owner.clone());
            }
            if event.events.is_writable() {
                ready.writable.push(owner.clone());
            }
            if event.events.is_error() {
                ready.errors.push(owner.clone());
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    fn test_engine() -> Engine {
        Engine::with_config(TransportConfig {
            linger_ms: 100,
            ..TransportConfig::default()
        })
        .unwrap()
    }

    fn connected_pair(engine: &Engine) -> (Socket, Socket, Socket) {
        let listener = Socket::new(engine).unwrap();
        listener.bind("127.0.0.1", 0).unwrap();
        listener.listen(4).unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = Socket::new(engine).unwrap();
        client.connect("127.0.0.1", port).unwrap();
        let server = listener.accept().unwrap();
        (listener, client, server)
    }

    #[test]
    fn test_interest_tokens() {
        assert_eq!("IN".parse::<Interest>().unwrap(), Interest::Readable);
        assert_eq!("writable".parse::<Interest>().unwrap(), Interest::Writable);
        assert_eq!("err".parse::<Interest>().unwrap(), Interest::Error);
        assert_eq!("edge".parse::<Interest>().unwrap(), Interest::EdgeTriggered);
        assert!("hangup".parse::<Interest>().unwrap_err().is_invalid_argument());

        let mask = parse_interest(&["in", "err"]).unwrap();
        assert_eq!(mask, Events::READABLE | Events::ERROR);
        assert!(parse_interest(&["in", "bogus"]).is_err());
    }

    #[test]
    fn test_event_capacity() {
        assert_eq!(event_capacity(0), 8);
        assert_eq!(event_capacity(7), 8);
        assert_eq!(event_capacity(8), 16);
        assert_eq!(event_capacity(100), 108);
    }

    #[test]
    fn test_readable_only_after_peer_sends() {
        let engine = test_engine();
        let (_listener, client, server) = connected_pair(&engine);
        let mut poll = Poll::new(&engine);
        poll.add(server.clone(), &[Interest::Readable]).unwrap();

        let quiet = poll.wait(Some(Duration::from_millis(50))).unwrap();
        assert!(quiet.readable.is_empty());

        client.send(b"data").unwrap();
        let ready = poll.wait(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(ready.readable, vec![server.clone()]);
        assert!(ready.writable.is_empty());

        assert_eq!(server.receive().unwrap(), b"data");
        let drained = poll.wait(Some(Duration::from_millis(50))).unwrap();
        assert!(drained.readable.is_empty());
    }

    #[test]
    fn test_edge_triggered_reports_once() {
        let engine = test_engine();
        let (_listener, client, server) = connected_pair(&engine);
        let mut poll = Poll::new(&engine);
        poll.add_tokens(server.clone(), &["in", "et"]).unwrap();

        client.send(b"one").unwrap();
        let ready = poll.wait(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(ready.readable.len(), 1);
        let again = poll.wait(Some(Duration::from_millis(50))).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_socket_in_several_buckets() {
        let engine = test_engine();
        let (_listener, client, server) = connected_pair(&engine);
        client.send(b"x").unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let mut poll = Poll::new(&engine);
        poll.add(server.clone(), &[Interest::Readable, Interest::Writable])
            .unwrap();
        let ready = poll.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ready.readable, vec![server.clone()]);
        assert_eq!(ready.writable, vec![server]);
    }

    #[test]
    fn test_re_add_fails_fast() {
        let engine = test_engine();
        let socket = Socket::new(&engine).unwrap();
        let mut poll = Poll::new(&engine);
        poll.add(socket.clone(), &[Interest::Readable]).unwrap();
        assert!(matches!(
            poll.add(socket.clone(), &[Interest::Error]),
            Err(Error::AlreadyRegistered(_))
        ));
        poll.update(&socket, &[Interest::Readable, Interest::Error]).unwrap();
        assert_eq!(poll.len(), 1);
    }

    #[test]
    fn test_bad_token_registers_nothing() {
        let engine = test_engine();
        let socket = Socket::new(&engine).unwrap();
        let mut poll = Poll::new(&engine);
        assert!(poll.add_tokens(socket, &["in", "sideways"]).is_err());
        assert!(poll.is_empty());
    }

    #[test]
    fn test_remove_returns_owner() {
        let engine = test_engine();
        let socket = Socket::new(&engine).unwrap();
        let mut poll = Poll::new(&engine);
        assert!(poll.remove(&socket).is_none());
        poll.add(socket.clone(), &[Interest::Readable]).unwrap();
        assert_eq!(poll.remove(&socket), Some(socket.clone()));
        assert!(poll.remove(&socket).is_none());
    }

    #[test]
    fn test_closed_socket_reports_error() {
        let engine = test_engine();
        let (_listener, client, _server) = connected_pair(&engine);
        let mut poll = Poll::new(&engine);
        poll.add(client.id(), &[Interest::Error]).unwrap();
        client.close().unwrap();
        let ready = poll.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ready.errors, vec![client.id()]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let engine = test_engine();
        let socket = Socket::new(&engine).unwrap();
        let mut group = PollGroup::new(&engine);
        group.add(socket.id(), Events::READABLE).unwrap();
        group.release().unwrap();
        assert!(group.is_empty());
        group.release().unwrap();
    }

    #[tokio::test]
    async fn test_wait_async() {
        let engine = test_engine();
        let (_listener, client, server) = connected_pair(&engine);
        let mut poll = Poll::new(&engine);
        poll.add(server.clone(), &[Interest::Readable]).unwrap();
        client.send_async(b"async".to_vec()).await.unwrap();
        let ready = poll.wait_async(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(ready.readable, vec![server]);
    }
}
