//! Socket handle
//!
//! Owns one engine socket. State is never cached; every query goes to the
//! engine. The last clone of a handle closes the socket when dropped.

mod addr;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use addr::AddressFamily;

use crate::engine::{
    Engine, ListenCallback, OptionName, SocketId, SocketOption, SocketState, TransmissionType,
};
use crate::error::{Error, ErrorCode, Result};
use crate::stats::Stats;

struct SocketInner {
    engine: Engine,
    id: SocketId,
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        let state = self.engine.state(self.id);
        if !matches!(state, SocketState::Closed | SocketState::NonExistent) {
            let _ = self.engine.close(self.id);
        }
    }
}

/// Cheaply cloneable handle to an engine socket.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Socket {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Socket {}

impl Hash for Socket {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

/// Generates one `is_<state>` predicate per socket state.
macro_rules! state_predicates {
    ($($name:ident => $state:ident),* $(,)?) => {
        $(
            pub fn $name(&self) -> bool {
                self.state() == SocketState::$state
            }
        )*
    };
}

impl Socket {
    /// Allocate a fresh engine socket.
    pub fn new(engine: &Engine) -> Result<Self> {
        Ok(Self::from_id(engine.clone(), engine.create_socket()))
    }

    pub(crate) fn from_id(engine: Engine, id: SocketId) -> Self {
        Self {
            inner: Arc::new(SocketInner { engine, id }),
        }
    }

    pub fn id(&self) -> SocketId {
        self.inner.id
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Current state, queried live.
    pub fn state(&self) -> SocketState {
        self.engine().state(self.id())
    }

    state_predicates! {
        is_ready => Ready,
        is_opened => Opened,
        is_listening => Listening,
        is_connecting => Connecting,
        is_connected => Connected,
        is_broken => Broken,
        is_closing => Closing,
        is_closed => Closed,
        is_nonexistent => NonExistent,
    }

    /// Fail fast once the engine has forgotten the socket.
    fn ensure_valid(&self) -> Result<()> {
        if self.is_nonexistent() {
            return Err(Error::InvalidSocket(self.id()));
        }
        Ok(())
    }

    /// Connect to `host:port`, trying each resolved address in order.
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.connect_with_family(host, port, AddressFamily::Any)
    }

    pub(crate) fn connect_with_family(
        &self,
        host: &str,
        port: u16,
        family: AddressFamily,
    ) -> Result<()> {
        self.ensure_valid()?;
        let mut last_error = None;
        for candidate in addr::resolve(host, port, family)? {
            match self.engine().connect(self.id(), candidate) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::debug!(socket = %self.id(), %candidate, error = %err, "connect attempt failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::transport(ErrorCode::ConnSetup)))
    }

    /// Bind to a literal address.
    pub fn bind(&self, address: &str, port: u16) -> Result<()> {
        let addr = addr::parse_literal(address, port)?;
        self.ensure_valid()?;
        self.engine().bind(self.id(), addr)
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.ensure_valid()?;
        self.engine().listen(self.id(), backlog)
    }

    /// Install the handshake-time accept gate of a listening socket.
    pub fn set_listen_callback(&self, callback: Option<ListenCallback>) -> Result<()> {
        self.ensure_valid()?;
        self.engine().set_listen_callback(self.id(), callback)
    }

    /// Accept one pending connection. Blocks unless receive-sync is off.
    pub fn accept(&self) -> Result<Self> {
        self.ensure_valid()?;
        let accepted = self.engine().accept(self.id())?;
        Ok(Self::from_id(self.engine().clone(), accepted))
    }

    /// Close the socket. Closing twice, or closing a vanished socket, is a no-op.
    pub fn close(&self) -> Result<()> {
        match self.engine().close(self.id()) {
            Err(err) if err.code() == Some(ErrorCode::InvSock) => Ok(()),
            other => other,
        }
    }

    /// Send `data`, split into payload-sized messages. Returns the total accepted.
    ///
    /// Empty `data` still goes out as one zero-length message.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.ensure_valid()?;
        if data.is_empty() {
            return self.engine().send(self.id(), data);
        }
        let unit = self.engine().payload_size();
        let mut total = 0;
        for chunk in data.chunks(unit) {
            total += self.engine().send(self.id(), chunk)?;
        }
        Ok(total)
    }

    /// Receive one message (up to two payload units).
    pub fn receive(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.engine().payload_size() * 2];
        let len = self.receive_into(&mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Receive one message into `buf`. Longer messages are truncated.
    pub fn receive_into(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_valid()?;
        self.engine().recv(self.id(), buf)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.ensure_valid()?;
        self.engine().local_addr(self.id())
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.ensure_valid()?;
        self.engine().peer_addr(self.id())
    }

    pub fn stats(&self, clear: bool) -> Result<Stats> {
        Stats::capture(self, clear)
    }

    // ---------------------------------------------------------------------
    // Options
    // ---------------------------------------------------------------------

    /// Validate locally, then pass the option to the engine.
    pub fn set_option(&self, option: SocketOption) -> Result<()> {
        option.validate()?;
        self.ensure_valid()?;
        self.engine().set_option(self.id(), option)
    }

    pub fn option(&self, name: OptionName) -> Result<SocketOption> {
        self.ensure_valid()?;
        self.engine().get_option(self.id(), name)
    }

    pub fn set_rcv_syn(&self, blocking: bool) -> Result<()> {
        self.set_option(SocketOption::RcvSyn(blocking))
    }

    pub fn set_snd_syn(&self, blocking: bool) -> Result<()> {
        self.set_option(SocketOption::SndSyn(blocking))
    }

    pub fn set_stream_id(&self, stream_id: &str) -> Result<()> {
        self.set_option(SocketOption::StreamId(stream_id.to_string()))
    }

    pub fn set_trans_type(&self, trans_type: TransmissionType) -> Result<()> {
        self.set_option(SocketOption::TransType(trans_type))
    }

    pub fn set_tsbpd_mode(&self, enabled: bool) -> Result<()> {
        self.set_option(SocketOption::TsbpdMode(enabled))
    }

    pub fn set_passphrase(&self, passphrase: &str) -> Result<()> {
        self.set_option(SocketOption::Passphrase(passphrase.to_string()))
    }

    pub fn set_latency(&self, latency: Duration) -> Result<()> {
        self.set_option(SocketOption::Latency(latency))
    }

    pub fn set_connect_timeout(&self, timeout: Duration) -> Result<()> {
        self.set_option(SocketOption::ConnectTimeout(timeout))
    }

    pub fn set_peer_idle_timeout(&self, timeout: Duration) -> Result<()> {
        self.set_option(SocketOption::PeerIdleTimeout(timeout))
    }

    pub fn rcv_syn(&self) -> Result<bool> {
        match self.option(OptionName::RcvSyn)? {
            SocketOption::RcvSyn(value) => Ok(value),
            _ => Err(Error::transport(ErrorCode::InvOp)),
        }
    }

    pub fn snd_syn(&self) -> Result<bool> {
        match self.option(OptionName::SndSyn)? {
            SocketOption::SndSyn(value) => Ok(value),
            _ => Err(Error::transport(ErrorCode::InvOp)),
        }
    }

    pub fn stream_id(&self) -> Result<String> {
        match self.option(OptionName::StreamId)? {
            SocketOption::StreamId(value) => Ok(value),
            _ => Err(Error::transport(ErrorCode::InvOp)),
        }
    }

    pub fn trans_type(&self) -> Result<TransmissionType> {
        match self.option(OptionName::TransType)? {
            SocketOption::TransType(value) => Ok(value),
            _ => Err(Error::transport(ErrorCode::InvOp)),
        }
    }

    pub fn tsbpd_mode(&self) -> Result<bool> {
        match self.option(OptionName::TsbpdMode)? {
            SocketOption::TsbpdMode(value) => Ok(value),
            _ => Err(Error::transport(ErrorCode::InvOp)),
        }
    }

    pub fn latency(&self) -> Result<Duration> {
        match self.option(OptionName::Latency)? {
            SocketOption::Latency(value) => Ok(value),
            _ => Err(Error::transport(ErrorCode::InvOp)),
        }
    }

    // ---------------------------------------------------------------------
    // Async wrappers: run the blocking call on tokio's blocking pool
    // ---------------------------------------------------------------------

    pub async fn connect_async(&self, host: &str, port: u16) -> Result<()> {
        let socket = self.clone();
        let host = host.to_string();
        run_blocking(move || socket.connect(&host, port)).await
    }

    pub async fn accept_async(&self) -> Result<Self> {
        let socket = self.clone();
        run_blocking(move || socket.accept()).await
    }

    pub async fn send_async(&self, data: Vec<u8>) -> Result<usize> {
        let socket = self.clone();
        run_blocking(move || socket.send(&data)).await
    }

    pub async fn receive_async(&self) -> Result<Vec<u8>> {
        let socket = self.clone();
        run_blocking(move || socket.receive()).await
    }
}

pub(crate) async fn run_blocking<T, F>(call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}
