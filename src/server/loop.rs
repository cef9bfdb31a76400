// Server loop module
// Single-threaded accept/dispatch loop driven by one readiness poll group

use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::connection::Connection;
use super::registry::Registry;
use super::signal::StopHandle;
use crate::config::ServerConfig;
use crate::engine::{
    Engine, Events, HandshakeInfo, ListenCallback, SocketId, SocketState, TransmissionType,
};
use crate::error::{Error, ErrorCode, Result};
use crate::logger;
use crate::poll::PollGroup;
use crate::socket::{run_blocking, Socket};

/// Interest of the listening socket
const LISTENER_INTEREST: Events = Events::READABLE.union(Events::ERROR);
/// Interest of every accepted connection
const CONNECTION_INTEREST: Events = Events::READABLE
    .union(Events::WRITABLE)
    .union(Events::ERROR);

/// Lifecycle phase of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Uninitialized,
    Initialized,
    Bound,
    Listening,
    Accepting,
    Closed,
}

impl ServerPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Bound => "bound",
            Self::Listening => "listening",
            Self::Accepting => "accepting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ServerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live connection count, readable from outside the loop.
#[derive(Debug, Clone, Default)]
pub struct ConnectionCounter(Arc<AtomicUsize>);

impl ConnectionCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns the new count.
    fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    /// Saturates at zero. Returns the new count.
    fn decrement(&self) -> usize {
        match self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => {
                logger::log_counter_underflow();
                debug_assert!(false, "connection counter underflow");
                0
            }
        }
    }
}

/// Reliable-UDP server: one listening socket, a private poll group and a
/// registry of accepted connections.
///
/// The loop is strictly single-threaded. A slow handler delays every other
/// connection of the same server.
pub struct Server {
    engine: Engine,
    config: ServerConfig,
    listener: Socket,
    group: PollGroup,
    registry: Registry,
    counter: ConnectionCounter,
    phase: ServerPhase,
    stop: StopHandle,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener.id())
            .field("phase", &self.phase)
            .field("connections", &self.registry.len())
            .finish()
    }
}

impl Server {
    /// Create the listening socket and its poll group.
    ///
    /// The socket is live-mode and non-blocking; the loop does all waiting
    /// through the poll group. A failure leaves nothing open.
    pub fn new(engine: &Engine, config: ServerConfig) -> Result<Self> {
        let mut phase = ServerPhase::Uninitialized;
        let listener = Socket::new(engine)?;
        advance(&mut phase, ServerPhase::Initialized);

        listener.set_trans_type(TransmissionType::Live)?;
        listener.set_snd_syn(false)?;
        listener.set_rcv_syn(false)?;

        let gate: ListenCallback = Arc::new(|info: &HandshakeInfo| {
            tracing::trace!(
                listener = %info.listener,
                peer = %info.peer,
                version = info.version,
                stream_id = %info.stream_id,
                "handshake"
            );
            true
        });
        listener.set_listen_callback(Some(gate))?;

        listener.bind(&config.host, config.port)?;
        advance(&mut phase, ServerPhase::Bound);
        listener.listen(config.backlog)?;
        advance(&mut phase, ServerPhase::Listening);

        let mut group = PollGroup::new(engine);
        group.add(listener.id(), LISTENER_INTEREST)?;
        if let Ok(addr) = listener.local_addr() {
            logger::log_server_listening(listener.id(), &addr);
        }

        Ok(Self {
            engine: engine.clone(),
            config,
            listener,
            group,
            registry: Registry::new(),
            counter: ConnectionCounter::default(),
            phase,
            stop: StopHandle::new(),
        })
    }

    pub const fn phase(&self) -> ServerPhase {
        self.phase
    }

    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub const fn listener(&self) -> &Socket {
        &self.listener
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.counter.get()
    }

    /// Handle for reading the live count while the loop runs.
    pub fn connection_counter(&self) -> ConnectionCounter {
        self.counter.clone()
    }

    /// Handle that ends `start` from another thread or task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_registered(&self, id: SocketId) -> bool {
        self.registry.contains(id)
    }

    /// Registry keys equal poll group members minus the listener.
    fn in_lockstep(&self) -> bool {
        let listener = self.listener.id();
        self.group.len() == self.registry.len() + usize::from(self.group.contains(listener))
            && self.registry.ids().all(|id| self.group.contains(id))
    }

    /// Run the accept/dispatch loop until stopped or the listener goes away.
    ///
    /// `acceptor` sees every new connection before it is registered and may
    /// install handlers on it. Returning false rejects the connection.
    pub fn start<F>(&mut self, mut acceptor: F) -> Result<()>
    where
        F: FnMut(&mut Connection) -> bool,
    {
        if self.phase == ServerPhase::Closed {
            return Err(Error::transport(ErrorCode::InvSock));
        }
        self.phase = ServerPhase::Accepting;
        let timeout = self.config.poll_timeout();
        let mut buffer =
            vec![0u8; self.engine.payload_size() * self.config.read_buffer_units.max(1)];

        loop {
            debug_assert!(self.in_lockstep());
            if self.stop.is_stopped() {
                logger::log_server_stopped("stop requested", self.counter.get());
                return Ok(());
            }

            let events = self.group.wait(Some(timeout))?;
            for event in events {
                if event.socket == self.listener.id() {
                    match self.listener.state() {
                        SocketState::Listening => {
                            if event.events.is_readable() {
                                self.accept_one(&mut acceptor);
                            }
                        }
                        state if state.is_error() => {
                            logger::log_server_stopped("listener closed", self.counter.get());
                            return Ok(());
                        }
                        _ => {}
                    }
                    continue;
                }

                match self.engine.state(event.socket) {
                    state if state.is_error() => self.teardown(event.socket),
                    SocketState::Connected if event.events.is_readable() => {
                        self.read_one(event.socket, &mut buffer);
                    }
                    _ => {}
                }
            }
        }
    }

    fn accept_one<F>(&mut self, acceptor: &mut F)
    where
        F: FnMut(&mut Connection) -> bool,
    {
        let socket = match self.listener.accept() {
            Ok(socket) => socket,
            Err(err) => {
                tracing::debug!(listener = %self.listener.id(), error = %err, "accept skipped");
                return;
            }
        };
        let id = socket.id();
        if let Err(err) = socket.set_snd_syn(false).and_then(|()| socket.set_rcv_syn(false)) {
            logger::log_warning(&format!("Cannot configure {id}: {err}"));
            let _ = socket.close();
            return;
        }
        let peer = socket.peer_addr().ok();
        let mut connection = Connection::new(socket);

        // increment first, so the acceptor can enforce a limit on the live count
        self.counter.increment();
        let admitted = panic::catch_unwind(AssertUnwindSafe(|| acceptor(&mut connection)))
            .unwrap_or_else(|_| {
                logger::log_callback_panic("acceptor", id);
                false
            });

        if admitted {
            if let Err(err) = self.group.add(id, CONNECTION_INTEREST) {
                logger::log_error(&format!("Cannot watch {id}: {err}"));
                self.counter.decrement();
                let _ = connection.socket().close();
                return;
            }
            self.registry.insert(connection);
            logger::log_connection_accepted(id, peer.as_ref(), self.counter.get());
        } else {
            let count = self.counter.decrement();
            let _ = connection.socket().close();
            logger::log_connection_rejected(id, count);
        }
    }

    fn read_one(&mut self, id: SocketId, buffer: &mut [u8]) {
        let Some(connection) = self.registry.get_mut(id) else {
            return;
        };
        let len = match connection.socket().receive_into(buffer) {
            Ok(len) => len,
            Err(err) => {
                logger::log_receive_skipped(id, &err);
                return;
            }
        };
        if len > 0 && !connection.deliver(&buffer[..len]) {
            self.teardown(id);
        }
    }

    /// Unregister a connection, fire its close handler and close the socket.
    fn teardown(&mut self, id: SocketId) {
        self.group.remove(id);
        let Some(mut connection) = self.registry.remove(id) else {
            logger::log_stale_event(id);
            return;
        };
        connection.finish();
        let count = self.counter.decrement();
        let _ = connection.socket().close();
        logger::log_connection_closed(id, count);
    }

    /// Tear down every connection and release the listener and poll group.
    pub fn close(&mut self) -> Result<()> {
        if self.phase == ServerPhase::Closed {
            return Ok(());
        }
        let ids: Vec<SocketId> = self.registry.ids().collect();
        for id in ids {
            self.teardown(id);
        }
        self.group.remove(self.listener.id());
        let listener = self.listener.close();
        let group = self.group.release();
        self.phase = ServerPhase::Closed;
        logger::log_server_closed();
        listener.and(group)
    }

    /// Run the loop on tokio's blocking pool, closing the server when it ends.
    pub async fn serve<F>(self, acceptor: F) -> Result<()>
    where
        F: FnMut(&mut Connection) -> bool + Send + 'static,
    {
        let mut server = self;
        run_blocking(move || {
            let outcome = server.start(acceptor);
            let closed = server.close();
            outcome.and(closed)
        })
        .await
    }
}

fn advance(phase: &mut ServerPhase, next: ServerPhase) {
    tracing::trace!("[Server] {phase} -> {next}");
    *phase = next;
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::debug!(error = %err, "server close failed during drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn test_engine() -> Engine {
        Engine::with_config(TransportConfig {
            linger_ms: 200,
            ..TransportConfig::default()
        })
        .unwrap()
    }

    fn ephemeral() -> ServerConfig {
        ServerConfig {
            poll_timeout_ms: 20,
            ..ServerConfig::new("127.0.0.1", 0)
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn test_startup_reaches_listening() {
        let engine = test_engine();
        let server = Server::new(&engine, ephemeral()).unwrap();
        assert_eq!(server.phase(), ServerPhase::Listening);
        assert!(server.listener().is_listening());
        assert!(!server.listener().rcv_syn().unwrap());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_startup_failure_leaves_nothing_open() {
        let engine = test_engine();
        let err = Server::new(&engine, ServerConfig::new("not-an-address", 0)).unwrap_err();
        assert!(err.is_invalid_argument());

        let taken = Server::new(&engine, ephemeral()).unwrap();
        let port = taken.local_addr().unwrap().port();
        assert!(Server::new(&engine, ServerConfig::new("127.0.0.1", port)).is_err());
    }

    #[test]
    fn test_end_to_end_echo_and_close() {
        let engine = test_engine();
        let mut server = Server::new(
            &engine,
            ServerConfig {
                poll_timeout_ms: 20,
                ..ServerConfig::new("127.0.0.1", 9000)
            },
        )
        .unwrap();
        let stop = server.stop_handle();
        let (data_tx, data_rx) = mpsc::channel();
        let (close_tx, close_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let result = server.start(|connection| {
                let data_tx = data_tx.clone();
                let close_tx = close_tx.clone();
                let id = connection.id();
                connection.on_data(move |data| {
                    let _ = data_tx.send(data.to_vec());
                });
                connection.on_close(move || {
                    let _ = close_tx.send(id);
                });
                true
            });
            (server, result)
        });

        let client = Socket::new(&engine).unwrap();
        client.connect("127.0.0.1", 9000).unwrap();
        client.send(b"hello").unwrap();
        assert_eq!(data_rx.recv_timeout(Duration::from_secs(3)).unwrap(), b"hello");

        client.close().unwrap();
        let closed = close_rx.recv_timeout(Duration::from_secs(3)).unwrap();
        assert!(close_rx.recv_timeout(Duration::from_millis(300)).is_err());

        stop.stop();
        let (server, result) = handle.join().unwrap();
        result.unwrap();
        assert!(!server.is_registered(closed));
        assert!(server.in_lockstep());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_rejected_connection_is_closed() {
        let engine = test_engine();
        let mut server = Server::new(&engine, ephemeral()).unwrap();
        let port = server.local_addr().unwrap().port();
        let stop = server.stop_handle();
        let counter = server.connection_counter();
        let (seen_tx, seen_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let result = server.start(|connection| {
                let _ = seen_tx.send(connection.id());
                false
            });
            (server, result)
        });

        let client = Socket::new(&engine).unwrap();
        client.connect("127.0.0.1", port).unwrap();
        let rejected = seen_rx.recv_timeout(Duration::from_secs(3)).unwrap();

        assert!(wait_until(Duration::from_secs(3), || client.is_broken()));
        assert!(matches!(
            engine.state(rejected),
            SocketState::Closed | SocketState::NonExistent
        ));
        assert_eq!(counter.get(), 0);

        stop.stop();
        let (server, result) = handle.join().unwrap();
        result.unwrap();
        assert!(!server.is_registered(rejected));
        assert!(server.in_lockstep());
    }

    #[test]
    fn test_registry_tracks_poll_group() {
        let engine = test_engine();
        let mut server = Server::new(&engine, ephemeral()).unwrap();
        let port = server.local_addr().unwrap().port();
        let stop = server.stop_handle();
        let counter = server.connection_counter();
        let (close_tx, close_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let result = server.start(|connection| {
                let close_tx = close_tx.clone();
                connection.on_close(move || {
                    let _ = close_tx.send(());
                });
                true
            });
            (server, result)
        });

        for _ in 0..3 {
            let clients: Vec<Socket> = (0..2)
                .map(|_| {
                    let client = Socket::new(&engine).unwrap();
                    client.connect("127.0.0.1", port).unwrap();
                    client
                })
                .collect();
            assert!(wait_until(Duration::from_secs(3), || counter.get() == 2));
            for client in &clients {
                client.close().unwrap();
            }
            for _ in 0..2 {
                close_rx.recv_timeout(Duration::from_secs(3)).unwrap();
            }
            assert!(wait_until(Duration::from_secs(1), || counter.get() == 0));
        }

        stop.stop();
        let (server, result) = handle.join().unwrap();
        result.unwrap();
        assert!(server.in_lockstep());
        assert_eq!(server.registry.len(), 0);
        assert_eq!(server.group.len(), 1);
    }

    #[test]
    fn test_read_skips_errors_and_empty_messages() {
        let engine = test_engine();
        let mut server = Server::new(&engine, ephemeral()).unwrap();
        let port = server.local_addr().unwrap().port();
        let (data_tx, data_rx) = mpsc::channel();
        let mut acceptor = |connection: &mut Connection| {
            let data_tx = data_tx.clone();
            connection.on_data(move |data| {
                let _ = data_tx.send(data.to_vec());
            });
            true
        };

        let client = Socket::new(&engine).unwrap();
        client.connect("127.0.0.1", port).unwrap();
        assert!(wait_until(Duration::from_secs(3), || {
            server.accept_one(&mut acceptor);
            server.connection_count() == 1
        }));
        let id = server.registry.ids().next().unwrap();
        let mut buffer = vec![0u8; 64];

        // nothing queued yet, so the receive fails with a would-block error
        server.read_one(id, &mut buffer);
        assert!(server.is_registered(id));

        client.send(b"").unwrap();
        assert!(wait_until(Duration::from_secs(3), || {
            engine.stats(id, false).unwrap().pkt_recv_total == 1
        }));
        server.read_one(id, &mut buffer);
        assert!(data_rx.try_recv().is_err());
        assert!(server.is_registered(id));

        client.send(b"after").unwrap();
        assert!(wait_until(Duration::from_secs(3), || {
            server.read_one(id, &mut buffer);
            data_rx.try_recv().is_ok_and(|data| data == b"after")
        }));
        assert!(server.is_registered(id));
        assert_eq!(server.connection_count(), 1);
        assert!(server.in_lockstep());
    }

    #[test]
    fn test_connection_without_data_handler_stays_registered() {
        let engine = test_engine();
        let mut server = Server::new(&engine, ephemeral()).unwrap();
        let port = server.local_addr().unwrap().port();
        let stop = server.stop_handle();
        let counter = server.connection_counter();
        let (seen_tx, seen_rx) = mpsc::channel();
        let (close_tx, close_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let result = server.start(|connection| {
                let close_tx = close_tx.clone();
                let _ = seen_tx.send(connection.id());
                connection.on_close(move || {
                    let _ = close_tx.send(());
                });
                true
            });
            (server, result)
        });

        let client = Socket::new(&engine).unwrap();
        client.connect("127.0.0.1", port).unwrap();
        let id = seen_rx.recv_timeout(Duration::from_secs(3)).unwrap();
        client.send(b"unheard").unwrap();
        client.send(b"").unwrap();
        client.send(b"still unheard").unwrap();

        assert!(wait_until(Duration::from_secs(3), || {
            engine.stats(id, false).unwrap().pkt_recv_total == 3
        }));
        thread::sleep(Duration::from_millis(100));
        assert!(close_rx.try_recv().is_err());
        assert_eq!(counter.get(), 1);

        stop.stop();
        let (server, result) = handle.join().unwrap();
        result.unwrap();
        assert!(server.is_registered(id));
        assert!(server.in_lockstep());
    }

    #[test]
    fn test_panicking_acceptor_rejects_only_that_connection() {
        let engine = test_engine();
        let mut server = Server::new(&engine, ephemeral()).unwrap();
        let port = server.local_addr().unwrap().port();
        let stop = server.stop_handle();
        let counter = server.connection_counter();

        let handle = thread::spawn(move || {
            let mut calls = 0;
            let result = server.start(|_connection| {
                calls += 1;
                assert!(calls > 1, "first acceptor call fails");
                true
            });
            (server, result)
        });

        let first = Socket::new(&engine).unwrap();
        first.connect("127.0.0.1", port).unwrap();
        assert!(wait_until(Duration::from_secs(3), || first.is_broken()));

        let second = Socket::new(&engine).unwrap();
        second.connect("127.0.0.1", port).unwrap();
        assert!(wait_until(Duration::from_secs(3), || counter.get() == 1));

        stop.stop();
        handle.join().unwrap().1.unwrap();
    }

    #[test]
    fn test_closing_listener_ends_loop() {
        let engine = test_engine();
        let mut server = Server::new(&engine, ephemeral()).unwrap();
        let listener = server.listener().clone();

        let handle = thread::spawn(move || {
            let result = server.start(|_| true);
            (server, result)
        });
        thread::sleep(Duration::from_millis(50));
        listener.close().unwrap();

        let (server, result) = handle.join().unwrap();
        result.unwrap();
        assert_eq!(server.phase(), ServerPhase::Accepting);
    }

    #[test]
    fn test_close_tears_down_connections() {
        let engine = test_engine();
        let mut server = Server::new(&engine, ephemeral()).unwrap();
        let port = server.local_addr().unwrap().port();
        let stop = server.stop_handle();
        let (close_tx, close_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let result = server.start(|connection| {
                let close_tx = close_tx.clone();
                connection.on_close(move || {
                    let _ = close_tx.send(());
                });
                true
            });
            (server, result)
        });

        let client = Socket::new(&engine).unwrap();
        client.connect("127.0.0.1", port).unwrap();
        thread::sleep(Duration::from_millis(100));
        stop.stop();
        let (mut server, result) = handle.join().unwrap();
        result.unwrap();

        server.close().unwrap();
        server.close().unwrap();
        assert_eq!(server.phase(), ServerPhase::Closed);
        assert!(close_rx.try_recv().is_ok());
        assert_eq!(server.connection_count(), 0);
        assert!(wait_until(Duration::from_secs(3), || client.is_broken()));
    }

    #[tokio::test]
    async fn test_serve_until_stopped() {
        let engine = test_engine();
        let server = Server::new(&engine, ephemeral()).unwrap();
        let stop = server.stop_handle();
        let task = tokio::spawn(server.serve(|_| true));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
