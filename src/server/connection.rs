// Connection record module
// One accepted peer plus the handlers the acceptor installed on it

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::engine::SocketId;
use crate::error::Result;
use crate::logger;
use crate::socket::Socket;

type DataHandler = Box<dyn FnMut(&[u8]) + Send>;
type CloseHandler = Box<dyn FnOnce() + Send>;

/// An accepted connection owned by the server's registry.
///
/// Handlers are owned by the record and are dropped when the connection is
/// torn down.
pub struct Connection {
    socket: Socket,
    on_data: Option<DataHandler>,
    on_close: Option<CloseHandler>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("socket", &self.socket.id())
            .field("on_data", &self.on_data.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

impl Connection {
    pub(crate) const fn new(socket: Socket) -> Self {
        Self {
            socket,
            on_data: None,
            on_close: None,
        }
    }

    pub const fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn id(&self) -> SocketId {
        self.socket.id()
    }

    /// Install the handler called with every received message.
    pub fn on_data<F>(&mut self, handler: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.on_data = Some(Box::new(handler));
    }

    /// Install the handler called once when the connection goes away.
    pub fn on_close<F>(&mut self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_close = Some(Box::new(handler));
    }

    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.socket.send(data)
    }

    /// Hand `data` to the data handler. Returns false if the handler panicked.
    pub(crate) fn deliver(&mut self, data: &[u8]) -> bool {
        let Some(handler) = self.on_data.as_mut() else {
            return true;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
            logger::log_callback_panic("on_data", self.socket.id());
            return false;
        }
        true
    }

    /// Fire the close handler at most once and drop both handlers.
    pub(crate) fn finish(&mut self) {
        self.on_data = None;
        if let Some(handler) = self.on_close.take() {
            if panic::catch_unwind(AssertUnwindSafe(handler)).is_err() {
                logger::log_callback_panic("on_close", self.socket.id());
            }
        }
    }
}
