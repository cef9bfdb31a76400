// Socket state module
// Lifecycle states a transport socket moves through

use std::fmt;

/// Lifecycle state of an engine socket.
///
/// The engine owns transitions; handles only ever read the current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    Ready,
    Opened,
    Listening,
    Connecting,
    Connected,
    Broken,
    Closing,
    Closed,
    NonExistent,
}

impl SocketState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Opened => "opened",
            Self::Listening => "listening",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Broken => "broken",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::NonExistent => "nonexistent",
        }
    }

    /// States reported through the error readiness bit. The server loop
    /// tears a connection down on any of them.
    pub const fn is_error(self) -> bool {
        matches!(
            self,
            Self::Broken | Self::Closing | Self::Closed | Self::NonExistent
        )
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
