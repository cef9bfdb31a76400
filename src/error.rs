// Error module
// Engine error codes and the crate-wide error type

use std::fmt;

use thiserror::Error;

use crate::engine::SocketId;

/// Numeric error codes reported by the transport engine.
///
/// The values follow the major/minor layout used by SRT-style transports
/// (`major * 1000 + minor`), so they stay stable across releases and can be
/// logged or compared by number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = -1,
    ConnSetup = 1000,
    NoServer = 1001,
    ConnRej = 1002,
    SockFail = 1003,
    SecFail = 1004,
    ConnFail = 2000,
    ConnLost = 2001,
    NoConn = 2002,
    Resource = 3000,
    Thread = 3001,
    NoBuf = 3002,
    File = 4000,
    InvRdOff = 4001,
    RdPerm = 4002,
    InvWrOff = 4003,
    WrPerm = 4004,
    InvOp = 5000,
    BoundSock = 5001,
    ConnSock = 5002,
    InvParam = 5003,
    InvSock = 5004,
    UnboundSock = 5005,
    NoListen = 5006,
    RdvNoServ = 5007,
    RdvUnbound = 5008,
    InvalMsgApi = 5009,
    InvalBufferApi = 5010,
    DupListen = 5011,
    LargeMsg = 5012,
    InvPollId = 5013,
    AsyncFail = 6000,
    AsyncSnd = 6001,
    AsyncRcv = 6002,
    Timeout = 6003,
    Congest = 6004,
    PeerErr = 7000,
}

impl ErrorCode {
    /// All codes, in numeric order.
    pub const ALL: [Self; 37] = [
        Self::Unknown,
        Self::ConnSetup,
        Self::NoServer,
        Self::ConnRej,
        Self::SockFail,
        Self::SecFail,
        Self::ConnFail,
        Self::ConnLost,
        Self::NoConn,
        Self::Resource,
        Self::Thread,
        Self::NoBuf,
        Self::File,
        Self::InvRdOff,
        Self::RdPerm,
        Self::InvWrOff,
        Self::WrPerm,
        Self::InvOp,
        Self::BoundSock,
        Self::ConnSock,
        Self::InvParam,
        Self::InvSock,
        Self::UnboundSock,
        Self::NoListen,
        Self::RdvNoServ,
        Self::RdvUnbound,
        Self::InvalMsgApi,
        Self::InvalBufferApi,
        Self::DupListen,
        Self::LargeMsg,
        Self::InvPollId,
        Self::AsyncFail,
        Self::AsyncSnd,
        Self::AsyncRcv,
        Self::Timeout,
        Self::Congest,
        Self::PeerErr,
    ];

    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Map a raw number back to its code. Unrecognized numbers become `Unknown`.
    pub fn from_code(code: i32) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|candidate| candidate.code() == code)
            .unwrap_or(Self::Unknown)
    }

    /// Short uppercase name, e.g. `CONNREJ`.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::ConnSetup => "CONNSETUP",
            Self::NoServer => "NOSERVER",
            Self::ConnRej => "CONNREJ",
            Self::SockFail => "SOCKFAIL",
            Self::SecFail => "SECFAIL",
            Self::ConnFail => "CONNFAIL",
            Self::ConnLost => "CONNLOST",
            Self::NoConn => "NOCONN",
            Self::Resource => "RESOURCE",
            Self::Thread => "THREAD",
            Self::NoBuf => "NOBUF",
            Self::File => "FILE",
            Self::InvRdOff => "INVRDOFF",
            Self::RdPerm => "RDPERM",
            Self::InvWrOff => "INVWROFF",
            Self::WrPerm => "WRPERM",
            Self::InvOp => "INVOP",
            Self::BoundSock => "BOUNDSOCK",
            Self::ConnSock => "CONNSOCK",
            Self::InvParam => "INVPARAM",
            Self::InvSock => "INVSOCK",
            Self::UnboundSock => "UNBOUNDSOCK",
            Self::NoListen => "NOLISTEN",
            Self::RdvNoServ => "RDVNOSERV",
            Self::RdvUnbound => "RDVUNBOUND",
            Self::InvalMsgApi => "INVALMSGAPI",
            Self::InvalBufferApi => "INVALBUFFERAPI",
            Self::DupListen => "DUPLISTEN",
            Self::LargeMsg => "LARGEMSG",
            Self::InvPollId => "INVPOLLID",
            Self::AsyncFail => "ASYNCFAIL",
            Self::AsyncSnd => "ASYNCSND",
            Self::AsyncRcv => "ASYNCRCV",
            Self::Timeout => "TIMEOUT",
            Self::Congest => "CONGEST",
            Self::PeerErr => "PEERERR",
        }
    }

    /// Human readable default description.
    pub const fn description(self) -> &'static str {
        match self {
            Self::Unknown => "unknown error",
            Self::ConnSetup => "connection setup failure",
            Self::NoServer => "connection timed out, no server listening",
            Self::ConnRej => "connection rejected",
            Self::SockFail => "unable to create or configure the datagram socket",
            Self::SecFail => "security check failed during handshake",
            Self::ConnFail => "connection failed",
            Self::ConnLost => "connection was broken",
            Self::NoConn => "socket is not connected",
            Self::Resource => "resource allocation failure",
            Self::Thread => "cannot start a worker thread",
            Self::NoBuf => "no buffer space available",
            Self::File => "file system failure",
            Self::InvRdOff => "invalid read offset",
            Self::RdPerm => "no read permission",
            Self::InvWrOff => "invalid write offset",
            Self::WrPerm => "no write permission",
            Self::InvOp => "operation not supported",
            Self::BoundSock => "operation not allowed on a bound socket",
            Self::ConnSock => "operation not allowed on a connected socket",
            Self::InvParam => "invalid parameter",
            Self::InvSock => "invalid socket id",
            Self::UnboundSock => "socket is not bound",
            Self::NoListen => "socket is not listening",
            Self::RdvNoServ => "rendezvous connection without a listening peer",
            Self::RdvUnbound => "rendezvous socket is not bound",
            Self::InvalMsgApi => "message API used in stream mode",
            Self::InvalBufferApi => "buffer API used in message mode",
            Self::DupListen => "another socket is already listening on this port",
            Self::LargeMsg => "message is too large to send",
            Self::InvPollId => "invalid poll id",
            Self::AsyncFail => "non-blocking operation failed",
            Self::AsyncSnd => "no room in the send buffer",
            Self::AsyncRcv => "no data available for reading",
            Self::Timeout => "operation timed out",
            Self::Congest => "congestion control rejected the operation",
            Self::PeerErr => "peer reported an error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Failure reported by the transport engine.
    #[error("{code}: {message}")]
    Transport { code: ErrorCode, message: String },

    /// Argument rejected locally, before any engine call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The handle refers to a socket the engine no longer knows.
    #[error("socket {0} does not exist")]
    InvalidSocket(SocketId),

    /// A socket was added to a poll group twice.
    #[error("socket {0} is already registered with this poll group")]
    AlreadyRegistered(SocketId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl Error {
    /// Engine error carrying the code's default description.
    pub fn transport(code: ErrorCode) -> Self {
        Self::Transport {
            code,
            message: code.description().to_string(),
        }
    }

    /// Engine error with a custom message.
    pub fn transport_with(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Engine code for transport errors, `None` for local errors.
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Transport { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub const fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_through_numbers() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(code.code()), code);
        }
        assert_eq!(ErrorCode::from_code(42), ErrorCode::Unknown);
    }

    #[test]
    fn test_transport_error_exposes_code() {
        let err = Error::transport(ErrorCode::ConnRej);
        assert_eq!(err.code(), Some(ErrorCode::ConnRej));
        assert_eq!(err.code().map(ErrorCode::code), Some(1002));
        assert!(err.to_string().contains("CONNREJ"));
    }

    #[test]
    fn test_local_errors_have_no_code() {
        let err = Error::invalid_argument("bad address");
        assert!(err.is_invalid_argument());
        assert_eq!(err.code(), None);
    }
}
