//! Reliable UDP connection multiplexer
//!
//! A message-oriented reliable transport over UDP with socket handles,
//! readiness poll groups and a single-threaded accept/dispatch server loop.

pub mod config;
pub mod engine;
pub mod error;
pub mod logger;
pub mod poll;
pub mod server;
pub mod socket;
pub mod stats;
pub mod streamid;

pub use config::{Config, LoggingConfig, ServerConfig, TransportConfig};
pub use engine::{Engine, HandshakeInfo, SocketId, SocketState, TransmissionType};
pub use error::{Error, ErrorCode, Result};
pub use poll::{Interest, Poll, PollGroup, Ready};
pub use server::{Connection, Server, ServerPhase, StopHandle};
pub use socket::Socket;
pub use stats::Stats;
pub use streamid::{StreamIdComponents, StreamMode, StreamType};
