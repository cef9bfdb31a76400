// Socket options module
// Typed option values and per-socket option storage

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::TransportConfig;
use crate::error::{Error, ErrorCode, Result};

/// Shortest accepted non-empty passphrase.
pub const PASSPHRASE_MIN_LEN: usize = 10;
/// Longest accepted passphrase.
pub const PASSPHRASE_MAX_LEN: usize = 79;
/// Longest accepted stream id, in characters.
pub const STREAM_ID_MAX_LEN: usize = 512;

/// Transmission mode. Live favours latency, file favours throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransmissionType {
    #[default]
    Live,
    File,
}

impl TransmissionType {
    pub const fn code(self) -> u8 {
        match self {
            Self::Live => 0,
            Self::File => 1,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::File => "file",
        }
    }
}

impl TryFrom<i64> for TransmissionType {
    type Error = Error;

    fn try_from(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::Live),
            1 => Ok(Self::File),
            other => Err(Error::invalid_argument(format!(
                "unknown transmission type {other}"
            ))),
        }
    }
}

impl FromStr for TransmissionType {
    type Err = Error;

    fn from_str(token: &str) -> Result<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "live" | "0" => Ok(Self::Live),
            "file" | "1" => Ok(Self::File),
            _ => Err(Error::invalid_argument(format!(
                "unknown transmission type '{token}'"
            ))),
        }
    }
}

impl fmt::Display for TransmissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An option together with its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketOption {
    /// Blocking receive, accept and connect.
    RcvSyn(bool),
    /// Blocking send.
    SndSyn(bool),
    StreamId(String),
    TransType(TransmissionType),
    /// Timestamp-based delivery.
    TsbpdMode(bool),
    Passphrase(String),
    Latency(Duration),
    ConnectTimeout(Duration),
    PeerIdleTimeout(Duration),
}

impl SocketOption {
    pub const fn name(&self) -> OptionName {
        match self {
            Self::RcvSyn(_) => OptionName::RcvSyn,
            Self::SndSyn(_) => OptionName::SndSyn,
            Self::StreamId(_) => OptionName::StreamId,
            Self::TransType(_) => OptionName::TransType,
            Self::TsbpdMode(_) => OptionName::TsbpdMode,
            Self::Passphrase(_) => OptionName::Passphrase,
            Self::Latency(_) => OptionName::Latency,
            Self::ConnectTimeout(_) => OptionName::ConnectTimeout,
            Self::PeerIdleTimeout(_) => OptionName::PeerIdleTimeout,
        }
    }

    /// Local validation that needs no engine state.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Passphrase(passphrase) => validate_passphrase(passphrase),
            Self::StreamId(stream_id) => validate_stream_id(stream_id),
            _ => Ok(()),
        }
    }
}

/// Option identifiers used for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionName {
    RcvSyn,
    SndSyn,
    StreamId,
    TransType,
    TsbpdMode,
    Passphrase,
    Latency,
    ConnectTimeout,
    PeerIdleTimeout,
}

impl OptionName {
    /// Options that shape the handshake and are frozen once connecting.
    pub const fn is_pre_connect(self) -> bool {
        matches!(
            self,
            Self::StreamId | Self::TransType | Self::TsbpdMode | Self::Passphrase | Self::Latency
        )
    }
}

/// Empty, or between 10 and 79 characters.
pub fn validate_passphrase(passphrase: &str) -> Result<()> {
    let len = passphrase.chars().count();
    if len == 0 || (PASSPHRASE_MIN_LEN..=PASSPHRASE_MAX_LEN).contains(&len) {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "passphrase must be empty or {PASSPHRASE_MIN_LEN} to {PASSPHRASE_MAX_LEN} characters, got {len}"
        )))
    }
}

pub fn validate_stream_id(stream_id: &str) -> Result<()> {
    let len = stream_id.chars().count();
    if len > STREAM_ID_MAX_LEN {
        return Err(Error::invalid_argument(format!(
            "stream id is limited to {STREAM_ID_MAX_LEN} characters, got {len}"
        )));
    }
    Ok(())
}

/// Option values stored on each engine socket.
#[derive(Debug, Clone)]
pub(crate) struct Options {
    pub rcv_syn: bool,
    pub snd_syn: bool,
    pub stream_id: String,
    pub trans_type: TransmissionType,
    pub tsbpd: bool,
    pub passphrase: String,
    pub latency: Duration,
    pub connect_timeout: Duration,
    pub peer_idle_timeout: Duration,
}

impl Options {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            rcv_syn: true,
            snd_syn: true,
            stream_id: String::new(),
            trans_type: TransmissionType::Live,
            tsbpd: false,
            passphrase: String::new(),
            latency: config.latency(),
            connect_timeout: config.connect_timeout(),
            peer_idle_timeout: config.peer_idle_timeout(),
        }
    }

    pub fn get(&self, name: OptionName) -> SocketOption {
        match name {
            OptionName::RcvSyn => SocketOption::RcvSyn(self.rcv_syn),
            OptionName::SndSyn => SocketOption::SndSyn(self.snd_syn),
            OptionName::StreamId => SocketOption::StreamId(self.stream_id.clone()),
            OptionName::TransType => SocketOption::TransType(self.trans_type),
            OptionName::TsbpdMode => SocketOption::TsbpdMode(self.tsbpd),
            OptionName::Passphrase => SocketOption::Passphrase(self.passphrase.clone()),
            OptionName::Latency => SocketOption::Latency(self.latency),
            OptionName::ConnectTimeout => SocketOption::ConnectTimeout(self.connect_timeout),
            OptionName::PeerIdleTimeout => SocketOption::PeerIdleTimeout(self.peer_idle_timeout),
        }
    }

    /// Store a value. Engine-side checks report `INVPARAM` rather than an argument error.
    pub fn set(&mut self, option: SocketOption) -> Result<()> {
        if option.validate().is_err() {
            return Err(Error::transport(ErrorCode::InvParam));
        }
        match option {
            SocketOption::RcvSyn(value) => self.rcv_syn = value,
            SocketOption::SndSyn(value) => self.snd_syn = value,
            SocketOption::StreamId(value) => self.stream_id = value,
            SocketOption::TransType(value) => self.trans_type = value,
            SocketOption::TsbpdMode(value) => self.tsbpd = value,
            SocketOption::Passphrase(value) => self.passphrase = value,
            SocketOption::Latency(value) => self.latency = value,
            SocketOption::ConnectTimeout(value) => self.connect_timeout = value,
            SocketOption::PeerIdleTimeout(value) => self.peer_idle_timeout = value,
        }
        Ok(())
    }
}
