// Packet module
// Datagram layout exchanged between engine sockets

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use super::options::TransmissionType;

/// Leading bytes of every datagram; anything else is dropped.
const MAGIC: u16 = 0x5244;
/// Handshake version spoken by this engine.
pub const VERSION: u32 = 1;
/// Bytes in front of a data payload.
pub const DATA_HEADER_LEN: usize = 2 + 1 + 4 + 4;

const KIND_HANDSHAKE: u8 = 1;
const KIND_ACCEPT: u8 = 2;
const KIND_REJECT: u8 = 3;
const KIND_DATA: u8 = 4;
const KIND_KEEPALIVE: u8 = 5;
const KIND_SHUTDOWN: u8 = 6;

pub type Digest32 = [u8; 32];

/// SHA-256 of the passphrase, or all zeros when there is none.
pub fn passphrase_digest(passphrase: &str) -> Digest32 {
    if passphrase.is_empty() {
        return [0; 32];
    }
    Sha256::digest(passphrase.as_bytes()).into()
}

/// Connection request sent by a connecting socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    pub trans_type: TransmissionType,
    pub tsbpd: bool,
    pub digest: Digest32,
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake(Handshake),
    Accept { version: u32 },
    Reject { code: i32 },
    Data { seq: u32, timestamp: u32, payload: Bytes },
    Keepalive,
    Shutdown,
}

impl Packet {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16(MAGIC);
        match self {
            Self::Handshake(handshake) => {
                buf.put_u8(KIND_HANDSHAKE);
                buf.put_u32(handshake.version);
                buf.put_u8(handshake.trans_type.code());
                buf.put_u8(u8::from(handshake.tsbpd));
                buf.put_slice(&handshake.digest);
                let stream_id = handshake.stream_id.as_bytes();
                // stream ids are capped well below u16::MAX
                buf.put_u16(u16::try_from(stream_id.len()).unwrap_or(u16::MAX));
                buf.put_slice(&stream_id[..stream_id.len().min(usize::from(u16::MAX))]);
            }
            Self::Accept { version } => {
                buf.put_u8(KIND_ACCEPT);
                buf.put_u32(*version);
            }
            Self::Reject { code } => {
                buf.put_u8(KIND_REJECT);
                buf.put_i32(*code);
            }
            Self::Data {
                seq,
                timestamp,
                payload,
            } => {
                buf.put_u8(KIND_DATA);
                buf.put_u32(*seq);
                buf.put_u32(*timestamp);
                buf.put_slice(payload);
            }
            Self::Keepalive => buf.put_u8(KIND_KEEPALIVE),
            Self::Shutdown => buf.put_u8(KIND_SHUTDOWN),
        }
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Handshake(handshake) => 3 + 4 + 2 + 32 + 2 + handshake.stream_id.len(),
            Self::Accept { .. } | Self::Reject { .. } => 3 + 4,
            Self::Data { payload, .. } => DATA_HEADER_LEN + payload.len(),
            Self::Keepalive | Self::Shutdown => 3,
        }
    }

    /// Parse one datagram. Returns `None` for foreign or truncated input.
    pub fn decode(datagram: &[u8]) -> Option<Self> {
        let mut buf = datagram;
        if buf.remaining() < 3 || buf.get_u16() != MAGIC {
            return None;
        }
        match buf.get_u8() {
            KIND_HANDSHAKE => {
                if buf.remaining() < 4 + 2 + 32 + 2 {
                    return None;
                }
                let version = buf.get_u32();
                let trans_type = TransmissionType::try_from(i64::from(buf.get_u8())).ok()?;
                let tsbpd = buf.get_u8() != 0;
                let mut digest = [0; 32];
                buf.copy_to_slice(&mut digest);
                let len = usize::from(buf.get_u16());
                if buf.remaining() < len {
                    return None;
                }
                let stream_id = std::str::from_utf8(&buf[..len]).ok()?.to_string();
                Some(Self::Handshake(Handshake {
                    version,
                    trans_type,
                    tsbpd,
                    digest,
                    stream_id,
                }))
            }
            KIND_ACCEPT if buf.remaining() >= 4 => Some(Self::Accept {
                version: buf.get_u32(),
            }),
            KIND_REJECT if buf.remaining() >= 4 => Some(Self::Reject {
                code: buf.get_i32(),
            }),
            KIND_DATA if buf.remaining() >= 8 => {
                let seq = buf.get_u32();
                let timestamp = buf.get_u32();
                Some(Self::Data {
                    seq,
                    timestamp,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            KIND_KEEPALIVE => Some(Self::Keepalive),
            KIND_SHUTDOWN => Some(Self::Shutdown),
            _ => None,
        }
    }
}
