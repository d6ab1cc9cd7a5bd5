//! Peer wire framing for the metadata exchange.
//!
//! Covers the 68-byte BitTorrent handshake, the length-prefixed extension
//! messages of BEP-10 and the ut_metadata message set of BEP-9. Every socket
//! read and write runs under its own deadline.

use crate::error::{MetadataError, TimeoutKind};
use bytes::Bytes;
use rbit::bencode::{self, Value};
use std::collections::BTreeMap;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Message id of BEP-10 extension messages.
pub const EXTENDED: u8 = 20;
/// Extension id of the extension handshake itself.
pub const EXT_HANDSHAKE: u8 = 0;

/// Size of one metadata piece.
pub const BLOCK_SIZE: usize = 16384;
/// Upper bound on pieces we will request for a single info dictionary.
pub const MAX_PIECES: u64 = 10_000;

pub const MSG_REQUEST: i64 = 0;
pub const MSG_DATA: i64 = 1;
pub const MSG_REJECT: i64 = 2;

// Far above a DATA frame or an extension handshake.
const MAX_MESSAGE_LEN: usize = 1024 * 1024;
// One DATA frame plus its header fits without regrowing.
const READ_CAPACITY: usize = BLOCK_SIZE + 64;
const MAX_DEPTH: usize = 64;

/// A stream wrapped with per-read and per-write deadlines.
pub struct Framed<S> {
    stream: S,
    read_timeout: Duration,
    write_timeout: Duration,
}

/// One length-prefixed message. `id` is the peer-protocol message id, `ext_id`
/// the extension-specific id (meaningful when `id == EXTENDED`).
#[derive(Debug, Clone)]
pub struct Message {
    pub id: u8,
    pub ext_id: u8,
    pub payload: Bytes,
}

impl<S> Framed<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            stream,
            read_timeout,
            write_timeout,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Writes all of `data` before the write deadline.
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<(), MetadataError> {
        timeout(self.write_timeout, self.stream.write_all(data))
            .await
            .map_err(|_| MetadataError::Timeout(TimeoutKind::Write))??;
        Ok(())
    }

    /// Reads exactly `size` bytes before the read deadline.
    ///
    /// The buffer grows with the bytes that actually arrive, so a large
    /// announced length costs nothing until the peer sends it.
    pub async fn read_packet(&mut self, size: usize) -> Result<Vec<u8>, MetadataError> {
        let mut buf = Vec::with_capacity(size.min(READ_CAPACITY));
        let mut body = (&mut self.stream).take(size as u64);
        timeout(self.read_timeout, body.read_to_end(&mut buf))
            .await
            .map_err(|_| MetadataError::Timeout(TimeoutKind::Read))??;
        if buf.len() < size {
            return Err(MetadataError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read: {} of {size} bytes", buf.len()),
            )));
        }
        Ok(buf)
    }

    /// Reads one `<u32 length><id><ext id><payload>` frame.
    ///
    /// A zero length prefix is a protocol error. Single-byte frames (choke,
    /// unchoke, ...) are reported with `ext_id` 0 and an empty payload.
    pub async fn read_message(&mut self) -> Result<Message, MetadataError> {
        let prefix = self.read_packet(4).await?;
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len == 0 {
            return Err(MetadataError::Protocol("zero-length message".into()));
        }
        if len > MAX_MESSAGE_LEN {
            return Err(MetadataError::Protocol(format!("message too large: {len}")));
        }

        let body = Bytes::from(self.read_packet(len).await?);
        let id = body[0];
        let ext_id = body.get(1).copied().unwrap_or(0);
        let payload = if body.len() > 2 {
            body.slice(2..)
        } else {
            Bytes::new()
        };
        Ok(Message {
            id,
            ext_id,
            payload,
        })
    }

    /// Frames `payload` as `len(payload) + 2`, `msg_id`, `ext_id`, `payload`.
    pub async fn write_packet_ext(
        &mut self,
        payload: &[u8],
        msg_id: u8,
        ext_id: u8,
    ) -> Result<(), MetadataError> {
        self.write_packet(&frame_ext(payload, msg_id, ext_id)).await
    }

    pub async fn send_handshake(
        &mut self,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
    ) -> Result<(), MetadataError> {
        self.write_packet(&handshake_packet(info_hash, peer_id)).await
    }

    /// Reads the peer's 68-byte handshake. The fields are returned unchecked;
    /// see [`verify_handshake`].
    pub async fn recv_handshake(&mut self) -> Result<Vec<u8>, MetadataError> {
        self.read_packet(HANDSHAKE_LEN).await
    }

    pub async fn send_ext_handshake(&mut self) -> Result<(), MetadataError> {
        let payload = ext_handshake_payload()?;
        self.write_packet_ext(&payload, EXTENDED, EXT_HANDSHAKE).await
    }

    pub async fn send_piece_request(
        &mut self,
        ut_metadata: u8,
        piece: usize,
    ) -> Result<(), MetadataError> {
        let payload = piece_request_payload(piece)?;
        self.write_packet_ext(&payload, EXTENDED, ut_metadata).await
    }
}

pub fn frame_ext(payload: &[u8], msg_id: u8, ext_id: u8) -> Vec<u8> {
    let len = payload.len() + 2;
    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    out.push(msg_id);
    out.push(ext_id);
    out.extend_from_slice(payload);
    out
}

/// `0x13`, the protocol string, 8 reserved bytes with the extension bit set,
/// info-hash, peer id.
pub fn handshake_packet(info_hash: &[u8; 20], peer_id: &[u8; 20]) -> [u8; HANDSHAKE_LEN] {
    let mut packet = [0u8; HANDSHAKE_LEN];
    packet[0] = PROTOCOL.len() as u8;
    packet[1..20].copy_from_slice(PROTOCOL);
    packet[25] = 0x10;
    packet[28..48].copy_from_slice(info_hash);
    packet[48..68].copy_from_slice(peer_id);
    packet
}

/// Checks the protocol string and that the peer echoed our info-hash.
pub fn verify_handshake(raw: &[u8], info_hash: &[u8; 20]) -> Result<(), MetadataError> {
    if raw.len() != HANDSHAKE_LEN {
        return Err(MetadataError::Protocol(format!(
            "handshake length {}",
            raw.len()
        )));
    }
    if raw[0] as usize != PROTOCOL.len() || &raw[1..20] != PROTOCOL {
        return Err(MetadataError::Protocol("unknown protocol in handshake".into()));
    }
    if raw[25] & 0x10 == 0 {
        return Err(MetadataError::Protocol(
            "peer does not support the extension protocol".into(),
        ));
    }
    if &raw[28..48] != info_hash {
        return Err(MetadataError::Protocol("info hash mismatch".into()));
    }
    Ok(())
}

fn key(k: &'static [u8]) -> Bytes {
    Bytes::from_static(k)
}

/// `{"m": {"ut_metadata": 0}}`
pub fn ext_handshake_payload() -> Result<Vec<u8>, MetadataError> {
    let mut m = BTreeMap::new();
    m.insert(key(b"ut_metadata"), Value::Integer(0));
    let mut dict = BTreeMap::new();
    dict.insert(key(b"m"), Value::Dict(m));
    Ok(bencode::encode(&Value::Dict(dict))?)
}

/// `{"msg_type": 0, "piece": piece}`
pub fn piece_request_payload(piece: usize) -> Result<Vec<u8>, MetadataError> {
    let mut dict = BTreeMap::new();
    dict.insert(key(b"msg_type"), Value::Integer(MSG_REQUEST));
    dict.insert(key(b"piece"), Value::Integer(piece as i64));
    Ok(bencode::encode(&Value::Dict(dict))?)
}

/// What the peer told us in its extension handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerExtensions {
    /// The peer's local id for ut_metadata messages.
    pub ut_metadata: u8,
    pub metadata_size: u64,
}

pub fn parse_ext_handshake(payload: &[u8]) -> Result<PeerExtensions, MetadataError> {
    if payload.is_empty() {
        return Err(MetadataError::Protocol("empty extension handshake".into()));
    }
    let value = bencode::decode(payload)?;
    if value.as_dict().is_none() {
        return Err(MetadataError::Decode(
            "extension handshake is not a dictionary".into(),
        ));
    }

    let metadata_size = value
        .get(b"metadata_size")
        .and_then(Value::as_integer)
        .ok_or_else(|| MetadataError::Protocol("no metadata_size".into()))?;
    let metadata_size = u64::try_from(metadata_size)
        .map_err(|_| MetadataError::Protocol(format!("negative metadata_size {metadata_size}")))?;

    let ut_metadata = value
        .get(b"m")
        .and_then(|m| m.get(b"ut_metadata"))
        .and_then(Value::as_integer)
        .ok_or_else(|| MetadataError::Protocol("no m.ut_metadata".into()))?;
    let ut_metadata = u8::try_from(ut_metadata)
        .map_err(|_| MetadataError::Protocol(format!("bad ut_metadata id {ut_metadata}")))?;

    Ok(PeerExtensions {
        ut_metadata,
        metadata_size,
    })
}

/// `ceil(metadata_size / BLOCK_SIZE)`
pub fn piece_count(metadata_size: u64) -> u64 {
    metadata_size.div_ceil(BLOCK_SIZE as u64)
}

/// True for a re-sent extension handshake: a dictionary carrying `m` and no
/// `msg_type`. Peers may repeat it at any time, and it shares ext id 0 with
/// the ut_metadata replies addressed to us.
pub fn is_ext_handshake(payload: &[u8]) -> bool {
    let Ok(len) = bencode_prefix_len(payload) else {
        return false;
    };
    match bencode::decode(&payload[..len]) {
        Ok(header) => header.get(b"m").is_some() && header.get(b"msg_type").is_none(),
        Err(_) => false,
    }
}

/// A decoded ut_metadata message. Payload bytes borrow from the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage<'a> {
    Request { piece: i64 },
    Data { piece: i64, data: &'a [u8] },
    Reject { piece: i64 },
    /// A msg_type outside the BEP-9 set.
    Unknown { msg_type: i64 },
}

/// Splits an ut_metadata payload into its bencoded header and trailing data.
pub fn parse_metadata_message(payload: &[u8]) -> Result<MetadataMessage<'_>, MetadataError> {
    let header_len = bencode_prefix_len(payload)?;
    let header = bencode::decode(&payload[..header_len])?;
    if header.as_dict().is_none() {
        return Err(MetadataError::Decode("ut_metadata header is not a dictionary".into()));
    }

    let msg_type = header
        .get(b"msg_type")
        .and_then(Value::as_integer)
        .ok_or_else(|| MetadataError::Protocol("missing msg_type".into()))?;
    let piece = || {
        header
            .get(b"piece")
            .and_then(Value::as_integer)
            .ok_or_else(|| MetadataError::Protocol("missing piece".into()))
    };

    Ok(match msg_type {
        MSG_REQUEST => MetadataMessage::Request { piece: piece()? },
        MSG_DATA => MetadataMessage::Data {
            piece: piece()?,
            data: &payload[header_len..],
        },
        MSG_REJECT => MetadataMessage::Reject {
            piece: header.get(b"piece").and_then(Value::as_integer).unwrap_or(-1),
        },
        other => MetadataMessage::Unknown { msg_type: other },
    })
}

/// Length in bytes of the single bencoded value at the start of `data`.
///
/// Trailing bytes are not inspected, so this locates the end of a header
/// that is followed by raw payload.
pub fn bencode_prefix_len(data: &[u8]) -> Result<usize, MetadataError> {
    let mut scanner = PrefixScanner { raw: data, pos: 0 };
    scanner.skip_value(0)?;
    Ok(scanner.pos)
}

struct PrefixScanner<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl PrefixScanner<'_> {
    fn peek(&self) -> Result<u8, MetadataError> {
        self.raw
            .get(self.pos)
            .copied()
            .ok_or_else(|| MetadataError::Decode("unexpected end of bencode".into()))
    }

    fn expect_byte(&mut self, b: u8) -> Result<(), MetadataError> {
        if self.peek()? != b {
            return Err(MetadataError::Decode(format!(
                "expected '{}' at offset {}",
                b as char, self.pos
            )));
        }
        self.pos += 1;
        Ok(())
    }

    fn parse_len(&mut self) -> Result<usize, MetadataError> {
        let start = self.pos;
        let mut n: usize = 0;
        while self.peek()?.is_ascii_digit() {
            let digit = (self.raw[self.pos] - b'0') as usize;
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add(digit))
                .ok_or_else(|| MetadataError::Decode("string length overflow".into()))?;
            self.pos += 1;
        }
        if self.pos == start {
            return Err(MetadataError::Decode("missing string length".into()));
        }
        Ok(n)
    }

    fn skip_string(&mut self) -> Result<(), MetadataError> {
        let len = self.parse_len()?;
        self.expect_byte(b':')?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.raw.len())
            .ok_or_else(|| MetadataError::Decode("string runs past end of input".into()))?;
        self.pos = end;
        Ok(())
    }

    fn skip_value(&mut self, depth: usize) -> Result<(), MetadataError> {
        if depth > MAX_DEPTH {
            return Err(MetadataError::Decode("nesting too deep".into()));
        }
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.pos += 1;
                }
                self.pos += 1;
                Ok(())
            }
            b'l' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.skip_value(depth + 1)?;
                }
                self.pos += 1;
                Ok(())
            }
            b'd' => {
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.skip_string()?;
                    self.skip_value(depth + 1)?;
                }
                self.pos += 1;
                Ok(())
            }
            b'0'..=b'9' => self.skip_string(),
            c => Err(MetadataError::Decode(format!(
                "unexpected character {:?} at offset {}",
                c as char, self.pos
            ))),
        }
    }
}
