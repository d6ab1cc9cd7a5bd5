use crate::error::MetadataError;
use std::net::IpAddr;
use std::time::Duration;

/// A single metadata lookup: which torrent to ask for, and which peer to ask.
///
/// `hash_info` and `peer_id` are 40-character hex strings. The optional
/// timeouts override the collector's defaults for this request only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub ip: String,
    pub port: u16,
    pub hash_info: String,
    pub peer_id: String,
    pub dial_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Request {
    pub fn new(
        ip: impl Into<String>,
        port: u16,
        hash_info: impl Into<String>,
        peer_id: impl Into<String>,
    ) -> Self {
        Self {
            ip: ip.into(),
            port,
            hash_info: hash_info.into(),
            peer_id: peer_id.into(),
            dial_timeout: None,
            read_timeout: None,
            write_timeout: None,
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// `ip:port`, with IPv6 literals bracketed.
    pub fn remote_addr(&self) -> String {
        match self.ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.port),
            _ => format!("{}:{}", self.ip, self.port),
        }
    }

    pub fn info_hash(&self) -> Result<[u8; 20], MetadataError> {
        parse_hex_20(&self.hash_info)
            .map_err(|e| MetadataError::InvalidRequest(format!("info hash: {e}")))
    }

    pub fn peer_id_bytes(&self) -> Result<[u8; 20], MetadataError> {
        parse_hex_20(&self.peer_id)
            .map_err(|e| MetadataError::InvalidRequest(format!("peer id: {e}")))
    }

    pub fn magnet_link(&self) -> String {
        format!("magnet:?xt=urn:btih:{}", self.hash_info)
    }
}

fn parse_hex_20(s: &str) -> Result<[u8; 20], String> {
    let bytes = hex::decode(s.trim()).map_err(|e| e.to_string())?;
    if bytes.len() != 20 {
        return Err(format!("expected 20 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}
