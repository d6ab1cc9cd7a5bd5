//! Typed views over a fetched info dictionary, and `.torrent` re-serialisation.

use crate::error::MetadataError;
use bytes::Bytes;
use rbit::bencode::{self, Value};
use serde::Serialize;
use std::collections::BTreeMap;

/// The info dictionary fetched from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    name: String,
    raw: Value,
}

impl Metadata {
    /// Decodes reassembled metadata bytes. The result must be a dictionary
    /// with a byte-string `name` (or `name.utf-8`).
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetadataError> {
        let raw = bencode::decode(data)?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: Value) -> Result<Self, MetadataError> {
        if raw.as_dict().is_none() {
            return Err(MetadataError::Decode("metadata is not a dictionary".into()));
        }
        let name = display_name(&raw)
            .ok_or_else(|| MetadataError::Decode("metadata has no name".into()))?;
        Ok(Self { name, raw })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }

    /// The info dictionary re-encoded on its own.
    pub fn info_bytes(&self) -> Result<Vec<u8>, MetadataError> {
        Ok(bencode::encode(&self.raw)?)
    }

    /// A minimal `.torrent` body: `{"info": <metadata>}`.
    pub fn torrent_bytes(&self) -> Result<Vec<u8>, MetadataError> {
        Ok(bencode::encode(&wrap_info(self.raw.clone(), None))?)
    }

    pub fn to_torrent(&self, announce: Option<&str>) -> Result<Torrent, MetadataError> {
        Torrent::from_value(wrap_info(self.raw.clone(), announce))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TorrentFile {
    pub length: i64,
    /// Path components joined with `/`.
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: i64,
    /// Hex of the concatenated SHA-1 piece hashes.
    pub pieces: String,
    /// Total length for single-file torrents, 0 otherwise.
    pub length: i64,
    pub files: Vec<TorrentFile>,
}

/// A complete torrent: the decoded dictionary plus fields extracted once at
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Torrent {
    pub announce: String,
    pub info: TorrentInfo,
    #[serde(skip)]
    raw: Value,
}

impl Torrent {
    /// Builds a torrent from reassembled metadata bytes (an info dictionary).
    pub fn from_metadata_bytes(data: &[u8]) -> Result<Self, MetadataError> {
        let info = bencode::decode(data)?;
        Self::from_value(wrap_info(info, None))
    }

    /// Parses a whole `.torrent` file body.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetadataError> {
        Self::from_value(bencode::decode(data)?)
    }

    fn from_value(raw: Value) -> Result<Self, MetadataError> {
        if raw.as_dict().is_none() {
            return Err(MetadataError::Decode("torrent is not a dictionary".into()));
        }
        let announce = raw
            .get(b"announce")
            .and_then(Value::as_bytes)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();

        let info = raw
            .get(b"info")
            .ok_or_else(|| MetadataError::Decode("torrent has no info dictionary".into()))?;
        let info = extract_info(info)?;

        Ok(Self {
            announce,
            info,
            raw,
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// The `.torrent` file body.
    pub fn bytes(&self) -> Result<Vec<u8>, MetadataError> {
        Ok(bencode::encode(&self.raw)?)
    }
}

fn wrap_info(info: Value, announce: Option<&str>) -> Value {
    let mut dict = BTreeMap::new();
    dict.insert(Bytes::from_static(b"info"), info);
    if let Some(announce) = announce.filter(|a| !a.is_empty()) {
        dict.insert(Bytes::from_static(b"announce"), Value::string(announce));
    }
    Value::Dict(dict)
}

fn display_name(info: &Value) -> Option<String> {
    info.get(b"name.utf-8")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            info.get(b"name")
                .and_then(Value::as_bytes)
                .map(|b| String::from_utf8_lossy(b).into_owned())
        })
}

fn extract_info(info: &Value) -> Result<TorrentInfo, MetadataError> {
    if info.as_dict().is_none() {
        return Err(MetadataError::Decode("info is not a dictionary".into()));
    }

    let files = info
        .get(b"files")
        .and_then(Value::as_list)
        .map(|files| files.iter().filter_map(extract_file).collect())
        .unwrap_or_default();

    Ok(TorrentInfo {
        name: display_name(info).unwrap_or_default(),
        piece_length: info
            .get(b"piece length")
            .and_then(Value::as_integer)
            .unwrap_or(0),
        pieces: info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .map(hex::encode)
            .unwrap_or_default(),
        length: info.get(b"length").and_then(Value::as_integer).unwrap_or(0),
        files,
    })
}

fn extract_file(file: &Value) -> Option<TorrentFile> {
    let path = file
        .get(b"path.utf-8")
        .or_else(|| file.get(b"path"))
        .and_then(Value::as_list)?;
    let path = path
        .iter()
        .filter_map(Value::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    Some(TorrentFile {
        length: file.get(b"length").and_then(Value::as_integer).unwrap_or(0),
        path,
    })
}
