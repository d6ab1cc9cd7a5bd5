//! Resolve a BitTorrent info-hash into its info dictionary by asking a single
//! known peer over the ut_metadata extension (BEP-9, BEP-10).
//!
//! [`Collector`] schedules many lookups with a cap on concurrent connections;
//! [`Fetcher`] runs one lookup directly.

pub mod collector;
pub mod config;
pub mod error;
pub mod metadata;
pub mod query;
pub mod request;
pub mod wire;

#[cfg(test)]
mod testing;

pub use collector::Collector;
pub use config::Options;
pub use error::{MetadataError, TimeoutKind};
pub use metadata::{Metadata, Torrent, TorrentFile, TorrentInfo};
pub use query::{Fetcher, OnError, OnSuccess, State, Timeouts};
pub use request::Request;
