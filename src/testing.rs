//! Scripted in-process peer used by the unit tests.

use crate::request::Request;
use crate::wire::{self, BLOCK_SIZE, EXTENDED, MSG_DATA, MSG_REJECT};
use bytes::Bytes;
use rbit::bencode::{self, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;

pub(crate) const HASH: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";
pub(crate) const PEER_ID: &str = "2d4d463030302d31323334353637383930313233";
// The peer's local id for ut_metadata.
const PEER_UT_METADATA: u8 = 3;

#[derive(Clone, Debug)]
pub(crate) enum Script {
    /// Answer every request; pieces go out in `order` (index order if `None`).
    Serve {
        order: Option<Vec<usize>>,
        noise: bool,
    },
    /// Answer the first request with a reject.
    Reject,
    /// Advertise this metadata size, then only count requests.
    Advertise(u64),
    NoUtMetadata,
    /// Read the handshake and never write anything.
    Silent,
    /// Keep sending unchoke messages instead of pieces.
    Stall,
}

impl Script {
    pub(crate) fn serve() -> Self {
        Script::Serve {
            order: None,
            noise: false,
        }
    }

    pub(crate) fn serve_in(order: Vec<usize>) -> Self {
        Script::Serve {
            order: Some(order),
            noise: false,
        }
    }

    pub(crate) fn with_noise(self) -> Self {
        match self {
            Script::Serve { order, .. } => Script::Serve { order, noise: true },
            other => other,
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct Counters {
    pub(crate) requests: Arc<AtomicUsize>,
    pub(crate) data_sent: Arc<AtomicUsize>,
    pub(crate) accepted: Arc<AtomicUsize>,
    pub(crate) closed: Arc<Notify>,
}

pub(crate) struct FakePeer {
    pub(crate) addr: SocketAddr,
    pub(crate) requests: Arc<AtomicUsize>,
    pub(crate) data_sent: Arc<AtomicUsize>,
    pub(crate) accepted: Arc<AtomicUsize>,
    closed: Arc<Notify>,
}

impl FakePeer {
    pub(crate) async fn start(info: Vec<u8>, script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counters = Counters::default();
        let info = Arc::new(info);

        let c = counters.clone();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                c.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_stream(sock, info.clone(), script.clone(), c.clone()));
            }
        });

        Self {
            addr,
            requests: counters.requests,
            data_sent: counters.data_sent,
            accepted: counters.accepted,
            closed: counters.closed,
        }
    }

    pub(crate) fn request(&self) -> Request {
        Request::new(self.addr.ip().to_string(), self.addr.port(), HASH, PEER_ID)
    }

    /// Waits until one connection handler has finished.
    pub(crate) async fn wait_closed(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.closed.notified())
            .await
            .expect("peer connection did not close");
    }
}

/// Bencoded info dictionary whose encoding is exactly `size` bytes.
pub(crate) fn info_of_size(size: usize) -> Vec<u8> {
    let build = |filler: usize| {
        let mut d = BTreeMap::new();
        d.insert(Bytes::from_static(b"length"), Value::Integer(1));
        d.insert(Bytes::from_static(b"name"), Value::string("sample"));
        d.insert(Bytes::from_static(b"piece length"), Value::Integer(16384));
        d.insert(
            Bytes::from_static(b"pieces"),
            Value::Bytes(Bytes::from(vec![0x5a; filler])),
        );
        bencode::encode(&Value::Dict(d)).unwrap()
    };
    let base = build(0).len();
    assert!(size >= base, "info must be at least {base} bytes");
    (size.saturating_sub(base + 8)..=size)
        .map(build)
        .find(|b| b.len() == size)
        .expect("no filler length hits the requested size")
}

fn ext_frame(value: &Value, ext_id: u8, tail: &[u8]) -> Vec<u8> {
    let mut payload = bencode::encode(value).unwrap();
    payload.extend_from_slice(tail);
    wire::frame_ext(&payload, EXTENDED, ext_id)
}

fn kv(key: &'static [u8], value: Value) -> (&'static [u8], Value) {
    (key, value)
}

fn dict(entries: Vec<(&'static [u8], Value)>) -> Value {
    Value::Dict(
        entries
            .into_iter()
            .map(|(k, v)| (Bytes::from_static(k), v))
            .collect(),
    )
}

async fn read_frame<S: AsyncRead + Unpin>(sock: &mut S) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    sock.read_exact(&mut len).await?;
    let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
    sock.read_exact(&mut body).await?;
    Ok(body)
}

pub(crate) async fn serve_stream<S>(mut sock: S, info: Arc<Vec<u8>>, script: Script, counters: Counters)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _ = serve_script(&mut sock, &info, &script, &counters).await;
    hold_until_closed(&mut sock).await;
    counters.closed.notify_one();
}

/// Handshakes, advertises `metadata_size`, takes the piece requests, then
/// writes `frames` verbatim.
pub(crate) async fn serve_frames<S>(mut sock: S, metadata_size: u64, frames: Vec<Vec<u8>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let script = async {
        let mut handshake = [0u8; wire::HANDSHAKE_LEN];
        sock.read_exact(&mut handshake).await?;
        sock.write_all(&handshake).await?;
        read_frame(&mut sock).await?;
        sock.write_all(&ext_handshake_frame(metadata_size, true)).await?;
        for _ in 0..wire::piece_count(metadata_size) {
            read_frame(&mut sock).await?;
        }
        for frame in &frames {
            sock.write_all(frame).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let _ = script.await;
    hold_until_closed(&mut sock).await;
}

async fn hold_until_closed<S: AsyncRead + Unpin>(sock: &mut S) {
    let mut sink = [0u8; 1024];
    while let Ok(n) = sock.read(&mut sink).await {
        if n == 0 {
            break;
        }
    }
}

/// The peer's extension handshake advertising `size` bytes of metadata.
pub(crate) fn ext_handshake_frame(size: u64, ut_metadata: bool) -> Vec<u8> {
    let mut m = vec![];
    if ut_metadata {
        m.push(kv(b"ut_metadata", Value::Integer(PEER_UT_METADATA as i64)));
    }
    let reply = dict(vec![
        kv(b"m", dict(m)),
        kv(b"metadata_size", Value::Integer(size as i64)),
    ]);
    ext_frame(&reply, wire::EXT_HANDSHAKE, &[])
}

/// A DATA reply for `piece`; our side uses ext id 0 for ut_metadata.
pub(crate) fn data_frame(piece: i64, total_size: usize, data: &[u8]) -> Vec<u8> {
    let header = dict(vec![
        kv(b"msg_type", Value::Integer(MSG_DATA)),
        kv(b"piece", Value::Integer(piece)),
        kv(b"total_size", Value::Integer(total_size as i64)),
    ]);
    ext_frame(&header, 0, data)
}

async fn serve_script<S>(
    sock: &mut S,
    info: &[u8],
    script: &Script,
    counters: &Counters,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = [0u8; wire::HANDSHAKE_LEN];
    sock.read_exact(&mut handshake).await?;
    if matches!(script, Script::Silent) {
        return Ok(());
    }
    sock.write_all(&handshake).await?;

    let _ext_handshake = read_frame(sock).await?;

    if matches!(script, Script::Serve { noise: true, .. }) {
        sock.write_all(&[0, 0, 0, 1, 1]).await?; // unchoke
        sock.write_all(&[0, 0, 0, 3, 5, 0xff, 0x80]).await?; // bitfield
        sock.write_all(&[0, 0, 0, 5, 4, 0, 0, 0, 9]).await?; // have
    }

    let size = match script {
        Script::Advertise(size) => *size,
        _ => info.len() as u64,
    };
    let ut_metadata = !matches!(script, Script::NoUtMetadata);
    sock.write_all(&ext_handshake_frame(size, ut_metadata)).await?;

    if matches!(script, Script::Advertise(_) | Script::NoUtMetadata) {
        loop {
            read_frame(sock).await?;
            counters.requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    let count = wire::piece_count(size) as usize;
    for _ in 0..count {
        let frame = read_frame(sock).await?;
        assert_eq!(frame[0], EXTENDED);
        assert_eq!(frame[1], PEER_UT_METADATA);
        counters.requests.fetch_add(1, Ordering::SeqCst);
    }

    match script {
        Script::Reject => {
            let reject = dict(vec![
                kv(b"msg_type", Value::Integer(MSG_REJECT)),
                kv(b"piece", Value::Integer(0)),
            ]);
            // Our side uses ext id 0 for ut_metadata.
            sock.write_all(&ext_frame(&reject, 0, &[])).await?;
        }
        Script::Stall => loop {
            sock.write_all(&[0, 0, 0, 1, 1]).await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
        },
        Script::Serve { order, .. } => {
            let order = order.clone().unwrap_or_else(|| (0..count).collect());
            for piece in order {
                let start = piece * BLOCK_SIZE;
                let end = (start + BLOCK_SIZE).min(info.len());
                let frame = data_frame(piece as i64, info.len(), &info[start..end]);
                sock.write_all(&frame).await?;
                counters.data_sent.fetch_add(1, Ordering::SeqCst);
            }
        }
        _ => {}
    }
    Ok(())
}
