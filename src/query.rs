//! One metadata query: a single TCP connection driven from dial to a decoded
//! info dictionary.

use crate::config::Options;
use crate::error::{MetadataError, TimeoutKind};
use crate::metadata::Metadata;
use crate::request::Request;
use crate::wire::{self, Framed, MetadataMessage, PeerExtensions};
use bytes::Bytes;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout, timeout_at};

pub type OnSuccess = Arc<dyn Fn(&Request, &Metadata) + Send + Sync>;
pub type OnError = Arc<dyn Fn(&Request, &MetadataError) + Send + Sync>;

/// Progress of a query. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Init,
    Dialing,
    Handshaking,
    ExtHandshaking,
    RequestingPieces,
    CollectingPieces,
    Success,
    Failure,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Success | State::Failure)
    }
}

/// Deadlines for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub dial: Duration,
    pub read: Duration,
    pub write: Duration,
    pub pieces: Duration,
}

impl Timeouts {
    /// Request overrides take precedence over the collector defaults.
    pub fn for_request(request: &Request, options: &Options) -> Self {
        Self {
            dial: request.dial_timeout.unwrap_or(options.dial_timeout),
            read: request.read_timeout.unwrap_or(options.read_timeout),
            write: request.write_timeout.unwrap_or(options.write_timeout),
            pieces: options.pieces_timeout,
        }
    }
}

impl From<&Options> for Timeouts {
    fn from(options: &Options) -> Self {
        Self {
            dial: options.dial_timeout,
            read: options.read_timeout,
            write: options.write_timeout,
            pieces: options.pieces_timeout,
        }
    }
}

/// Drives the protocol for a single request. No retries: the first error
/// ends the run in [`State::Failure`].
pub struct Fetcher<'a> {
    request: &'a Request,
    timeouts: Timeouts,
    verify_handshake: bool,
    state: State,
}

impl<'a> Fetcher<'a> {
    pub fn new(request: &'a Request, timeouts: Timeouts) -> Self {
        Self {
            request,
            timeouts,
            verify_handshake: false,
            state: State::Init,
        }
    }

    pub fn verify_handshake(mut self, enabled: bool) -> Self {
        self.verify_handshake = enabled;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Dials the peer and runs the exchange over the new connection.
    pub async fn run(&mut self) -> Result<Metadata, MetadataError> {
        let result = self.dial_and_exchange().await;
        self.finish(result)
    }

    /// Runs the exchange over an already connected stream.
    pub async fn run_on<S>(&mut self, stream: S) -> Result<Metadata, MetadataError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.exchange(stream).await;
        self.finish(result)
    }

    fn finish(&mut self, result: Result<Metadata, MetadataError>) -> Result<Metadata, MetadataError> {
        match &result {
            Ok(meta) => {
                tracing::debug!(hash = %self.request.hash_info, peer = %self.request.remote_addr(), name = %meta.name(), "query: done");
                self.state = State::Success;
            }
            Err(err) => {
                tracing::debug!(hash = %self.request.hash_info, peer = %self.request.remote_addr(), state = ?self.state, err = %err, "query: failed");
                self.state = State::Failure;
            }
        }
        result
    }

    fn advance(&mut self, next: State) {
        debug_assert!(next > self.state, "query state moved backwards");
        tracing::trace!(hash = %self.request.hash_info, from = ?self.state, to = ?next, "query: step");
        self.state = next;
    }

    async fn dial_and_exchange(&mut self) -> Result<Metadata, MetadataError> {
        // Validate before touching the network.
        self.request.info_hash()?;
        self.request.peer_id_bytes()?;

        self.advance(State::Dialing);
        let addr = self.request.remote_addr();
        let stream = timeout(self.timeouts.dial, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| MetadataError::Timeout(TimeoutKind::Dial))?
            .map_err(MetadataError::Connect)?;

        // Close with RST, no lingering in FIN_WAIT/TIME_WAIT.
        #[allow(deprecated)]
        let linger = stream.set_linger(Some(Duration::ZERO));
        if let Err(err) = linger {
            tracing::trace!(%err, peer = %addr, "query: set_linger failed");
        }

        self.exchange(stream).await
    }

    async fn exchange<S>(&mut self, stream: S) -> Result<Metadata, MetadataError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let info_hash = self.request.info_hash()?;
        let peer_id = self.request.peer_id_bytes()?;
        let mut framed = Framed::new(stream, self.timeouts.read, self.timeouts.write);

        self.advance(State::Handshaking);
        framed.send_handshake(&info_hash, &peer_id).await?;
        let reply = framed.recv_handshake().await?;
        if self.verify_handshake {
            wire::verify_handshake(&reply, &info_hash)?;
        }

        self.advance(State::ExtHandshaking);
        framed.send_ext_handshake().await?;
        let ext = timeout(self.timeouts.pieces, wait_ext_handshake(&mut framed))
            .await
            .map_err(|_| MetadataError::Timeout(TimeoutKind::Handshake))??;

        let count = wire::piece_count(ext.metadata_size);
        if count > wire::MAX_PIECES {
            return Err(MetadataError::TooManyPieces { pieces: count });
        }
        if count == 0 {
            return Err(MetadataError::Protocol("peer advertised empty metadata".into()));
        }
        let count = count as usize;

        self.advance(State::RequestingPieces);
        for piece in 0..count {
            framed.send_piece_request(ext.ut_metadata, piece).await?;
        }
        tracing::trace!(hash = %self.request.hash_info, pieces = count, size = ext.metadata_size, "query: requested pieces");

        self.advance(State::CollectingPieces);
        let deadline = Instant::now() + self.timeouts.pieces;
        let data = timeout_at(deadline, collect_pieces(&mut framed, ext))
            .await
            .map_err(|_| MetadataError::Timeout(TimeoutKind::Pieces))??;

        Metadata::from_bytes(&data)
    }
}

/// Reads until the peer's extension handshake shows up. Regular peer
/// messages (bitfield, have, unchoke) may arrive first and are skipped.
async fn wait_ext_handshake<S>(framed: &mut Framed<S>) -> Result<PeerExtensions, MetadataError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = framed.read_message().await?;
        if msg.id != wire::EXTENDED || msg.ext_id != wire::EXT_HANDSHAKE {
            continue;
        }
        return wire::parse_ext_handshake(&msg.payload);
    }
}

/// Gathers every piece into its slot and returns them joined in index order.
async fn collect_pieces<S>(
    framed: &mut Framed<S>,
    ext: PeerExtensions,
) -> Result<Vec<u8>, MetadataError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let total = ext.metadata_size as usize;
    let count = wire::piece_count(ext.metadata_size) as usize;
    let mut pieces: Vec<Option<Bytes>> = vec![None; count];
    let mut missing = count;

    while missing > 0 {
        let msg = framed.read_message().await?;
        if msg.id != wire::EXTENDED {
            continue;
        }
        if msg.ext_id == wire::EXT_HANDSHAKE && wire::is_ext_handshake(&msg.payload) {
            tracing::trace!("query: extension handshake repeated");
            continue;
        }

        let (piece, data) = match wire::parse_metadata_message(&msg.payload)? {
            MetadataMessage::Data { piece, data } => (piece, data),
            MetadataMessage::Reject { piece } => {
                return Err(MetadataError::RejectedByPeer { piece });
            }
            MetadataMessage::Request { .. } | MetadataMessage::Unknown { .. } => continue,
        };

        let index = usize::try_from(piece)
            .ok()
            .filter(|i| *i < count)
            .ok_or_else(|| MetadataError::Protocol(format!("piece index {piece} out of range")))?;

        // Every piece but the last is a full block.
        let expected = (total - index * wire::BLOCK_SIZE).min(wire::BLOCK_SIZE);
        if data.len() != expected {
            return Err(MetadataError::Protocol(format!(
                "piece {index}: got {} bytes, expected {expected}",
                data.len()
            )));
        }

        if pieces[index].is_some() {
            tracing::trace!(piece = index, "query: duplicate piece ignored");
            continue;
        }
        pieces[index] = Some(msg.payload.slice_ref(data));
        missing -= 1;
    }

    let mut out = Vec::with_capacity(total);
    for piece in pieces.into_iter().flatten() {
        out.extend_from_slice(&piece);
    }
    Ok(out)
}

/// A request bound to its callbacks and completion signal, as scheduled by
/// the collector.
pub(crate) struct Query {
    request: Arc<Request>,
    timeouts: Timeouts,
    verify_handshake: bool,
    on_success: OnSuccess,
    on_error: OnError,
    done: Option<oneshot::Sender<()>>,
}

impl Query {
    pub(crate) fn new(
        request: Request,
        options: &Options,
        on_success: OnSuccess,
        on_error: OnError,
    ) -> (Self, oneshot::Receiver<()>) {
        let (done_tx, done_rx) = oneshot::channel();
        let query = Self {
            timeouts: Timeouts::for_request(&request, options),
            request: Arc::new(request),
            verify_handshake: options.verify_handshake,
            on_success,
            on_error,
            done: Some(done_tx),
        };
        (query, done_rx)
    }

    pub(crate) fn request(&self) -> &Request {
        &self.request
    }

    /// Runs the protocol, releases the collector slot, then fires exactly one
    /// callback and the completion signal.
    pub(crate) async fn run(self, completed: mpsc::Sender<()>) {
        let result = self.resolve().await;
        // The loop may already be gone after close; nothing to release then.
        let _ = completed.send(()).await;
        self.finish(result);
    }

    /// Fails the query without running it.
    pub(crate) fn fail(self, err: MetadataError) {
        self.finish(Err(err));
    }

    // The protocol runs in its own task so a panic anywhere inside it comes
    // back as a JoinError instead of unwinding through the collector.
    async fn resolve(&self) -> Result<Metadata, MetadataError> {
        let request = self.request.clone();
        let timeouts = self.timeouts;
        let verify = self.verify_handshake;
        let task = tokio::spawn(async move {
            Fetcher::new(&request, timeouts)
                .verify_handshake(verify)
                .run()
                .await
        });

        match task.await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(hash = %self.request.hash_info, peer = %self.request.remote_addr(), %err, "query: task failed");
                Err(MetadataError::Panicked(err.to_string()))
            }
        }
    }

    fn finish(mut self, result: Result<Metadata, MetadataError>) {
        let request = &*self.request;
        let outcome = catch_unwind(AssertUnwindSafe(|| match &result {
            Ok(meta) => (self.on_success)(request, meta),
            Err(err) => (self.on_error)(request, err),
        }));
        if outcome.is_err() {
            tracing::error!(hash = %request.hash_info, "query: callback panicked");
        }

        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}
