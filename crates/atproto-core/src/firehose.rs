//! Firehose client: a single WebSocket connection to a relay's
//! `com.atproto.sync.subscribeRepos` endpoint, decoding frames and handing
//! them to a caller-supplied sink.
//!
//! Reconnection policy (backoff, retry) is deliberately left to the caller —
//! this type performs exactly one connection attempt per call to
//! [`FirehoseClient::connect_and_run`] and returns an error on any transport
//! failure, so the supervisor can decide how to respond.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use ipld_core::cid::Cid;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::AtprotoError;

/// Default firehose relay URL.
pub const DEFAULT_FIREHOSE_URL: &str = "wss://bsky.network";

/// Sent as the `User-Agent` header on every connection attempt.
const USER_AGENT_VALUE: &str = concat!("atproto-core/", env!("CARGO_PKG_VERSION"));

/// A decoded firehose frame, ready for routing to the per-repository
/// scheduler. Frame kinds the pipeline has no use for (`#info`, unknown
/// types) are swallowed at decode time and never constructed here.
#[derive(Debug, Clone)]
pub enum Frame {
    Commit(CommitFrame),
    Identity(IdentityFrame),
    Account(IdentityFrame),
    Handle(IdentityFrame),
    Tombstone(IdentityFrame),
    Migrate(IdentityFrame),
}

impl Frame {
    /// Sequence number, present on every frame kind the pipeline cares about.
    pub fn seq(&self) -> i64 {
        match self {
            Frame::Commit(c) => c.seq,
            Frame::Identity(f)
            | Frame::Account(f)
            | Frame::Handle(f)
            | Frame::Tombstone(f)
            | Frame::Migrate(f) => f.seq,
        }
    }

    /// Repository/subject this frame concerns; used as the scheduler's
    /// ordering key.
    pub fn repo(&self) -> &str {
        match self {
            Frame::Commit(c) => &c.repo,
            Frame::Identity(f)
            | Frame::Account(f)
            | Frame::Handle(f)
            | Frame::Tombstone(f)
            | Frame::Migrate(f) => &f.did,
        }
    }
}

/// A decoded `#commit` frame, with its CAR-bundled blocks left undecoded —
/// the commit decoder (see `atproto_core::car`) extracts and verifies
/// individual records from it.
#[derive(Debug, Clone)]
pub struct CommitFrame {
    pub seq: i64,
    pub repo: String,
    pub rev: String,
    pub too_big: bool,
    pub ops: Vec<RepoOp>,
    pub blocks: Option<Vec<u8>>,
    pub time: String,
}

#[derive(Debug, Clone)]
pub struct RepoOp {
    pub action: String,
    pub path: String,
    pub cid: Option<Cid>,
}

/// A decoded `#identity`/`#account`/`#handle`/`#tombstone`/`#migrate` frame.
/// These carry no payload the pipeline needs beyond "this subject's identity
/// changed" — the identity resolver re-resolves on receipt (see §4.4).
#[derive(Debug, Clone)]
pub struct IdentityFrame {
    pub seq: i64,
    pub did: String,
    pub time: String,
}

/// Tracks wall-clock time of the last frame observed on the connection, so a
/// liveness monitor can detect a relay that has gone silent without closing
/// the socket.
#[derive(Clone, Default)]
pub struct Liveness(Arc<AtomicI64>);

impl Liveness {
    pub fn new() -> Self {
        let liveness = Self(Arc::new(AtomicI64::new(0)));
        liveness.touch();
        liveness
    }

    fn touch(&self) {
        let now = now_millis();
        self.0.store(now, Ordering::Relaxed);
    }

    /// Milliseconds elapsed since the last observed frame.
    pub fn millis_since_last(&self) -> i64 {
        (now_millis() - self.0.load(Ordering::Relaxed)).max(0)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Client for a single firehose connection.
pub struct FirehoseClient {
    url: String,
    liveness: Liveness,
}

impl FirehoseClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            liveness: Liveness::new(),
        }
    }

    /// A handle the supervisor can poll to detect a stalled connection.
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Connect once and stream frames into `frame_tx` until the socket
    /// closes, a transport error occurs, or `shutdown_rx` fires.
    ///
    /// `resume_seq`, when set, is appended as `?seq=<n>` so the relay resumes
    /// from that sequence number rather than replaying its full backlog.
    pub async fn connect_and_run(
        &self,
        resume_seq: Option<i64>,
        frame_tx: mpsc::Sender<Frame>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), AtprotoError> {
        let mut url = format!("{}/xrpc/com.atproto.sync.subscribeRepos", self.url);
        if let Some(seq) = resume_seq {
            url.push_str(&format!("?seq={}", seq));
        }

        info!(url = %url, resume_seq = ?resume_seq, "connecting to firehose");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AtprotoError::WebSocket(format!("invalid request: {}", e)))?;
        request
            .headers_mut()
            .insert(USER_AGENT, USER_AGENT_VALUE.parse().expect("static user-agent value is valid"));

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| AtprotoError::WebSocket(format!("connection failed: {}", e)))?;

        let (_write, mut read) = ws_stream.split();
        info!("firehose connected");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("firehose client shutting down");
                        return Ok(());
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            self.liveness.touch();
                            match decode_frame(&data) {
                                Ok(Some(frame)) => {
                                    if frame_tx.send(frame).await.is_err() {
                                        return Ok(());
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => warn!(error = %e, "failed to decode firehose frame"),
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("firehose connection closed by relay");
                            return Err(AtprotoError::WebSocket("connection closed".to_string()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(AtprotoError::WebSocket(format!("read error: {}", e)));
                        }
                        None => {
                            return Err(AtprotoError::WebSocket("stream ended".to_string()));
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct FrameHeader {
    /// 1 = message, -1 = error.
    op: i32,
    t: Option<String>,
}

/// Decode the two-CBOR-value frame (header, then type-specific payload) into
/// a [`Frame`], or `None` for frame kinds the pipeline ignores (`#info`,
/// unknown types, error frames).
fn decode_frame(data: &[u8]) -> Result<Option<Frame>, AtprotoError> {
    let (header, offset) = decode_frame_header(data)?;

    if header.op != 1 {
        if header.op == -1 {
            let payload = &data[offset..];
            match serde_ipld_dagcbor::from_slice::<RelayErrorPayload>(payload) {
                Ok(err) => error!(error_type = ?err.error, message = ?err.message, "firehose error frame"),
                Err(_) => error!("firehose error frame (undecodable payload)"),
            }
        }
        return Ok(None);
    }

    let payload = &data[offset..];

    match header.t.as_deref() {
        Some("#commit") => {
            let raw: RawCommit = serde_ipld_dagcbor::from_slice(payload)
                .map_err(|e| AtprotoError::CborDecode(format!("commit: {}", e)))?;
            Ok(Some(Frame::Commit(CommitFrame {
                seq: raw.seq,
                repo: raw.repo,
                rev: raw.rev,
                too_big: raw.too_big,
                ops: raw
                    .ops
                    .into_iter()
                    .map(|o| RepoOp {
                        action: o.action,
                        path: o.path,
                        cid: o.cid,
                    })
                    .collect(),
                blocks: raw.blocks,
                time: raw.time,
            })))
        }
        Some(t @ ("#identity" | "#account" | "#handle" | "#tombstone" | "#migrate")) => {
            let raw: RawIdentityEvent = serde_ipld_dagcbor::from_slice(payload)
                .map_err(|e| AtprotoError::CborDecode(format!("{}: {}", t, e)))?;
            let frame = IdentityFrame {
                seq: raw.seq,
                did: raw.did,
                time: raw.time,
            };
            Ok(Some(match t {
                "#identity" => Frame::Identity(frame),
                "#account" => Frame::Account(frame),
                "#handle" => Frame::Handle(frame),
                "#tombstone" => Frame::Tombstone(frame),
                _ => Frame::Migrate(frame),
            }))
        }
        Some("#info") => {
            if let Ok(info) = serde_ipld_dagcbor::from_slice::<InfoEvent>(payload) {
                debug!(name = ?info.name, message = ?info.message, "firehose info");
            }
            Ok(None)
        }
        Some(t) => {
            trace!(message_type = %t, "ignoring unknown firehose frame type");
            Ok(None)
        }
        None => {
            trace!("ignoring firehose frame with no type");
            Ok(None)
        }
    }
}

fn decode_frame_header(data: &[u8]) -> Result<(FrameHeader, usize), AtprotoError> {
    let mut cursor = Cursor::new(data);
    let header: FrameHeader = ciborium::from_reader(&mut cursor)
        .map_err(|e| AtprotoError::CborDecode(format!("frame header: {}", e)))?;
    let offset = cursor.position() as usize;
    Ok((header, offset))
}

#[derive(Debug, Deserialize)]
struct RawCommit {
    seq: i64,
    repo: String,
    rev: String,
    #[serde(rename = "tooBig", default)]
    too_big: bool,
    ops: Vec<RawRepoOp>,
    #[serde(with = "serde_bytes", default)]
    blocks: Option<Vec<u8>>,
    time: String,
}

#[derive(Debug, Deserialize)]
struct RawRepoOp {
    action: String,
    path: String,
    cid: Option<Cid>,
}

#[derive(Debug, Deserialize)]
struct RawIdentityEvent {
    seq: i64,
    did: String,
    time: String,
}

#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
struct InfoEvent {
    name: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RelayErrorPayload {
    error: Option<String>,
    message: Option<String>,
}
