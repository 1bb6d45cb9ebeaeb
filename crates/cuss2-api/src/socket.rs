//! Correlated envelope exchange over the platform WebSocket.
//!
//! One socket carries all traffic for a platform session. The connection
//! is split into a writer task fed by an outbound queue, a correlation
//! task that routes replies to suspended callers by `requestID`, and an
//! optional keepalive task enforcing a pong watchdog.
//!
//! The correlation core works on plain text frames, so tests can drive
//! it through [`PlatformSocket::from_parts`] with channel pairs instead
//! of a live WebSocket.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::error::{Error, PlatformResponseError};
use crate::model::{ApplicationData, PlatformData, RequestId};

// ── Channel capacities ───────────────────────────────────────────────

const OUTBOUND_CHANNEL_CAPACITY: usize = 64;
const INBOUND_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ── SocketConfig ─────────────────────────────────────────────────────

/// Tuning knobs for a single connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// How long a correlated call may wait for its reply. Default: 30s.
    pub call_timeout: Duration,

    /// Interval between application-level pings. `None` disables the
    /// keepalive loop. Default: 15s.
    pub ping_interval: Option<Duration>,

    /// Grace on top of the ping interval before an unanswered ping
    /// counts as a dead connection. Default: 2s.
    pub pong_grace: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            ping_interval: Some(Duration::from_secs(15)),
            pong_grace: Duration::from_secs(2),
        }
    }
}

// ── SocketEvent ──────────────────────────────────────────────────────

/// Out-of-band frames surfaced to observers.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Platform-initiated ping. The pong reply is already queued by the
    /// time this event is visible.
    Ping { timestamp: i64 },

    /// Acknowledgement of a fire-and-forget send.
    Ack { code: Value },
}

// ── PlatformSocket ───────────────────────────────────────────────────

/// Handle to one live platform connection. Cheap to clone.
///
/// Every teardown path (explicit close, read/write failure, watchdog
/// expiry, peer close frame) cancels the connection token; the pending
/// map is then drained so every suspended call fails with
/// [`Error::ConnectionClosed`] instead of hanging.
#[derive(Clone)]
pub struct PlatformSocket {
    out_tx: mpsc::Sender<String>,
    pending: Arc<DashMap<RequestId, oneshot::Sender<PlatformData>>>,
    event_tx: broadcast::Sender<SocketEvent>,
    bearer: watch::Receiver<SecretString>,
    device_id: watch::Receiver<Uuid>,
    config: SocketConfig,
    cancel: CancellationToken,
}

impl PlatformSocket {
    /// Open the platform WebSocket and spawn the connection tasks.
    ///
    /// The current bearer is presented as an `Authorization` header on
    /// the upgrade request. Returns the socket handle plus the ordered
    /// inbound envelope stream; the stream ends when the connection is
    /// gone.
    pub async fn connect(
        socket_url: &Url,
        bearer: watch::Receiver<SecretString>,
        device_id: watch::Receiver<Uuid>,
        config: SocketConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<PlatformData>), Error> {
        tracing::info!(url = %socket_url, "Connecting to platform WebSocket");

        let uri: tungstenite::http::Uri = socket_url.as_str().parse().map_err(
            |e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()),
        )?;

        let authorization = format!("Bearer {}", bearer.borrow().expose_secret());
        let request =
            ClientRequestBuilder::new(uri).with_header("Authorization", authorization);

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        tracing::info!("Platform WebSocket connected");

        let (sink, stream) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (frame_tx, frame_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        let (socket, inbound) =
            Self::from_parts(out_tx, frame_rx, bearer, device_id, config, cancel);

        tokio::spawn(write_frames(out_rx, sink, socket.cancel.clone()));
        tokio::spawn(read_frames(stream, frame_tx, socket.cancel.clone()));

        Ok((socket, inbound))
    }

    /// Assemble a socket from plain frame channels.
    ///
    /// `outgoing` receives every frame the socket writes; `incoming`
    /// supplies frames read from the peer, and its closure counts as
    /// connection loss. Spawns the correlation and keepalive tasks only;
    /// transport tasks are the caller's concern.
    pub fn from_parts(
        outgoing: mpsc::Sender<String>,
        incoming: mpsc::Receiver<String>,
        bearer: watch::Receiver<SecretString>,
        device_id: watch::Receiver<Uuid>,
        config: SocketConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<PlatformData>) {
        let pending: Arc<DashMap<RequestId, oneshot::Sender<PlatformData>>> =
            Arc::new(DashMap::new());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (pong_tx, pong_rx) = watch::channel(());

        let router = FrameRouter {
            out_tx: outgoing.clone(),
            pending: Arc::clone(&pending),
            inbound_tx,
            event_tx: event_tx.clone(),
            pong_tx,
        };
        tokio::spawn(correlate_frames(incoming, router, cancel.clone()));

        if let Some(interval) = config.ping_interval {
            tokio::spawn(keepalive(
                outgoing.clone(),
                pong_rx,
                interval,
                config.pong_grace,
                cancel.clone(),
            ));
        }

        let socket = Self {
            out_tx: outgoing,
            pending,
            event_tx,
            bearer,
            device_id,
            config,
            cancel,
        };
        (socket, inbound_rx)
    }

    /// Send a correlated request and wait for the platform's reply.
    ///
    /// Stamps the current bearer and device id, and assigns a fresh
    /// `requestID` when the envelope carries none. A reply whose message
    /// code is on the critical denylist fails the call with
    /// [`Error::PlatformResponse`]; any other reply resolves it,
    /// whatever its code.
    pub async fn call(&self, mut envelope: ApplicationData) -> Result<PlatformData, Error> {
        let request_id = envelope
            .meta
            .request_id
            .get_or_insert_with(RequestId::new)
            .clone();
        let directive = envelope.directive();
        self.stamp(&mut envelope);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), reply_tx);

        if let Err(e) = self.transmit(&envelope).await {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.call_timeout, reply_rx).await {
            Err(_elapsed) => {
                self.pending.remove(&request_id);
                tracing::warn!(%request_id, %directive, "Call timed out");
                Err(Error::Timeout {
                    request_id,
                    directive,
                    timeout: self.config.call_timeout,
                })
            }
            // The correlation task dropped our sender: connection gone.
            Ok(Err(_closed)) => Err(Error::ConnectionClosed),
            Ok(Ok(reply)) => {
                if reply.meta.message_code.is_critical() {
                    Err(Error::PlatformResponse(PlatformResponseError::from_reply(
                        &reply,
                    )))
                } else {
                    Ok(reply)
                }
            }
        }
    }

    /// Fire-and-forget send. The platform may answer with a bare
    /// `ackCode` frame, surfaced as [`SocketEvent::Ack`].
    pub async fn send(&self, mut envelope: ApplicationData) -> Result<(), Error> {
        self.stamp(&mut envelope);
        self.transmit(&envelope).await
    }

    /// Subscribe to out-of-band socket events.
    pub fn events(&self) -> broadcast::Receiver<SocketEvent> {
        self.event_tx.subscribe()
    }

    /// Tear the connection down. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once the connection is torn down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    fn stamp(&self, envelope: &mut ApplicationData) {
        if envelope.meta.oauth_token.is_none() {
            envelope.meta.oauth_token =
                Some(self.bearer.borrow().expose_secret().to_owned());
        }
        if envelope.meta.device_id.is_nil() {
            envelope.meta.device_id = *self.device_id.borrow();
        }
    }

    async fn transmit(&self, envelope: &ApplicationData) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }
        let text = serde_json::to_string(envelope)?;
        tracing::trace!(directive = %envelope.directive(), "Sending envelope");
        self.out_tx
            .send(text)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

// ── Frame correlation ────────────────────────────────────────────────

struct FrameRouter {
    out_tx: mpsc::Sender<String>,
    pending: Arc<DashMap<RequestId, oneshot::Sender<PlatformData>>>,
    inbound_tx: mpsc::Sender<PlatformData>,
    event_tx: broadcast::Sender<SocketEvent>,
    pong_tx: watch::Sender<()>,
}

/// Reader core: take text frames off the transport, answer pings, route
/// replies to suspended callers, and forward every envelope in arrival
/// order.
///
/// Whatever ends the frame stream ends the connection: the cancel token
/// is re-fired so the writer and keepalive tasks die with it, and the
/// pending map is drained so suspended callers fail immediately.
async fn correlate_frames(
    mut incoming: mpsc::Receiver<String>,
    router: FrameRouter,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = incoming.recv() => {
                let Some(text) = frame else {
                    tracing::info!("Platform frame stream ended");
                    break;
                };
                router.route(&text).await;
            }
        }
    }

    cancel.cancel();
    router.pending.clear();
    tracing::debug!("Socket correlation task exiting");
}

impl FrameRouter {
    /// Route one text frame.
    ///
    /// A correlated reply is forwarded to the ordered inbound stream
    /// before the suspended caller is woken, so state observed by the
    /// stream consumer is never older than a resolved call.
    async fn route(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "Discarding unparseable frame");
                return;
            }
        };

        // Bare keepalive and acknowledgement shapes carry no meta block
        // and never reach the envelope path.
        if let Some(stamp) = value.get("ping") {
            let timestamp = stamp.as_i64().unwrap_or_default();
            let pong = json!({ "pong": Utc::now().timestamp_millis() }).to_string();
            let _ = self.out_tx.send(pong).await;
            let _ = self.event_tx.send(SocketEvent::Ping { timestamp });
            return;
        }
        if value.get("pong").is_some() {
            self.pong_tx.send_replace(());
            return;
        }
        if let Some(code) = value.get("ackCode") {
            let _ = self.event_tx.send(SocketEvent::Ack { code: code.clone() });
            return;
        }

        let envelope: PlatformData = match serde_json::from_value(value) {
            Ok(pd) => pd,
            Err(e) => {
                tracing::debug!(error = %e, "Discarding undecodable envelope");
                return;
            }
        };

        let reply_to = envelope
            .meta
            .request_id
            .as_ref()
            .and_then(|id| self.pending.remove(id))
            .map(|(_, tx)| tx);

        match reply_to {
            Some(caller) => {
                let _ = self.inbound_tx.send(envelope.clone()).await;
                let _ = caller.send(envelope);
            }
            None => {
                let _ = self.inbound_tx.send(envelope).await;
            }
        }
    }
}

// ── Keepalive ────────────────────────────────────────────────────────

/// Ping loop with a pong watchdog.
///
/// Every pong pushes the watchdog deadline one interval-plus-grace out.
/// Each tick first checks that deadline; a missed deadline closes the
/// socket, otherwise a `{"ping": <epoch ms>}` frame goes out and the
/// loop waits for the next tick. The deadline starts one horizon out so
/// a quiet start is not an immediate timeout.
async fn keepalive(
    out_tx: mpsc::Sender<String>,
    mut pong_rx: watch::Receiver<()>,
    interval: Duration,
    grace: Duration,
    cancel: CancellationToken,
) {
    let horizon = interval + grace;
    let mut deadline = Instant::now() + horizon;
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            changed = pong_rx.changed() => {
                if changed.is_err() {
                    return; // correlation task gone, connection is down
                }
                deadline = Instant::now() + horizon;
                continue;
            }
            _ = ticker.tick() => {}
        }

        if Instant::now() >= deadline {
            tracing::warn!("Pong overdue, closing socket");
            cancel.cancel();
            return;
        }

        let ping = json!({ "ping": Utc::now().timestamp_millis() }).to_string();
        if out_tx.send(ping).await.is_err() {
            return;
        }
    }
}

// ── WebSocket transport tasks ────────────────────────────────────────

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Writer half: drain the outbound queue into the socket.
async fn write_frames(
    mut out_rx: mpsc::Receiver<String>,
    mut sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = out_rx.recv() => {
                let Some(text) = frame else { break };
                if let Err(e) = sink.send(tungstenite::Message::text(text)).await {
                    tracing::warn!(error = %e, "WebSocket write failed");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    cancel.cancel();
}

/// Reader half: turn socket frames into text frames for the correlation
/// task. Close frames, read errors, and stream end all mean the
/// connection is gone.
async fn read_frames(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    frame_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = stream.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if frame_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite answers protocol pings automatically
                        tracing::trace!("WebSocket ping");
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(
                                code = %cf.code,
                                reason = %cf.reason,
                                "WebSocket close frame received"
                            );
                        } else {
                            tracing::info!("WebSocket close frame received (no payload)");
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WebSocket read failed");
                        break;
                    }
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break;
                    }
                    _ => {
                        // Binary, Pong, Frame -- ignore
                    }
                }
            }
        }
    }

    cancel.cancel();
}

// ── Tests ────────────────────────────────────────────────────────────
