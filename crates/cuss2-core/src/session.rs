// ── Platform session ──
//
// Keeps exactly one live platform connection for the life of the
// process. Establishment (authorize, then open the socket) retries
// forever with exponential backoff; a dropped connection goes straight
// back into that loop. Callers address whichever socket is currently
// live through `call`/`send`, and consume one ordered envelope stream
// that survives reconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use cuss2_api::model::{ApplicationData, PlatformData};
use cuss2_api::socket::{PlatformSocket, SocketConfig, SocketEvent};
use cuss2_api::token::TokenClient;

use crate::config::ReconnectConfig;
use crate::error::CoreError;

const EVENT_CHANNEL_SIZE: usize = 64;
const MESSAGE_CHANNEL_SIZE: usize = 256;
const DISPATCH_CHANNEL_SIZE: usize = 256;

/// Renewal runs this far ahead of the advertised token expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(1);

/// Delay between retries when a scheduled token refresh fails.
const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(5);

// ── SessionState ─────────────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

// ── SessionEvent ─────────────────────────────────────────────────────

/// Lifecycle and out-of-band notifications from the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A connection landed. The generation counts establishments, so
    /// consumers can tell a reconnect from the frame they last saw.
    Connected { generation: u64 },

    /// The live connection went away. Re-establishment is already under
    /// way by the time this is visible.
    Closed,

    /// Platform-initiated ping (answered at the socket layer).
    Ping { timestamp: i64 },

    /// Acknowledgement of a fire-and-forget send.
    Ack { code: serde_json::Value },
}

// ── Connect seam ─────────────────────────────────────────────────────

/// Strategy for opening one platform connection.
///
/// Production uses [`PlatformConnector`]; tests substitute scripted
/// connectors to drive the reconnect loop without a network.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    /// Authorize and open a fresh connection. The token is the
    /// connection's teardown token.
    async fn establish(&self, cancel: CancellationToken) -> Result<Established, CoreError>;

    /// Renew the bearer mid-connection. Returns the new token's
    /// lifetime, or `None` when it never expires.
    async fn refresh(&self) -> Result<Option<Duration>, CoreError>;
}

/// One freshly opened connection, as handed back by [`Connect`].
pub struct Established {
    pub socket: PlatformSocket,
    pub inbound: mpsc::Receiver<PlatformData>,
    /// Advertised bearer lifetime; `None` disables scheduled refresh.
    pub token_ttl: Option<Duration>,
}

// ── PlatformConnector ────────────────────────────────────────────────

/// OAuth-then-WebSocket connector against a real platform.
///
/// Owns the bearer watch: every refresh replaces the value, and the
/// socket stamps the current bearer into outbound envelopes, so a
/// renewed token takes effect without touching the connection.
pub struct PlatformConnector {
    token: TokenClient,
    socket_url: Url,
    socket_config: SocketConfig,
    bearer: watch::Sender<SecretString>,
    device_id: watch::Receiver<Uuid>,
}

impl PlatformConnector {
    pub fn new(
        token: TokenClient,
        socket_url: Url,
        socket_config: SocketConfig,
        device_id: watch::Receiver<Uuid>,
    ) -> Self {
        let (bearer, _) = watch::channel(SecretString::from(String::new()));
        Self {
            token,
            socket_url,
            socket_config,
            bearer,
            device_id,
        }
    }
}

#[async_trait]
impl Connect for PlatformConnector {
    async fn establish(&self, cancel: CancellationToken) -> Result<Established, CoreError> {
        let token = self.token.authorize().await?;
        let token_ttl = token.ttl();
        self.bearer.send_replace(token.access_token);

        let (socket, inbound) = PlatformSocket::connect(
            &self.socket_url,
            self.bearer.subscribe(),
            self.device_id.clone(),
            self.socket_config.clone(),
            cancel,
        )
        .await?;

        Ok(Established {
            socket,
            inbound,
            token_ttl,
        })
    }

    async fn refresh(&self) -> Result<Option<Duration>, CoreError> {
        let token = self.token.authorize().await?;
        let ttl = token.ttl();
        self.bearer.send_replace(token.access_token);
        Ok(ttl)
    }
}

// ── Session ──────────────────────────────────────────────────────────

/// Self-healing connection to the platform. Cheap to clone.
///
/// Holds the token and socket exclusively; everything above talks to
/// the platform through this handle.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    connector: Arc<dyn Connect>,
    reconnect: ReconnectConfig,
    socket: ArcSwapOption<PlatformSocket>,
    state: watch::Sender<SessionState>,
    generation: watch::Sender<u64>,
    event_tx: broadcast::Sender<SessionEvent>,
    message_tx: broadcast::Sender<Arc<PlatformData>>,
    dispatch_tx: mpsc::Sender<Arc<PlatformData>>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<Arc<PlatformData>>>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session. Does not connect; call
    /// [`connect()`](Self::connect) to start the loop.
    pub fn new(connector: impl Connect, reconnect: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (generation, _) = watch::channel(0);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (message_tx, _) = broadcast::channel(MESSAGE_CHANNEL_SIZE);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_CHANNEL_SIZE);

        Self {
            inner: Arc::new(SessionInner {
                connector: Arc::new(connector),
                reconnect,
                socket: ArcSwapOption::empty(),
                state,
                generation,
                event_tx,
                message_tx,
                dispatch_tx,
                dispatch_rx: Mutex::new(Some(dispatch_rx)),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start the connection loop and wait for the first connection.
    ///
    /// Establishment failures are retried indefinitely with backoff and
    /// never surface here; the only error is a session shut down while
    /// waiting.
    pub async fn connect(&self) -> Result<(), CoreError> {
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            tokio::spawn(run(Arc::clone(&self.inner)));
        }

        let mut generation = self.inner.generation.subscribe();
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(CoreError::Disconnected),
            first = generation.wait_for(|g| *g >= 1) => {
                first.map(|_| ()).map_err(|_| CoreError::Disconnected)
            }
        }
    }

    /// Stop the session for good: tears down the live connection and
    /// ends the reconnect loop. Idempotent.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Force-close the current connection without stopping the loop.
    /// The session reconnects immediately.
    pub fn close_socket(&self) {
        if let Some(socket) = self.inner.socket.load_full() {
            socket.close();
        }
    }

    // ── Envelope exchange ────────────────────────────────────────────

    /// Correlated request against the live connection.
    pub async fn call(&self, envelope: ApplicationData) -> Result<PlatformData, CoreError> {
        let socket = self.inner.socket.load_full().ok_or(CoreError::Disconnected)?;
        Ok(socket.call(envelope).await?)
    }

    /// Fire-and-forget send on the live connection.
    pub async fn send(&self, envelope: ApplicationData) -> Result<(), CoreError> {
        let socket = self.inner.socket.load_full().ok_or(CoreError::Disconnected)?;
        Ok(socket.send(envelope).await?)
    }

    // ── Observation ──────────────────────────────────────────────────

    /// Subscribe to connection state changes.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Watch the connection generation. Starts at zero and increments
    /// on every successful establishment.
    pub fn generation(&self) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }

    /// Subscribe to lifecycle and out-of-band events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Lossy tap on the ordered envelope stream. A lagged subscriber
    /// loses the oldest envelopes, never the stream itself.
    pub fn messages(&self) -> broadcast::Receiver<Arc<PlatformData>> {
        self.inner.message_tx.subscribe()
    }

    /// Take the ordered envelope stream. Yields every inbound envelope
    /// across reconnects, in arrival order, exactly once; the stream
    /// must be drained, since the session applies backpressure when it
    /// fills. There is one: subsequent calls return `None`.
    pub async fn take_dispatch(&self) -> Option<mpsc::Receiver<Arc<PlatformData>>> {
        self.inner.dispatch_rx.lock().await.take()
    }
}

// ── Connection loop ──────────────────────────────────────────────────

/// Main loop: establish → pump until the connection dies → backoff on
/// failure → establish again. Only session shutdown ends it.
async fn run(inner: Arc<SessionInner>) {
    let mut attempt: u32 = 0;

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let state = if *inner.generation.borrow() == 0 {
            SessionState::Connecting
        } else {
            SessionState::Reconnecting { attempt }
        };
        let _ = inner.state.send(state);

        let connection_cancel = inner.cancel.child_token();
        let established = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            result = inner.connector.establish(connection_cancel.clone()) => result,
        };

        match established {
            Err(e) => {
                let delay = inner.reconnect.delay_for(attempt);
                warn!(error = %e, attempt, delay = ?delay, "Connection attempt failed");

                tokio::select! {
                    biased;
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Ok(Established {
                socket,
                inbound,
                token_ttl,
            }) => {
                attempt = 0;
                inner.socket.store(Some(Arc::new(socket.clone())));
                inner.generation.send_modify(|g| *g += 1);
                let generation = *inner.generation.borrow();
                let _ = inner.state.send(SessionState::Connected);
                let _ = inner.event_tx.send(SessionEvent::Connected { generation });
                info!(generation, "Platform session established");

                tokio::spawn(refresh_bearer(
                    Arc::clone(&inner.connector),
                    token_ttl,
                    connection_cancel.clone(),
                ));

                pump(&inner, inbound, &socket).await;

                // The connection is gone, whichever side ended it.
                connection_cancel.cancel();
                inner.socket.store(None);
                let _ = inner.event_tx.send(SessionEvent::Closed);
                if !inner.cancel.is_cancelled() {
                    info!("Platform connection lost, reconnecting");
                }
            }
        }
    }

    inner.socket.store(None);
    let _ = inner.state.send(SessionState::Disconnected);
    debug!("Session loop exiting");
}

/// Forward one connection's traffic until it dies: envelopes to the
/// dispatch stream (and the lossy tap), socket events to the session
/// event stream.
async fn pump(
    inner: &SessionInner,
    mut inbound: mpsc::Receiver<PlatformData>,
    socket: &PlatformSocket,
) {
    let mut socket_events = socket.events();

    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            envelope = inbound.recv() => {
                let Some(envelope) = envelope else { break };
                let envelope = Arc::new(envelope);
                let _ = inner.message_tx.send(Arc::clone(&envelope));
                if inner.dispatch_tx.send(envelope).await.is_err() {
                    break;
                }
            }
            event = socket_events.recv() => {
                match event {
                    Ok(SocketEvent::Ping { timestamp }) => {
                        let _ = inner.event_tx.send(SessionEvent::Ping { timestamp });
                    }
                    Ok(SocketEvent::Ack { code }) => {
                        let _ = inner.event_tx.send(SessionEvent::Ack { code });
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Socket event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Renew the bearer ahead of expiry, for the life of one connection.
///
/// A failed renewal is retried on a short interval; the platform keeps
/// honoring the old bearer until its own expiry, so a transient token
/// endpoint outage is survivable.
async fn refresh_bearer(
    connector: Arc<dyn Connect>,
    initial_ttl: Option<Duration>,
    cancel: CancellationToken,
) {
    let mut ttl = initial_ttl;

    loop {
        let Some(lifetime) = ttl else {
            debug!("Bearer never expires, refresh loop idle");
            return;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(lifetime.saturating_sub(REFRESH_MARGIN)) => {}
        }

        ttl = loop {
            match connector.refresh().await {
                Ok(next) => {
                    debug!("Bearer refreshed");
                    break next;
                }
                Err(e) => {
                    warn!(error = %e, "Bearer refresh failed, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(REFRESH_RETRY_DELAY) => {}
                    }
                }
            }
        };
    }
}
