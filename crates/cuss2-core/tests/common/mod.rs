// Shared scripted-platform harness for the integration tests.
//
// Stands in for a CUSS2 platform on the far side of the socket: the
// connector wires a `PlatformSocket` over in-memory channels and a
// responder task answers every application envelope out of a small
// amount of mutable platform state. Tests drive the platform side
// (component health, state grants, unsolicited envelopes) and assert
// on the frames the client wrote.

#![allow(dead_code)] // each test binary compiles its own copy

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use cuss2_api::model::{ApplicationData, Directive, RequestId};
use cuss2_api::socket::PlatformSocket;
use cuss2_core::{
    ApplicationState, ClientConfig, ClientEvent, ComponentState, Connect, CoreError, Established,
    MessageCode, PlatformClient, SocketConfig, StandardClassifier,
};

/// Device id the scripted platform reports in its environment.
pub const PLATFORM_DEVICE: &str = "91b94e55-7a0e-4e2a-9b7a-4f5d1f4b9f83";

/// Upper bound on any virtual-time wait. Paused-clock tests advance
/// through this instantly, so it only trips when an expectation is
/// genuinely unreachable.
pub const WAIT_BUDGET: Duration = Duration::from_secs(120);

// ── Platform state ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Health {
    state: ComponentState,
    code: MessageCode,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            state: ComponentState::Ready,
            code: MessageCode::Ok,
        }
    }
}

struct Parked {
    envelope: ApplicationData,
    reply_to: mpsc::Sender<String>,
}

struct PlatformInner {
    /// Application state the platform reports in every envelope.
    state: Mutex<ApplicationState>,
    environment: Value,
    component_list: Value,
    /// Per-component readiness and status backing directed replies.
    health: Mutex<HashMap<u16, Health>>,
    /// Directives answered with this code instead of their normal one.
    reply_codes: Mutex<HashMap<Directive, MessageCode>>,
    /// Directives whose frames are parked until released.
    held: Mutex<HashSet<Directive>>,
    parked: Mutex<Vec<Parked>>,
    /// When set, state requests are acknowledged without transitioning.
    defer_state_grants: AtomicBool,
    /// When set, replies omit `currentApplicationState` entirely.
    omit_states: AtomicBool,
    /// Every envelope the client has written, in arrival order.
    log: Mutex<Vec<ApplicationData>>,
    /// Sender into the live connection, for platform-initiated frames.
    to_client: Mutex<Option<mpsc::Sender<String>>>,
    conn_cancel: Mutex<Option<CancellationToken>>,
    /// Establishment instants, for backoff assertions.
    attempts: Mutex<Vec<Instant>>,
    /// Establishments to fail before connections start succeeding.
    fail_remaining: AtomicU32,
}

impl PlatformInner {
    fn current(&self) -> ApplicationState {
        *self.state.lock().unwrap()
    }

    fn health_of(&self, id: u16) -> Health {
        self.health
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    fn reported_state(&self, state: ApplicationState) -> Option<ApplicationState> {
        if self.omit_states.load(Ordering::SeqCst) {
            None
        } else {
            Some(state)
        }
    }

    /// Build the platform's answer to one application envelope.
    fn reply_for(&self, request: &ApplicationData) -> Value {
        let request_id = request.meta.request_id.clone();
        let directive = request.meta.directive;
        let rigged = self.reply_codes.lock().unwrap().get(&directive).copied();

        match directive {
            Directive::PlatformEnvironment => render(Reply {
                request_id,
                component: None,
                code: rigged.unwrap_or(MessageCode::Ok),
                directive: Some(directive),
                state: self.reported_state(self.current()),
                payload: json!({ "environmentLevel": self.environment }),
            }),
            Directive::PlatformComponents => render(Reply {
                request_id,
                component: None,
                code: rigged.unwrap_or(MessageCode::Ok),
                directive: Some(directive),
                state: self.reported_state(self.current()),
                payload: json!({ "componentList": self.component_list }),
            }),
            Directive::PlatformApplicationsStaterequest => {
                let target = request
                    .payload
                    .application_state
                    .as_ref()
                    .and_then(|block| block.application_state_code);
                let reported = match (rigged, target) {
                    (Some(_), _) | (None, None) => self.current(),
                    (None, Some(ApplicationState::Reload)) => {
                        // A granted reload restarts the application; the
                        // next connection finds the platform back at
                        // INITIALIZE while the grant itself echoes RELOAD.
                        *self.state.lock().unwrap() = ApplicationState::Initialize;
                        ApplicationState::Reload
                    }
                    (None, Some(next)) => {
                        if !self.defer_state_grants.load(Ordering::SeqCst) {
                            *self.state.lock().unwrap() = next;
                        }
                        self.current()
                    }
                };
                render(Reply {
                    request_id,
                    component: None,
                    code: rigged.unwrap_or(MessageCode::Ok),
                    directive: Some(directive),
                    state: self.reported_state(reported),
                    payload: json!({}),
                })
            }
            _ => {
                let component = request
                    .meta
                    .component_id
                    .map(|id| (id.value(), self.health_of(id.value())));
                render(Reply {
                    request_id,
                    component: component.map(|(id, health)| (id, health.state)),
                    code: rigged
                        .unwrap_or_else(|| component.map(|(_, h)| h.code).unwrap_or(MessageCode::Ok)),
                    directive: Some(directive),
                    state: self.reported_state(self.current()),
                    payload: json!({}),
                })
            }
        }
    }
}

struct Reply {
    request_id: Option<RequestId>,
    component: Option<(u16, ComponentState)>,
    code: MessageCode,
    directive: Option<Directive>,
    state: Option<ApplicationState>,
    payload: Value,
}

fn render(reply: Reply) -> Value {
    let mut meta = json!({ "messageCode": reply.code });
    let fields = meta.as_object_mut().unwrap();
    if let Some(state) = reply.state {
        fields.insert(
            "currentApplicationState".into(),
            json!({ "applicationStateCode": state }),
        );
    }
    if let Some(id) = reply.request_id {
        fields.insert("requestID".into(), json!(id));
    }
    if let Some((id, state)) = reply.component {
        fields.insert("componentID".into(), json!(id));
        fields.insert("componentState".into(), json!(state));
    }
    if let Some(directive) = reply.directive {
        fields.insert("platformDirective".into(), json!(directive));
    }
    json!({ "meta": meta, "payload": reply.payload })
}

// ── Responder ────────────────────────────────────────────────────────

async fn respond(
    platform: Arc<PlatformInner>,
    mut from_client: mpsc::Receiver<String>,
    to_client: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = from_client.recv() => frame,
        };
        let Some(text) = frame else { break };

        let value: Value = serde_json::from_str(&text).expect("client frames are JSON");
        if value.get("ping").is_some() || value.get("pong").is_some() {
            continue;
        }
        let envelope: ApplicationData =
            serde_json::from_value(value).expect("client frames decode as envelopes");

        platform.log.lock().unwrap().push(envelope.clone());

        if platform.held.lock().unwrap().contains(&envelope.meta.directive) {
            platform.parked.lock().unwrap().push(Parked {
                envelope,
                reply_to: to_client.clone(),
            });
            continue;
        }

        let reply = platform.reply_for(&envelope);
        if to_client.send(reply.to_string()).await.is_err() {
            break;
        }
    }
}

// ── Connector ────────────────────────────────────────────────────────

pub struct ScriptedConnector {
    inner: Arc<PlatformInner>,
}

#[async_trait]
impl Connect for ScriptedConnector {
    async fn establish(&self, cancel: CancellationToken) -> Result<Established, CoreError> {
        self.inner.attempts.lock().unwrap().push(Instant::now());

        let remaining = self.inner.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(CoreError::Disconnected);
        }

        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let (_, bearer_rx) = watch::channel(SecretString::from("scripted-token".to_string()));
        let (_, device_rx) = watch::channel(Uuid::nil());

        // Keepalive stays off so paused-clock auto-advance cannot run a
        // pong watchdog out from under an idle test.
        let config = SocketConfig {
            call_timeout: Duration::from_secs(30),
            ping_interval: None,
            pong_grace: Duration::from_secs(5),
        };
        let (socket, inbound) =
            PlatformSocket::from_parts(out_tx, in_rx, bearer_rx, device_rx, config, cancel.clone());

        *self.inner.to_client.lock().unwrap() = Some(in_tx.clone());
        *self.inner.conn_cancel.lock().unwrap() = Some(cancel.clone());
        tokio::spawn(respond(Arc::clone(&self.inner), out_rx, in_tx, cancel));

        Ok(Established {
            socket,
            inbound,
            token_ttl: None,
        })
    }

    async fn refresh(&self) -> Result<Option<Duration>, CoreError> {
        Ok(None)
    }
}

// ── Test-facing handle ───────────────────────────────────────────────

pub struct ScriptedPlatform {
    inner: Arc<PlatformInner>,
}

impl ScriptedPlatform {
    pub fn new(component_list: Value) -> Self {
        Self {
            inner: Arc::new(PlatformInner {
                state: Mutex::new(ApplicationState::Initialize),
                environment: json!({
                    "deviceID": PLATFORM_DEVICE,
                    "sessionTimeout": 300,
                    "killTimeout": 10,
                }),
                component_list,
                health: Mutex::new(HashMap::new()),
                reply_codes: Mutex::new(HashMap::new()),
                held: Mutex::new(HashSet::new()),
                parked: Mutex::new(Vec::new()),
                defer_state_grants: AtomicBool::new(false),
                omit_states: AtomicBool::new(false),
                log: Mutex::new(Vec::new()),
                to_client: Mutex::new(None),
                conn_cancel: Mutex::new(None),
                attempts: Mutex::new(Vec::new()),
                fail_remaining: AtomicU32::new(0),
            }),
        }
    }

    pub fn connector(&self) -> ScriptedConnector {
        ScriptedConnector {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn client(&self, config: &ClientConfig) -> PlatformClient {
        PlatformClient::from_connector(self.connector(), config, Arc::new(StandardClassifier))
    }

    // ── Scripting ────────────────────────────────────────────────────

    pub fn state(&self) -> ApplicationState {
        self.inner.current()
    }

    pub fn set_state(&self, state: ApplicationState) {
        *self.inner.state.lock().unwrap() = state;
    }

    pub fn set_health(&self, id: u16, state: ComponentState, code: MessageCode) {
        self.inner
            .health
            .lock()
            .unwrap()
            .insert(id, Health { state, code });
    }

    /// Answer `directive` with `code` instead of its normal reply code.
    pub fn rig_reply(&self, directive: Directive, code: MessageCode) {
        self.inner.reply_codes.lock().unwrap().insert(directive, code);
    }

    pub fn clear_rigged_reply(&self, directive: Directive) {
        self.inner.reply_codes.lock().unwrap().remove(&directive);
    }

    /// Acknowledge state requests without transitioning, so the client
    /// can be parked in a state the platform has not yet moved it out of.
    pub fn defer_state_grants(&self, defer: bool) {
        self.inner.defer_state_grants.store(defer, Ordering::SeqCst);
    }

    /// Strip `currentApplicationState` from every reply.
    pub fn omit_states(&self, omit: bool) {
        self.inner.omit_states.store(omit, Ordering::SeqCst);
    }

    /// Park frames carrying `directive` instead of answering them.
    pub fn hold(&self, directive: Directive) {
        self.inner.held.lock().unwrap().insert(directive);
    }

    /// Stop parking `directive` and answer everything parked so far.
    pub async fn release(&self, directive: Directive) {
        self.inner.held.lock().unwrap().remove(&directive);
        let ready: Vec<Parked> = {
            let mut parked = self.inner.parked.lock().unwrap();
            let mut ready = Vec::new();
            let mut keep = Vec::new();
            for entry in parked.drain(..) {
                if entry.envelope.meta.directive == directive {
                    ready.push(entry);
                } else {
                    keep.push(entry);
                }
            }
            *parked = keep;
            ready
        };
        for entry in ready {
            let reply = self.inner.reply_for(&entry.envelope);
            entry
                .reply_to
                .send(reply.to_string())
                .await
                .expect("released reply delivered");
        }
    }

    /// Fail the next `count` establishment attempts.
    pub fn fail_establishments(&self, count: u32) {
        self.inner.fail_remaining.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.inner.attempts.lock().unwrap().clone()
    }

    /// Tear down the live connection from the platform side.
    pub fn drop_connection(&self) {
        self.inner.to_client.lock().unwrap().take();
        if let Some(cancel) = self.inner.conn_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
    }

    // ── Unsolicited traffic ──────────────────────────────────────────

    /// Send an unsolicited component report from the health map.
    pub async fn report(&self, id: u16) {
        let health = self.inner.health_of(id);
        let frame = render(Reply {
            request_id: None,
            component: Some((id, health.state)),
            code: health.code,
            directive: None,
            state: Some(self.state()),
            payload: json!({}),
        });
        self.inject_raw(frame).await;
    }

    /// Send an unsolicited DATAPRESENT carrying `records`.
    pub async fn data_present(&self, id: u16, records: Value) {
        let frame = render(Reply {
            request_id: None,
            component: Some((id, ComponentState::Ready)),
            code: MessageCode::DataPresent,
            directive: None,
            state: Some(self.state()),
            payload: json!({ "dataRecords": records }),
        });
        self.inject_raw(frame).await;
    }

    /// Move the platform to `state` and announce it unsolicited.
    pub async fn announce_state(&self, state: ApplicationState) {
        self.set_state(state);
        let frame = render(Reply {
            request_id: None,
            component: None,
            code: MessageCode::Ok,
            directive: None,
            state: Some(state),
            payload: json!({}),
        });
        self.inject_raw(frame).await;
    }

    /// Activate the application unsolicited, as a platform-driven
    /// launch would, carrying `activation` parameters.
    pub async fn announce_active(&self, activation: Value) {
        self.set_state(ApplicationState::Active);
        let frame = render(Reply {
            request_id: None,
            component: None,
            code: MessageCode::Ok,
            directive: None,
            state: Some(ApplicationState::Active),
            payload: json!({ "applicationActivation": activation }),
        });
        self.inject_raw(frame).await;
    }

    /// Send an arbitrary frame to the client.
    pub async fn inject_raw(&self, frame: Value) {
        let sender = self
            .inner
            .to_client
            .lock()
            .unwrap()
            .clone()
            .expect("no live platform connection");
        sender
            .send(frame.to_string())
            .await
            .expect("platform connection closed");
    }

    // ── Frame assertions ─────────────────────────────────────────────

    pub fn frames(&self) -> Vec<ApplicationData> {
        self.inner.log.lock().unwrap().clone()
    }

    pub fn count(&self, directive: Directive) -> usize {
        self.frames()
            .iter()
            .filter(|frame| frame.meta.directive == directive)
            .count()
    }

    /// Frames carrying `directive` addressed to component `id`.
    pub fn component_calls(&self, directive: Directive, id: u16) -> usize {
        self.frames()
            .iter()
            .filter(|frame| {
                frame.meta.directive == directive
                    && frame.meta.component_id.map(|c| c.value()) == Some(id)
            })
            .count()
    }

    /// Targets of every state request written so far, in order.
    pub fn state_requests(&self) -> Vec<ApplicationState> {
        self.frames()
            .iter()
            .filter(|frame| frame.meta.directive == Directive::PlatformApplicationsStaterequest)
            .filter_map(|frame| {
                frame
                    .payload
                    .application_state
                    .as_ref()
                    .and_then(|block| block.application_state_code)
            })
            .collect()
    }

    pub async fn wait_for_count(&self, directive: Directive, count: usize) {
        self.wait_until(move |frames| {
            frames
                .iter()
                .filter(|frame| frame.meta.directive == directive)
                .count()
                >= count
        })
        .await;
    }

    pub async fn wait_for_component_calls(&self, directive: Directive, id: u16, count: usize) {
        self.wait_until(move |frames| {
            frames
                .iter()
                .filter(|frame| {
                    frame.meta.directive == directive
                        && frame.meta.component_id.map(|c| c.value()) == Some(id)
                })
                .count()
                >= count
        })
        .await;
    }

    /// Wait until the frame log satisfies `predicate`. Polls on the
    /// virtual clock, so an unreachable expectation fails fast through
    /// the budget instead of hanging.
    pub async fn wait_until(&self, predicate: impl Fn(&[ApplicationData]) -> bool) {
        let wait = async {
            loop {
                if predicate(&self.inner.log.lock().unwrap()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(WAIT_BUDGET, wait)
            .await
            .expect("expected frames never arrived");
    }
}

// ── Client helpers ───────────────────────────────────────────────────

pub fn test_config() -> ClientConfig {
    ClientConfig::new(
        Url::parse("https://kiosk.example.test").unwrap(),
        "self-service-app",
        SecretString::from("s3cret".to_string()),
    )
}

/// Connect a client against a fresh scripted platform and wait for the
/// handshake to land in UNAVAILABLE with every component track primed.
pub async fn connect_client(component_list: Value) -> (ScriptedPlatform, PlatformClient) {
    let component_count = component_list.as_array().map_or(0, |list| list.len());
    let platform = ScriptedPlatform::new(component_list);
    let client = platform.client(&test_config());
    client.connect().await.expect("handshake succeeds");
    wait_for_state(&client, ApplicationState::Unavailable).await;
    // Two priming sweeps run after the handshake, one from initialize
    // and one from entering UNAVAILABLE; let both land so tests start
    // from settled tracks.
    platform
        .wait_for_count(Directive::PeripheralsQuery, component_count * 2)
        .await;
    settle().await;
    (platform, client)
}

pub async fn wait_for_state(client: &PlatformClient, target: ApplicationState) {
    let mut states = client.state_changes();
    tokio::time::timeout(WAIT_BUDGET, states.wait_for(|change| change.current == target))
        .await
        .unwrap_or_else(|_| panic!("client never reached {target}"))
        .expect("state watch closed");
}

pub async fn wait_for_generation(client: &PlatformClient, minimum: u64) {
    let mut generation = client.session().generation();
    tokio::time::timeout(WAIT_BUDGET, generation.wait_for(|g| *g >= minimum))
        .await
        .unwrap_or_else(|_| panic!("session never reached generation {minimum}"))
        .expect("generation watch closed");
}

/// Everything currently buffered on an event subscription.
pub fn drain_events(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// Let in-flight dispatch settle without crossing any poll interval.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

// ── Component-list fixtures ──────────────────────────────────────────

pub fn bag_tag_printer(id: u16, feeder_id: u16, dispenser_id: u16) -> Value {
    json!({
        "componentID": id,
        "componentType": "MEDIA_OUTPUT",
        "componentDescription": "bag tag printer",
        "componentCharacteristics": [{
            "deviceTypesList": ["PRINT"],
            "mediaTypesList": ["BAGGAGETAG"],
            "dsTypesList": ["DS_TYPES_ITPS"],
        }],
        "linkedComponentIDs": [feeder_id, dispenser_id],
    })
}

pub fn feeder(id: u16) -> Value {
    json!({
        "componentID": id,
        "componentType": "FEEDER",
        "componentDescription": "bag tag feeder",
        "componentCharacteristics": [],
    })
}

pub fn dispenser(id: u16) -> Value {
    json!({
        "componentID": id,
        "componentType": "DISPENSER",
        "componentDescription": "bag tag dispenser",
        "componentCharacteristics": [],
    })
}

pub fn barcode_reader(id: u16) -> Value {
    json!({
        "componentID": id,
        "componentType": "DATA_INPUT",
        "componentDescription": "barcode scanner",
        "componentCharacteristics": [{
            "dsTypesList": ["DS_TYPES_BARCODE"],
            "mediaTypesList": [],
            "deviceTypesList": [],
        }],
    })
}

pub fn card_reader(id: u16) -> Value {
    json!({
        "componentID": id,
        "componentType": "MEDIA_INPUT",
        "componentDescription": "magstripe reader",
        "componentCharacteristics": [{
            "dsTypesList": ["DS_TYPES_PAYMENT_ISO", "DS_TYPES_FOID_ISO"],
            "mediaTypesList": ["MAGCARD"],
            "deviceTypesList": [],
        }],
    })
}

pub fn announcement(id: u16) -> Value {
    json!({
        "componentID": id,
        "componentType": "ANNOUNCEMENT",
        "componentDescription": "text to speech",
        "componentCharacteristics": [],
    })
}

/// Full kiosk: printer triple, barcode reader, card reader, TTS.
pub fn full_kiosk() -> Value {
    json!([
        bag_tag_printer(2, 3, 4),
        feeder(3),
        dispenser(4),
        barcode_reader(5),
        card_reader(6),
        announcement(8),
    ])
}

/// Minimal kiosk: a single barcode reader.
pub fn reader_kiosk() -> Value {
    json!([barcode_reader(5)])
}
