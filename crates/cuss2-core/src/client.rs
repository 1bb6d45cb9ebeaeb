//! The platform client.
//!
//! [`PlatformClient`] owns the session, the component arena, and the
//! application-state machine. A single task, the event loop, drains the
//! session's ordered envelope stream and is the only writer of the
//! confirmed state and the component tracks. Every reaction the loop
//! triggers (queries, state requests, enables) is spawned, never
//! awaited inline, so one slow platform answer cannot stall the stream
//! that would deliver the next one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use cuss2_api::model::{
    ApplicationData, ApplicationState, ApplicationStateBlock, ComponentId, Directive,
    EnvironmentLevel, MessageCode, PlatformData, StateChangeReason,
};
use cuss2_api::token::TokenClient;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classify::{DeviceClassifier, DeviceRole, StandardClassifier};
use crate::component::{
    Announcement, CardReader, Component, ComponentArena, DataReader, Printer, StateView,
    MEDIA_POLL_INTERVAL,
};
use crate::config::ClientConfig;
use crate::error::CoreError;
use crate::events::ClientEvent;
use crate::session::{Connect, PlatformConnector, Session, SessionEvent};
use crate::state::{Activation, StateChange};
use crate::stream::StateStream;

const EVENT_CHANNEL_SIZE: usize = 64;

// ── PlatformClient ───────────────────────────────────────────────────

/// Handle to a CUSS2 platform. Cheap to clone; all clones share the
/// session, the arena, and the state machine.
#[derive(Clone)]
pub struct PlatformClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    session: Session,
    classifier: Arc<dyn DeviceClassifier>,
    poll_interval: Duration,
    call_timeout: Duration,

    /// Confirmed application state. Advanced by the event loop only,
    /// and only on a platform envelope that reports the new state.
    state_tx: watch::Sender<StateChange>,

    /// At most one state request may be in flight. The slot holds the
    /// requested target until the reply (or failure) clears it.
    pending: Mutex<Option<ApplicationState>>,

    /// Whether the application considers itself fit for passengers.
    /// Gates the availability side of the recovery loop.
    online: AtomicBool,

    environment: ArcSwapOption<EnvironmentLevel>,
    activation: ArcSwapOption<Activation>,
    arena: ArcSwapOption<ComponentArena>,

    /// Device id stamped into outbound envelopes. Hydrated from the
    /// platform environment when the configured id is nil.
    device_id: watch::Sender<Uuid>,

    event_tx: broadcast::Sender<ClientEvent>,

    /// Connection generation the last successful initialization ran
    /// against. The event loop re-initializes when the session lands a
    /// newer one.
    initialized_generation: AtomicU64,
    init_lock: AsyncMutex<()>,

    started: AtomicBool,
    cancel: CancellationToken,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl PlatformClient {
    /// Client for the platform named by `config`, with the standard
    /// capability classifier.
    pub fn new(config: ClientConfig) -> Result<Self, CoreError> {
        Self::with_classifier(config, Arc::new(StandardClassifier))
    }

    /// Client with a custom device classifier.
    pub fn with_classifier(
        config: ClientConfig,
        classifier: Arc<dyn DeviceClassifier>,
    ) -> Result<Self, CoreError> {
        let (device_tx, device_rx) = watch::channel(config.device_id);
        let token = TokenClient::new(
            config.token_endpoint(),
            config.client_id.clone(),
            config.client_secret.clone(),
        )?;
        let connector = PlatformConnector::new(
            token,
            config.socket_endpoint()?,
            config.socket.clone(),
            device_rx,
        );
        let session = Session::new(connector, config.reconnect.clone());
        Ok(Self::assemble(session, &config, classifier, device_tx))
    }

    /// Client over an arbitrary connector. This is how tests hand the
    /// client a scripted platform.
    pub fn from_connector(
        connector: impl Connect,
        config: &ClientConfig,
        classifier: Arc<dyn DeviceClassifier>,
    ) -> Self {
        let (device_tx, _) = watch::channel(config.device_id);
        let session = Session::new(connector, config.reconnect.clone());
        Self::assemble(session, config, classifier, device_tx)
    }

    fn assemble(
        session: Session,
        config: &ClientConfig,
        classifier: Arc<dyn DeviceClassifier>,
        device_tx: watch::Sender<Uuid>,
    ) -> Self {
        let (state_tx, _) = watch::channel(StateChange::initial());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(ClientInner {
                session,
                classifier,
                poll_interval: config.poll_interval,
                call_timeout: config.socket.call_timeout,
                state_tx,
                pending: Mutex::new(None),
                // Offline until the application declares itself fit;
                // nothing auto-requests AVAILABLE before that.
                online: AtomicBool::new(false),
                environment: ArcSwapOption::empty(),
                activation: ArcSwapOption::empty(),
                arena: ArcSwapOption::empty(),
                device_id: device_tx,
                event_tx,
                initialized_generation: AtomicU64::new(0),
                init_lock: AsyncMutex::new(()),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tasks: AsyncMutex::new(Vec::new()),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Connect and run the CUSS2 initialization handshake: environment,
    /// component discovery, and a state request into UNAVAILABLE.
    ///
    /// On success the client is tracking platform state and components.
    /// On a handshake error the session keeps reconnecting underneath;
    /// call [`disconnect`](Self::disconnect) to stop it.
    pub async fn connect(&self) -> Result<(), CoreError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(CoreError::InvalidArgument {
                message: "client is already connected".into(),
            });
        }

        self.inner.session.connect().await?;

        let dispatch = self
            .inner
            .session
            .take_dispatch()
            .await
            .ok_or(CoreError::Disconnected)?;
        let session_events = self.inner.session.events();

        let handle = tokio::spawn(event_loop(
            Arc::clone(&self.inner),
            dispatch,
            session_events,
        ));
        self.inner.tasks.lock().await.push(handle);

        self.inner.initialize().await
    }

    /// Stop the event loop and tear the session down.
    pub async fn disconnect(&self) {
        info!("Disconnecting platform client");
        self.inner.cancel.cancel();
        self.inner.session.shutdown();
        let mut tasks = self.inner.tasks.lock().await;
        for handle in tasks.drain(..) {
            let _ = handle.await;
        }
    }

    // ── State requests ───────────────────────────────────────────────

    /// Request AVAILABLE. From INITIALIZE this first requests
    /// UNAVAILABLE and waits for the platform to confirm it, since the
    /// platform only grants availability to an unavailable application.
    ///
    /// `Ok(None)` means the request was not sent: either the transition
    /// is invalid from the current state or another request is already
    /// in flight.
    pub async fn request_available(&self) -> Result<Option<PlatformData>, CoreError> {
        if self.current_state() == ApplicationState::Initialize {
            if self
                .inner
                .state_request(ApplicationState::Unavailable)
                .await?
                .is_some()
            {
                self.inner
                    .await_confirmed(ApplicationState::Unavailable)
                    .await?;
            }
        }
        self.inner.state_request(ApplicationState::Available).await
    }

    /// Request UNAVAILABLE. Leaving ACTIVE, any enabled components are
    /// disabled on the wire first.
    pub async fn request_unavailable(&self) -> Result<Option<PlatformData>, CoreError> {
        self.inner
            .state_request(ApplicationState::Unavailable)
            .await
    }

    /// Request ACTIVE. Valid from AVAILABLE, and from ACTIVE for an
    /// in-place renewal of the passenger session.
    pub async fn request_active(&self) -> Result<Option<PlatformData>, CoreError> {
        self.inner.state_request(ApplicationState::Active).await
    }

    /// Request STOPPED. Always a valid request.
    pub async fn request_stopped(&self) -> Result<Option<PlatformData>, CoreError> {
        self.inner.state_request(ApplicationState::Stopped).await
    }

    /// Ask the platform to kill and restart the application. Returns
    /// whether the request was sent and acknowledged; on `true` the
    /// socket is closed so the restart begins from a clean connection.
    pub async fn request_reload(&self) -> Result<bool, CoreError> {
        match self.inner.state_request(ApplicationState::Reload).await? {
            None => Ok(false),
            Some(_reply) => {
                info!("Reload accepted, recycling the platform connection");
                self.inner.session.close_socket();
                Ok(true)
            }
        }
    }

    /// The target of the state request currently in flight, if any.
    pub fn pending_state_change(&self) -> Option<ApplicationState> {
        self.inner.pending_state()
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn current_state(&self) -> ApplicationState {
        self.inner.current_state()
    }

    /// Watch confirmed state transitions.
    pub fn state_changes(&self) -> watch::Receiver<StateChange> {
        self.inner.state_tx.subscribe()
    }

    /// Confirmed state transitions as a [`futures_core::Stream`].
    pub fn state_stream(&self) -> StateStream {
        StateStream::new(self.inner.state_tx.subscribe())
    }

    /// Subscribe to client events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.event_tx.subscribe()
    }

    /// The environment the platform reported during initialization.
    pub fn environment(&self) -> Option<Arc<EnvironmentLevel>> {
        self.inner.environment.load_full()
    }

    /// Parameters of the current passenger session. `Some` only while
    /// the application is ACTIVE.
    pub fn activation(&self) -> Option<Activation> {
        self.inner.activation.load_full().map(|a| (*a).clone())
    }

    /// The device id stamped into outbound envelopes.
    pub fn device_id(&self) -> Uuid {
        *self.inner.device_id.borrow()
    }

    /// Whether the application considers itself fit for passengers.
    pub fn online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Declare the application fit (or unfit) for passengers and let
    /// the recovery loop move the platform state to match.
    pub fn set_online(&self, online: bool) {
        self.inner.set_online(online);
    }

    /// The underlying session, for raw envelope exchange and
    /// connection-state observation.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    // ── Components ───────────────────────────────────────────────────

    /// Look up a component by id.
    pub fn component(&self, id: ComponentId) -> Result<Arc<Component>, CoreError> {
        self.inner
            .arena
            .load_full()
            .and_then(|arena| arena.get(id))
            .ok_or(CoreError::ComponentNotFound { id })
    }

    /// Every discovered component.
    pub fn components(&self) -> Vec<Arc<Component>> {
        match self.inner.arena.load_full() {
            Some(arena) => arena.iter().map(Arc::clone).collect(),
            None => Vec::new(),
        }
    }

    /// The first component classified under `role`.
    pub fn find_component(&self, role: DeviceRole) -> Option<Arc<Component>> {
        self.inner.arena.load_full()?.first_of(role)
    }

    pub fn bag_tag_printer(&self) -> Option<Printer> {
        self.inner
            .arena
            .load_full()?
            .printer(DeviceRole::BagTagPrinter)
    }

    pub fn boarding_pass_printer(&self) -> Option<Printer> {
        self.inner
            .arena
            .load_full()?
            .printer(DeviceRole::BoardingPassPrinter)
    }

    pub fn barcode_reader(&self) -> Option<DataReader> {
        self.reader(DeviceRole::BarcodeReader)
    }

    pub fn document_reader(&self) -> Option<DataReader> {
        self.reader(DeviceRole::DocumentReader)
    }

    pub fn face_reader(&self) -> Option<DataReader> {
        self.reader(DeviceRole::FaceReader)
    }

    pub fn keypad(&self) -> Option<DataReader> {
        self.reader(DeviceRole::Keypad)
    }

    pub fn scale(&self) -> Option<DataReader> {
        self.reader(DeviceRole::Scale)
    }

    pub fn camera(&self) -> Option<DataReader> {
        self.reader(DeviceRole::Camera)
    }

    pub fn headset(&self) -> Option<DataReader> {
        self.reader(DeviceRole::Headset)
    }

    pub fn card_reader(&self) -> Option<CardReader> {
        self.inner.arena.load_full()?.card_reader()
    }

    pub fn illumination(&self) -> Option<Arc<Component>> {
        self.find_component(DeviceRole::Illumination)
    }

    pub fn announcement(&self) -> Option<Announcement> {
        self.inner.arena.load_full()?.announcement()
    }

    fn reader(&self, role: DeviceRole) -> Option<DataReader> {
        self.inner.arena.load_full()?.reader(role)
    }
}

impl std::fmt::Debug for PlatformClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformClient")
            .field("state", &self.current_state())
            .field("online", &self.online())
            .field("pending", &self.pending_state_change())
            .finish_non_exhaustive()
    }
}

// ── Initialization ───────────────────────────────────────────────────

impl ClientInner {
    /// The CUSS2 handshake: environment, component discovery, a query
    /// sweep to prime the tracks, then a state request into UNAVAILABLE
    /// when the platform still has us in INITIALIZE.
    ///
    /// Runs at most once per connection generation; the lock keeps a
    /// reconnect-triggered run from overlapping a caller-triggered one.
    async fn initialize(self: &Arc<Self>) -> Result<(), CoreError> {
        let _guard = self.init_lock.lock().await;
        let generation = *self.session.generation().borrow();
        if self.initialized_generation.load(Ordering::SeqCst) >= generation {
            return Ok(());
        }

        info!(generation, "Initializing against the platform");

        let reply = self
            .session
            .call(ApplicationData::new(Directive::PlatformEnvironment))
            .await?;

        if let Some(level) = reply.payload.environment_level.clone() {
            if self.device_id.borrow().is_nil() {
                if let Some(id) = level.device_id {
                    info!(device_id = %id, "Adopting platform-reported device id");
                    self.device_id.send_replace(id);
                }
            }
            self.environment.store(Some(Arc::new(level)));
        }

        // The watch may not have seen this envelope yet; the reply's
        // own state report is the authoritative one here.
        let reported = match reply.state_code() {
            None | Some(ApplicationState::Suspended) => {
                let state = reply.state_code();
                error!(?state, "Platform is in an abnormal state, cannot initialize");
                return Err(CoreError::AbnormalState { state });
            }
            Some(state) => state,
        };

        let reply = self
            .session
            .call(ApplicationData::new(Directive::PlatformComponents))
            .await?;
        let list = reply.payload.component_list.clone().unwrap_or_default();

        match self.arena.load_full() {
            None => {
                let arena = ComponentArena::build(
                    &list,
                    self.classifier.as_ref(),
                    &self.session,
                    self.poll_interval,
                    &self.cancel,
                )?;
                info!(components = arena.len(), "Component arena built");
                self.arena.store(Some(Arc::new(arena)));
            }
            Some(existing) => {
                if existing.matches_list(&list) {
                    debug!("Component list unchanged across reconnect");
                } else {
                    // Components are handed out as long-lived handles,
                    // so the original arena stays authoritative.
                    warn!(
                        known = ?existing.ids(),
                        reported = list.len(),
                        "Component list changed across reconnect, keeping the original arena"
                    );
                }
            }
        }

        // Judged against the reported state, so a platform that kept us
        // past INITIALIZE (or already has us UNAVAILABLE) vetoes this
        // through the ordinary validity rules.
        self.state_request_from(reported, ApplicationState::Unavailable)
            .await?;

        // Prime the tracks off the handshake path; answers flow back
        // through the envelope stream.
        let sweep = Arc::clone(self);
        tokio::spawn(async move { sweep.query_components().await });

        self.initialized_generation
            .store(generation, Ordering::SeqCst);
        Ok(())
    }

    /// Query every component, tolerating individual failures. Replies
    /// flow back through the envelope stream and update the tracks.
    async fn query_components(&self) {
        let Some(arena) = self.arena.load_full() else {
            return;
        };
        let queries = arena.iter().map(|component| {
            let component = Arc::clone(component);
            async move {
                if let Err(e) = component.query().await {
                    debug!(component = %component.id(), error = %e, "Component query failed");
                }
            }
        });
        futures_util::future::join_all(queries).await;
    }

    // ── State machine ────────────────────────────────────────────────

    fn current_state(&self) -> ApplicationState {
        self.state_tx.borrow().current
    }

    fn pending_state(&self) -> Option<ApplicationState> {
        *self.pending_slot()
    }

    fn pending_slot(&self) -> MutexGuard<'_, Option<ApplicationState>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the pending slot for `target` if the transition is valid
    /// and nothing else is in flight.
    fn try_reserve(&self, current: ApplicationState, target: ApplicationState) -> bool {
        if !allows_transition(current, target) {
            debug!(?current, ?target, "State request not valid from here, skipping");
            return false;
        }
        let mut slot = self.pending_slot();
        if let Some(pending) = *slot {
            debug!(?pending, requested = ?target, "State request already in flight, skipping");
            return false;
        }
        *slot = Some(target);
        true
    }

    fn clear_pending(&self) {
        *self.pending_slot() = None;
    }

    async fn state_request(
        &self,
        target: ApplicationState,
    ) -> Result<Option<PlatformData>, CoreError> {
        self.state_request_from(self.current_state(), target).await
    }

    /// Issue a state request, treating `current` as the state the
    /// transition is judged against. Callers holding a fresher report
    /// than the watch (an initialize reply) pass it in directly.
    async fn state_request_from(
        &self,
        current: ApplicationState,
        target: ApplicationState,
    ) -> Result<Option<PlatformData>, CoreError> {
        if !self.try_reserve(current, target) {
            return Ok(None);
        }
        let result = self.perform_state_request(current, target).await;
        self.clear_pending();
        result.map(Some)
    }

    async fn perform_state_request(
        &self,
        current: ApplicationState,
        target: ApplicationState,
    ) -> Result<PlatformData, CoreError> {
        // Leaving ACTIVE for an idle state, enabled components must be
        // released before the platform will grant the transition.
        if current == ApplicationState::Active
            && matches!(
                target,
                ApplicationState::Available | ApplicationState::Unavailable
            )
        {
            self.disable_enabled_components().await?;
        }

        info!(from = ?current, to = ?target, "Requesting application state");
        let envelope = ApplicationData::new(Directive::PlatformApplicationsStaterequest)
            .with_application_state(ApplicationStateBlock::request(
                target,
                StateChangeReason::NotApplicable,
                "",
            ));
        self.session.call(envelope).await
    }

    /// Fire a state request from the event loop without blocking it.
    fn spawn_state_request(self: &Arc<Self>, target: ApplicationState) {
        let current = self.current_state();
        if !self.try_reserve(current, target) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let result = inner.perform_state_request(current, target).await;
            inner.clear_pending();
            if let Err(e) = result {
                warn!(?target, error = %e, "Recovery state request failed");
            }
        });
    }

    async fn disable_enabled_components(&self) -> Result<(), CoreError> {
        let Some(arena) = self.arena.load_full() else {
            return Ok(());
        };
        for component in arena.iter() {
            if component.enabled() {
                component.disable().await?;
            }
        }
        Ok(())
    }

    /// Wait for the platform to confirm `target`, bounded by the call
    /// timeout.
    async fn await_confirmed(&self, target: ApplicationState) -> Result<(), CoreError> {
        let mut state_rx = self.state_tx.subscribe();
        let wait = state_rx.wait_for(|change| change.current == target);
        match tokio::time::timeout(self.call_timeout, wait).await {
            Err(_elapsed) => Err(CoreError::ConfirmationTimeout {
                state: target,
                timeout: self.call_timeout,
            }),
            Ok(Err(_closed)) => Err(CoreError::Disconnected),
            Ok(Ok(_)) => Ok(()),
        }
    }

    fn set_online(self: &Arc<Self>, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!(online, "Application online flag changed");
        }
        self.check_required_components();
    }

    // ── Recovery loop ────────────────────────────────────────────────

    /// Reconcile the platform state with component health and the
    /// online flag. Online with every required component ready and the
    /// platform holding us UNAVAILABLE, ask for AVAILABLE; online with
    /// a required component down, ask for UNAVAILABLE; offline, ask
    /// for UNAVAILABLE. A pending request defers the whole check to
    /// its confirmation.
    fn check_required_components(self: &Arc<Self>) {
        if self.pending_state().is_some() {
            return;
        }

        let arena = self.arena.load_full();
        if self.online.load(Ordering::SeqCst) {
            let Some(arena) = arena else {
                return;
            };
            let missing = arena.unavailable_required();
            if missing.is_empty() {
                if self.current_state() == ApplicationState::Unavailable {
                    debug!("Required components all ready, requesting AVAILABLE");
                    self.spawn_state_request(ApplicationState::Available);
                }
            } else {
                debug!(components = ?missing, "Required components not ready, requesting UNAVAILABLE");
                self.spawn_state_request(ApplicationState::Unavailable);
            }
        } else if arena.is_some() {
            self.spawn_state_request(ApplicationState::Unavailable);
        }
    }

    // ── Envelope handling ────────────────────────────────────────────

    /// React to one inbound envelope. Synchronous: every side effect is
    /// spawned, and the confirmed state and component tracks are
    /// updated before the next envelope is looked at.
    fn handle_envelope(self: &Arc<Self>, envelope: &PlatformData) {
        if envelope.meta.message_code == MessageCode::SessionTimeout {
            warn!("Platform reports the session timed out");
            self.emit(ClientEvent::SessionTimeout);
        }

        let Some(confirmed) = envelope.state_code() else {
            error!(
                directive = ?envelope.meta.platform_directive,
                "Envelope reports no application state, closing the connection"
            );
            self.session.close_socket();
            return;
        };

        self.apply_confirmed_state(confirmed, envelope);

        if let Some(id) = envelope.meta.component_id {
            self.dispatch_component(id, envelope);
        }
    }

    fn apply_confirmed_state(self: &Arc<Self>, confirmed: ApplicationState, envelope: &PlatformData) {
        let change = self.state_tx.borrow().advanced(confirmed);
        if change.previous == change.current {
            return;
        }
        self.state_tx.send_replace(change);
        info!(from = ?change.previous, to = ?change.current, "Application state changed");
        self.emit(ClientEvent::StateChanged(change));

        match confirmed {
            ApplicationState::Unavailable => self.on_entered_unavailable(),
            ApplicationState::Active => self.on_entered_active(envelope),
            _ => {}
        }

        if change.previous == ApplicationState::Active {
            self.on_left_active(confirmed);
        }
    }

    /// Entering UNAVAILABLE: refresh every component and let the
    /// recovery loop decide whether to come back up.
    fn on_entered_unavailable(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.query_components().await;
            if inner.online.load(Ordering::SeqCst) {
                inner.check_required_components();
            }
        });
    }

    /// Entering ACTIVE: capture the activation parameters and wake the
    /// printers a passenger session will want.
    fn on_entered_active(self: &Arc<Self>, envelope: &PlatformData) {
        let raw = envelope
            .payload
            .application_activation
            .clone()
            .unwrap_or_default();
        let snapshot = Activation::from(&raw);
        info!(
            multi_tenant = snapshot.multi_tenant,
            accessible = snapshot.accessible_mode,
            language = %snapshot.language,
            "Application activated"
        );
        self.activation.store(Some(Arc::new(snapshot)));
        self.emit(ClientEvent::Activated(raw));

        if let Some(arena) = self.arena.load_full() {
            for component in arena.iter() {
                if component.role().is_printer() && component.ready() {
                    let printer = Arc::clone(component);
                    tokio::spawn(async move {
                        if let Err(e) = printer.enable().await {
                            warn!(component = %printer.id(), error = %e, "Printer enable failed");
                        }
                    });
                }
            }
        }
    }

    /// Leaving ACTIVE: the platform has already torn interaction down,
    /// so enabled flags are cleared locally rather than on the wire.
    fn on_left_active(&self, new_state: ApplicationState) {
        if let Some(arena) = self.arena.load_full() {
            for component in arena.iter() {
                component.clear_enabled();
            }
        }
        self.activation.store(None);
        self.emit(ClientEvent::Deactivated(new_state));
    }

    /// Component-addressed envelope: publish data, move the tracks,
    /// refresh printer aggregates, and run the reactions that keep
    /// assemblies honest.
    fn dispatch_component(self: &Arc<Self>, id: ComponentId, envelope: &PlatformData) {
        let Some(arena) = self.arena.load_full() else {
            return;
        };
        let Some(component) = arena.get(id) else {
            debug!(component = %id, "Envelope for a component discovery never named");
            return;
        };

        // Data flows to subscribers on every DATAPRESENT envelope,
        // independent of whether the tracks moved.
        if component.role().reads_data()
            && envelope.meta.message_code == MessageCode::DataPresent
        {
            if let Some(records) = envelope.payload.data_records.as_ref() {
                if !records.is_empty() {
                    component.publish_data(records.clone());
                }
            }
        }

        let view = component_view(&component, envelope);
        if component.differs(view) {
            if component.role().is_printer() {
                self.printer_reactions(&arena, &component, view);
            }

            let delta = component.apply_view(view);

            for (printer_id, _delta) in arena.refresh_assemblies(id) {
                if printer_id != id {
                    self.emit(ClientEvent::ComponentChanged(printer_id));
                }
            }

            if component.role() == DeviceRole::Dispenser && delta.status_changed {
                self.dispenser_status_changed(&component);
            }

            component.poll_if_required();
            self.emit(ClientEvent::ComponentChanged(id));

            // Health changes the application did not ask about feed the
            // recovery loop: unsolicited reports and query answers.
            let health_report = envelope.is_unsolicited()
                || envelope.meta.platform_directive == Some(Directive::PeripheralsQuery);
            if health_report && self.online.load(Ordering::SeqCst) {
                self.check_required_components();
            }
        }
    }

    /// Reactions judged against the printer's tracks before the
    /// envelope is applied to them.
    fn printer_reactions(
        self: &Arc<Self>,
        arena: &Arc<ComponentArena>,
        printer: &Arc<Component>,
        view: StateView,
    ) {
        let Some(links) = printer.links().copied() else {
            return;
        };

        if !printer.ready() && view.ready {
            // The printer itself recovered while the assembly is held
            // down; the linked pair may be reporting stale state.
            for id in [links.feeder, links.dispenser] {
                if let Some(linked) = arena.get(id) {
                    spawn_query(linked);
                }
            }
        } else if view.status == MessageCode::MediaPresent {
            // Media surfaced in the dispenser tray, reported through
            // the printer. Mark it and let the dispenser's own answer
            // settle the rest.
            if let Some(dispenser) = arena.get(links.dispenser) {
                if dispenser.set_media_present(true) {
                    self.emit(ClientEvent::MediaPresent {
                        component: dispenser.id(),
                        present: true,
                    });
                }
                spawn_query(dispenser);
            }
        }
    }

    /// A dispenser status move either starts the pickup watch (media
    /// appeared) or ends it (media taken or the fault cleared).
    fn dispenser_status_changed(self: &Arc<Self>, dispenser: &Arc<Component>) {
        if dispenser.own_status() == MessageCode::MediaPresent {
            dispenser.poll_until_ready(true, MEDIA_POLL_INTERVAL);
            if dispenser.set_media_present(true) {
                self.emit(ClientEvent::MediaPresent {
                    component: dispenser.id(),
                    present: true,
                });
            }
        } else if dispenser.set_media_present(false) {
            self.emit(ClientEvent::MediaPresent {
                component: dispenser.id(),
                present: false,
            });
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event);
    }
}

// ── Event loop ───────────────────────────────────────────────────────

async fn event_loop(
    inner: Arc<ClientInner>,
    mut dispatch: mpsc::Receiver<Arc<PlatformData>>,
    mut session_events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            envelope = dispatch.recv() => {
                let Some(envelope) = envelope else { break };
                inner.handle_envelope(&envelope);
            }
            event = session_events.recv() => match event {
                Ok(SessionEvent::Connected { generation }) => {
                    if generation > inner.initialized_generation.load(Ordering::SeqCst) {
                        info!(generation, "Reconnected, re-initializing");
                        let inner = Arc::clone(&inner);
                        tokio::spawn(async move {
                            if let Err(e) = inner.initialize().await {
                                error!(error = %e, "Re-initialization failed");
                            }
                        });
                    }
                }
                Ok(SessionEvent::Closed) => {
                    debug!("Platform connection closed");
                }
                Ok(SessionEvent::Ping { timestamp }) => {
                    inner.emit(ClientEvent::Ping { timestamp });
                }
                Ok(SessionEvent::Ack { code }) => {
                    inner.emit(ClientEvent::Ack { code });
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Session events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("Client event loop exiting");
}

// ── Transition rules ─────────────────────────────────────────────────

/// Whether the platform accepts a request for `target` from `current`.
/// INITIALIZE and SUSPENDED are platform-imposed and never requestable.
fn allows_transition(current: ApplicationState, target: ApplicationState) -> bool {
    use ApplicationState as S;
    match target {
        S::Available => matches!(current, S::Unavailable | S::Active),
        S::Unavailable => matches!(current, S::Initialize | S::Available | S::Active),
        S::Active => matches!(current, S::Available | S::Active),
        S::Stopped => true,
        S::Reload => matches!(current, S::Unavailable | S::Available | S::Active),
        S::Initialize | S::Suspended => false,
    }
}

/// The track view an envelope reports for a component, with the one
/// printer quirk applied: a send that times out mid cut-and-hold
/// leaves the device usable even though it reports UNAVAILABLE until
/// the job clears.
fn component_view(component: &Component, envelope: &PlatformData) -> StateView {
    let mut view = StateView::from_envelope(envelope);
    if component.role().is_printer()
        && envelope.meta.platform_directive == Some(Directive::PeripheralsSend)
        && view.status == MessageCode::Timeout
        && !view.ready
    {
        view.ready = true;
    }
    view
}

fn spawn_query(component: Arc<Component>) {
    tokio::spawn(async move {
        if let Err(e) = component.query().await {
            debug!(component = %component.id(), error = %e, "Component query failed");
        }
    });
}

// ── Tests ────────────────────────────────────────────────────────────
