// ── Peripheral model ──
//
// One record per platform component, held in an arena built from the
// discovery list. Records carry two independent tracks: a readiness
// flag (READY / not) and the last reported status code. Both are watch
// channels, so consumers observe edges without polling; the discrete
// event stream on the client carries the same edges for code that
// prefers events.
//
// Records never mutate each other. Composite printers are aggregated by
// the arena from id lookups, and all track updates flow through the
// client's event loop in envelope arrival order.

mod arena;
mod roles;

pub use arena::ComponentArena;
pub use roles::{Announcement, CardReader, DataReader, Printer};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use cuss2_api::model::{
    ApplicationData, ComponentDescriptor, ComponentId, ComponentState, DataRecord, Directive,
    MessageCode, PlatformData,
};

use crate::classify::DeviceRole;
use crate::error::CoreError;
use crate::session::Session;

const DATA_CHANNEL_SIZE: usize = 16;

/// Poll cadence while a dispenser holds presented media.
pub(crate) const MEDIA_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ── StateView ────────────────────────────────────────────────────────

/// The readiness and status a single envelope reports for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateView {
    pub ready: bool,
    pub status: MessageCode,
}

impl StateView {
    /// Read the component tracks out of an envelope. A missing
    /// `componentState` counts as not ready.
    pub fn from_envelope(envelope: &PlatformData) -> Self {
        Self {
            ready: envelope.meta.component_state == Some(ComponentState::Ready),
            status: envelope.meta.message_code,
        }
    }
}

/// Which tracks an update actually moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StateDelta {
    pub ready_changed: bool,
    pub status_changed: bool,
}

impl StateDelta {
    pub fn any(self) -> bool {
        self.ready_changed || self.status_changed
    }
}

// ── PrinterLinks ─────────────────────────────────────────────────────

/// Feeder and dispenser ids a printer was linked to at discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrinterLinks {
    pub feeder: ComponentId,
    pub dispenser: ComponentId,
}

impl PrinterLinks {
    pub fn contains(&self, id: ComponentId) -> bool {
        self.feeder == id || self.dispenser == id
    }
}

// ── Component ────────────────────────────────────────────────────────

/// One platform component.
///
/// Generic operations (`enable`, `disable`, `query`, ...) address the
/// component over the live session. Track state is only ever written by
/// the client's event loop; everything here reads it through the watch
/// channels.
pub struct Component {
    descriptor: ComponentDescriptor,
    role: DeviceRole,
    session: Session,
    poll_interval: Duration,

    required: AtomicBool,
    enabled: AtomicBool,
    in_flight: AtomicUsize,
    poll_active: AtomicBool,

    // Own tracks, as reported by the platform for this id.
    ready_tx: watch::Sender<bool>,
    status_tx: watch::Sender<MessageCode>,

    // Aggregated tracks; only meaningful for printers, where they cover
    // the printer-feeder-dispenser triple.
    combined_ready_tx: watch::Sender<bool>,
    combined_status_tx: watch::Sender<MessageCode>,

    // Media presence; only meaningful for dispensers.
    media_present_tx: watch::Sender<bool>,

    data_tx: broadcast::Sender<Vec<DataRecord>>,
    links: OnceLock<PrinterLinks>,
    cancel: CancellationToken,
}

impl Component {
    pub(crate) fn new(
        descriptor: ComponentDescriptor,
        role: DeviceRole,
        session: Session,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (ready_tx, _) = watch::channel(false);
        let (status_tx, _) = watch::channel(MessageCode::Ok);
        let (combined_ready_tx, _) = watch::channel(false);
        let (combined_status_tx, _) = watch::channel(MessageCode::Ok);
        let (media_present_tx, _) = watch::channel(false);
        let (data_tx, _) = broadcast::channel(DATA_CHANNEL_SIZE);

        Self {
            descriptor,
            role,
            session,
            poll_interval,
            required: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            poll_active: AtomicBool::new(false),
            ready_tx,
            status_tx,
            combined_ready_tx,
            combined_status_tx,
            media_present_tx,
            data_tx,
            links: OnceLock::new(),
            cancel,
        }
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn id(&self) -> ComponentId {
        self.descriptor.component_id
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    /// Feeder and dispenser ids, for printers.
    pub fn links(&self) -> Option<&PrinterLinks> {
        self.links.get()
    }

    pub(crate) fn set_links(&self, links: PrinterLinks) {
        let _ = self.links.set(links);
    }

    // ── Flags ────────────────────────────────────────────────────────

    /// Whether this component gates the AVAILABLE state. Off by default;
    /// the application marks the peripherals its business flow needs.
    pub fn required(&self) -> bool {
        self.required.load(Ordering::SeqCst)
    }

    pub fn set_required(&self, required: bool) {
        self.required.store(required, Ordering::SeqCst);
    }

    /// Whether the component was enabled and has not been disabled since.
    /// Cleared locally when readiness drops or the application leaves
    /// ACTIVE.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether any call addressed to this component is still in flight.
    pub fn pending(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn clear_enabled(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    // ── Track state ──────────────────────────────────────────────────

    /// Current readiness. For a printer this is the aggregated
    /// readiness of the printer-feeder-dispenser triple.
    pub fn ready(&self) -> bool {
        if self.role.is_printer() {
            *self.combined_ready_tx.borrow()
        } else {
            *self.ready_tx.borrow()
        }
    }

    /// Current status code. For a printer this is the first non-OK
    /// status across the triple, in printer, feeder, dispenser order.
    pub fn status(&self) -> MessageCode {
        if self.role.is_printer() {
            *self.combined_status_tx.borrow()
        } else {
            *self.status_tx.borrow()
        }
    }

    /// Watch readiness edges.
    pub fn ready_changes(&self) -> watch::Receiver<bool> {
        if self.role.is_printer() {
            self.combined_ready_tx.subscribe()
        } else {
            self.ready_tx.subscribe()
        }
    }

    /// Watch status edges.
    pub fn status_changes(&self) -> watch::Receiver<MessageCode> {
        if self.role.is_printer() {
            self.combined_status_tx.subscribe()
        } else {
            self.status_tx.subscribe()
        }
    }

    /// Whether presented media is waiting to be taken (dispensers).
    pub fn media_present(&self) -> bool {
        *self.media_present_tx.borrow()
    }

    pub fn media_present_changes(&self) -> watch::Receiver<bool> {
        self.media_present_tx.subscribe()
    }

    /// Subscribe to data records published by this component
    /// (`DATAPRESENT` envelopes).
    pub fn data_records(&self) -> broadcast::Receiver<Vec<DataRecord>> {
        self.data_tx.subscribe()
    }

    pub(crate) fn own_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub(crate) fn own_status(&self) -> MessageCode {
        *self.status_tx.borrow()
    }

    /// Whether an envelope reports anything this record does not already
    /// hold.
    pub(crate) fn differs(&self, view: StateView) -> bool {
        self.own_ready() != view.ready || self.own_status() != view.status
    }

    /// Apply one envelope's view to the own tracks. Losing readiness
    /// clears the enabled flag, since the platform drops the enable on
    /// its side.
    pub(crate) fn apply_view(&self, view: StateView) -> StateDelta {
        let ready_changed = self.ready_tx.send_if_modified(|current| {
            if *current == view.ready {
                false
            } else {
                *current = view.ready;
                true
            }
        });
        if ready_changed && !view.ready {
            self.clear_enabled();
        }

        let status_changed = self.status_tx.send_if_modified(|current| {
            if *current == view.status {
                false
            } else {
                *current = view.status;
                true
            }
        });

        StateDelta {
            ready_changed,
            status_changed,
        }
    }

    /// Replace the aggregated tracks, reporting which moved.
    pub(crate) fn set_combined(&self, ready: bool, status: MessageCode) -> StateDelta {
        let ready_changed = self.combined_ready_tx.send_if_modified(|current| {
            if *current == ready {
                false
            } else {
                *current = ready;
                true
            }
        });
        let status_changed = self.combined_status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        StateDelta {
            ready_changed,
            status_changed,
        }
    }

    /// Flip the media-present flag. Returns whether this was an edge.
    pub(crate) fn set_media_present(&self, present: bool) -> bool {
        self.media_present_tx.send_if_modified(|current| {
            if *current == present {
                false
            } else {
                *current = present;
                true
            }
        })
    }

    pub(crate) fn publish_data(&self, records: Vec<DataRecord>) {
        // No subscribers is fine; readers subscribe before enabling.
        let _ = self.data_tx.send(records);
    }

    // ── Platform operations ──────────────────────────────────────────

    /// Enable user interaction with the component.
    pub async fn enable(&self) -> Result<PlatformData, CoreError> {
        let reply = self
            .dispatch(self.addressed(Directive::PeripheralsUserpresentEnable))
            .await?;
        self.enabled.store(true, Ordering::SeqCst);
        Ok(reply)
    }

    /// Disable user interaction with the component.
    ///
    /// A platform answering OUTOFSEQUENCE means the component was not
    /// enabled, which is already the state we asked for.
    pub async fn disable(&self) -> Result<(), CoreError> {
        let result = self
            .dispatch(self.addressed(Directive::PeripheralsUserpresentDisable))
            .await;
        match result {
            Ok(_reply) => {
                self.clear_enabled();
                Ok(())
            }
            Err(e) if e.platform_code() == Some(MessageCode::OutOfSequence) => {
                self.clear_enabled();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Abort whatever the component is doing.
    pub async fn cancel(&self) -> Result<PlatformData, CoreError> {
        self.dispatch(self.addressed(Directive::PeripheralsCancel))
            .await
    }

    /// Ask the platform for the component's current state. The reply
    /// flows back through the envelope stream like any other.
    pub async fn query(&self) -> Result<PlatformData, CoreError> {
        self.dispatch(self.addressed(Directive::PeripheralsQuery))
            .await
    }

    /// Offer the component to the user (insertion prompt).
    pub async fn offer(&self) -> Result<PlatformData, CoreError> {
        self.dispatch(self.addressed(Directive::PeripheralsUserpresentOffer))
            .await
    }

    /// Send data records to the component.
    pub async fn send_records(&self, records: Vec<DataRecord>) -> Result<PlatformData, CoreError> {
        self.dispatch(
            self.addressed(Directive::PeripheralsSend)
                .with_data_records(records),
        )
        .await
    }

    /// Push setup records (templates, data-type filters) to the
    /// component.
    pub async fn setup(&self, records: Vec<DataRecord>) -> Result<PlatformData, CoreError> {
        self.dispatch(
            self.addressed(Directive::PeripheralsSetup)
                .with_data_records(records),
        )
        .await
    }

    /// Issue a bare directive addressed to this component.
    pub(crate) async fn command(&self, directive: Directive) -> Result<PlatformData, CoreError> {
        self.dispatch(self.addressed(directive)).await
    }

    /// Issue a directive carrying data records.
    pub(crate) async fn command_with_records(
        &self,
        directive: Directive,
        records: Vec<DataRecord>,
    ) -> Result<PlatformData, CoreError> {
        self.dispatch(self.addressed(directive).with_data_records(records))
            .await
    }

    // ── Reconciliation poll ──────────────────────────────────────────

    /// Query the component on an interval until it reports ready (and,
    /// when `require_ok`, a normal status).
    ///
    /// At most one poller runs per component; a second request while one
    /// is active is ignored. The poller dies with the client.
    pub fn poll_until_ready(self: &Arc<Self>, require_ok: bool, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        if self.poll_active.swap(true, Ordering::SeqCst) {
            return;
        }

        let component = Arc::clone(self);
        tokio::spawn(async move {
            debug!(component = %component.id(), "Reconciliation poll started");
            loop {
                if component.ready() && (!require_ok || component.status() == MessageCode::Ok) {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = component.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = component.query().await {
                    trace!(component = %component.id(), error = %e, "Poll query failed");
                }
            }
            component.poll_active.store(false, Ordering::SeqCst);
            debug!(component = %component.id(), "Reconciliation poll finished");
        });
    }

    /// Arm the default-cadence poll that backs required components.
    pub(crate) fn poll_if_required(self: &Arc<Self>) {
        if self.required() && !self.ready() {
            self.poll_until_ready(false, self.poll_interval);
        }
    }

    pub(crate) fn polling(&self) -> bool {
        self.poll_active.load(Ordering::SeqCst)
    }

    // ── Internals ────────────────────────────────────────────────────

    fn addressed(&self, directive: Directive) -> ApplicationData {
        ApplicationData::new(directive).with_component(self.id())
    }

    async fn dispatch(&self, envelope: ApplicationData) -> Result<PlatformData, CoreError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);
        self.session.call(envelope).await
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("id", &self.id())
            .field("role", &self.role)
            .field("ready", &self.ready())
            .field("status", &self.status())
            .field("required", &self.required())
            .field("enabled", &self.enabled())
            .finish_non_exhaustive()
    }
}

/// Keeps the in-flight counter honest when a caller drops mid-call.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::session::{Connect, Established};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct OfflineConnector;

    #[async_trait]
    impl Connect for OfflineConnector {
        async fn establish(
            &self,
            _cancel: CancellationToken,
        ) -> Result<Established, CoreError> {
            Err(CoreError::Disconnected)
        }

        async fn refresh(&self) -> Result<Option<Duration>, CoreError> {
            Ok(None)
        }
    }

    fn idle_session() -> Session {
        Session::new(OfflineConnector, ReconnectConfig::default())
    }

    fn component(role: DeviceRole) -> Component {
        let descriptor = ComponentDescriptor {
            component_id: ComponentId::new(9),
            ..ComponentDescriptor::default()
        };
        Component::new(
            descriptor,
            role,
            idle_session(),
            Duration::from_secs(3),
            CancellationToken::new(),
        )
    }

    #[test]
    fn fresh_component_is_not_ready_with_ok_status() {
        let c = component(DeviceRole::BarcodeReader);
        assert!(!c.ready());
        assert_eq!(c.status(), MessageCode::Ok);
        assert!(!c.enabled());
        assert!(!c.required());
        assert!(!c.pending());
    }

    #[test]
    fn differs_compares_both_tracks() {
        let c = component(DeviceRole::BarcodeReader);
        assert!(c.differs(StateView { ready: true, status: MessageCode::Ok }));
        assert!(c.differs(StateView { ready: false, status: MessageCode::HardwareError }));
        assert!(!c.differs(StateView { ready: false, status: MessageCode::Ok }));
    }

    #[test]
    fn apply_view_reports_exactly_what_moved() {
        let c = component(DeviceRole::BarcodeReader);

        let delta = c.apply_view(StateView { ready: true, status: MessageCode::Ok });
        assert_eq!(delta, StateDelta { ready_changed: true, status_changed: false });

        let delta = c.apply_view(StateView { ready: true, status: MessageCode::MediaPresent });
        assert_eq!(delta, StateDelta { ready_changed: false, status_changed: true });

        let delta = c.apply_view(StateView { ready: true, status: MessageCode::MediaPresent });
        assert!(!delta.any());
    }

    #[tokio::test]
    async fn losing_readiness_clears_enabled() {
        let c = component(DeviceRole::BarcodeReader);
        c.apply_view(StateView { ready: true, status: MessageCode::Ok });

        // Enablement normally flows through the platform; force the flag
        // to observe the local clear.
        c.enabled.store(true, Ordering::SeqCst);
        c.apply_view(StateView { ready: false, status: MessageCode::Ok });

        assert!(!c.enabled());
        assert!(!c.ready());
    }

    #[test]
    fn printer_reads_combined_tracks() {
        let c = component(DeviceRole::BagTagPrinter);
        c.apply_view(StateView { ready: true, status: MessageCode::Ok });

        // Own track is ready, but the aggregate has not been refreshed.
        assert!(c.own_ready());
        assert!(!c.ready());

        c.set_combined(true, MessageCode::Ok);
        assert!(c.ready());

        let delta = c.set_combined(true, MessageCode::MediaPresent);
        assert!(!delta.ready_changed);
        assert!(delta.status_changed);
        assert_eq!(c.status(), MessageCode::MediaPresent);
    }

    #[test]
    fn media_present_flips_only_on_edges() {
        let c = component(DeviceRole::Dispenser);
        assert!(c.set_media_present(true));
        assert!(!c.set_media_present(true));
        assert!(c.set_media_present(false));
    }

    #[tokio::test]
    async fn ops_against_a_dead_session_fail_disconnected() {
        let c = component(DeviceRole::BarcodeReader);
        let err = c.query().await.unwrap_err();
        assert!(err.is_disconnected(), "got: {err:?}");
        assert!(!c.pending());
    }

    #[tokio::test]
    async fn at_most_one_poller_per_component() {
        let c = Arc::new(component(DeviceRole::BarcodeReader));
        c.poll_until_ready(false, Duration::from_secs(3));
        assert!(c.polling());

        // Second arm is a no-op while the first is live.
        c.poll_until_ready(false, Duration::from_millis(1));
        assert!(c.polling());
    }

    #[test]
    fn zero_interval_disables_polling() {
        let c = Arc::new(component(DeviceRole::BarcodeReader));
        c.poll_until_ready(false, Duration::ZERO);
        assert!(!c.polling());
    }
}
