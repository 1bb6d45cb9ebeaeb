// ── CUSS2 wire model ──
//
// Envelope types for the platform WebSocket channel. One outbound shape
// (`ApplicationData`) and one inbound shape (`PlatformData`), each a
// `meta` block plus a `payload` block. Field names follow the platform's
// JSON contract (`requestID`, `componentID`, ...), so renames are explicit
// where camelCase would get them wrong.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ── Identifiers ──────────────────────────────────────────────────────

/// Correlation id carried in `meta.requestID`.
///
/// Opaque on the wire; freshly generated ids are UUIDv4 strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Numeric component id, stable for the lifetime of a platform session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ComponentId(u16);

impl ComponentId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u16> for ComponentId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

// ── Protocol enums ───────────────────────────────────────────────────

/// Application lifecycle states, as confirmed by the platform.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ApplicationState {
    Stopped,
    Initialize,
    Unavailable,
    Available,
    Active,
    Suspended,
    Reload,
}

/// Binary component readiness reported in `meta.componentState`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ComponentState {
    Ready,
    Unavailable,
}

/// Named operations requested of the platform.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Directive {
    PlatformEnvironment,
    PlatformComponents,
    PlatformApplicationsStaterequest,
    PeripheralsQuery,
    PeripheralsSend,
    PeripheralsSetup,
    PeripheralsCancel,
    PeripheralsUserpresentEnable,
    PeripheralsUserpresentDisable,
    PeripheralsUserpresentOffer,
    PeripheralsAnnouncementPlay,
    PeripheralsAnnouncementPause,
    PeripheralsAnnouncementResume,
    PeripheralsAnnouncementStop,
}

/// Status / message codes reported in `meta.messageCode`.
///
/// `Ok` is the normal code; `DataPresent` and `MediaPresent` are
/// informational. Codes in the critical denylist fail a `call` with
/// [`PlatformResponseError`](crate::error::PlatformResponseError) instead
/// of resolving it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
#[non_exhaustive]
pub enum MessageCode {
    #[default]
    Ok,
    DataPresent,
    MediaPresent,

    // Critical: cancellation / sequencing / timeouts
    Cancelled,
    WrongApplicationState,
    OutOfSequence,
    Timeout,
    SessionTimeout,
    KillTimeout,

    // Critical: software / data faults
    SoftwareError,
    CriticalSoftwareError,
    FormatError,
    LengthError,
    DataMissing,
    ThresholdError,
    ThresholdUsage,

    // Critical: hardware faults
    HardwareError,
    NotReachable,
    NotResponding,

    // Critical: baggage-handling faults
    BaggageFull,
    BaggageUndetected,
    BaggageOversized,
    BaggageTooManyBags,
    BaggageUnexpectedBag,
    BaggageTooHigh,
    BaggageTooLong,
    BaggageTooFlat,
    BaggageTooShort,
    BaggageInvalidData,
    BaggageWeightOutOfRange,
    BaggageJammed,
    BaggageEmergencyStop,
    BaggageRestless,
    BaggageTransportBusy,
    BaggageMistracked,
    BaggageUnexpectedChange,
    BaggageInterferenceUser,
    BaggageIntrusionSafety,
    BaggageNotConveyable,
    BaggageIrregularBag,
    BaggageVolumeNotDeterminable,
    BaggageOverflowTub,

    /// Any code this crate does not model. Treated as informational.
    #[serde(other)]
    Unknown,
}

impl MessageCode {
    /// Whether this code must fail a `call` rather than resolve it.
    ///
    /// The denylist is fixed by the protocol: cancellation, sequencing,
    /// timeout-class, software/hardware faults, and the baggage family.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::WrongApplicationState
                | Self::OutOfSequence
                | Self::Timeout
                | Self::SessionTimeout
                | Self::KillTimeout
                | Self::SoftwareError
                | Self::CriticalSoftwareError
                | Self::FormatError
                | Self::LengthError
                | Self::DataMissing
                | Self::ThresholdError
                | Self::ThresholdUsage
                | Self::HardwareError
                | Self::NotReachable
                | Self::NotResponding
                | Self::BaggageFull
                | Self::BaggageUndetected
                | Self::BaggageOversized
                | Self::BaggageTooManyBags
                | Self::BaggageUnexpectedBag
                | Self::BaggageTooHigh
                | Self::BaggageTooLong
                | Self::BaggageTooFlat
                | Self::BaggageTooShort
                | Self::BaggageInvalidData
                | Self::BaggageWeightOutOfRange
                | Self::BaggageJammed
                | Self::BaggageEmergencyStop
                | Self::BaggageRestless
                | Self::BaggageTransportBusy
                | Self::BaggageMistracked
                | Self::BaggageUnexpectedChange
                | Self::BaggageInterferenceUser
                | Self::BaggageIntrusionSafety
                | Self::BaggageNotConveyable
                | Self::BaggageIrregularBag
                | Self::BaggageVolumeNotDeterminable
                | Self::BaggageOverflowTub
        )
    }
}

/// Reason codes attached to state-change requests.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateChangeReason {
    #[default]
    NotApplicable,
    Timeout,
    Completed,
    Cancelled,
}

/// Execution mode delivered with activation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionMode {
    /// Multi-application mode: the platform hosts several tenants.
    Mam,
    /// Dedicated single-application mode.
    #[default]
    Dsam,
}

/// Data-type tags on [`DataRecord`]s and setup filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DataType {
    #[serde(rename = "DS_TYPES_ITPS")]
    Itps,
    #[serde(rename = "DS_TYPES_BARCODE")]
    Barcode,
    #[serde(rename = "DS_TYPES_KEY")]
    Key,
    #[serde(rename = "DS_TYPES_KEY_UP")]
    KeyUp,
    #[serde(rename = "DS_TYPES_KEY_DOWN")]
    KeyDown,
    #[serde(rename = "DS_TYPES_BIOMETRIC")]
    Biometric,
    #[serde(rename = "DS_TYPES_FOID_ISO")]
    FoidIso,
    #[serde(rename = "DS_TYPES_PAYMENT_ISO")]
    PaymentIso,
    #[serde(rename = "DS_TYPES_SSML")]
    Ssml,
    #[serde(other)]
    Unknown,
}

/// Media handled by a component, from its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[non_exhaustive]
pub enum MediaType {
    BaggageTag,
    BoardingPass,
    Passport,
    MagCard,
    Audio,
    Baggage,
    Image,
    #[serde(other)]
    Unknown,
}

/// Device kinds listed in a descriptor's characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[non_exhaustive]
pub enum DeviceType {
    Print,
    Scale,
    Camera,
    Illumination,
    Assistive,
    #[serde(other)]
    Unknown,
}

/// Component taxonomy from the platform's component list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ComponentType {
    DataInput,
    MediaInput,
    MediaOutput,
    UserInput,
    UserOutput,
    Announcement,
    Feeder,
    Dispenser,
    #[serde(other)]
    Unknown,
}

// ── Payload building blocks ──────────────────────────────────────────

/// One opaque business-payload record tagged with its data types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRecord {
    pub data: String,
    #[serde(default)]
    pub ds_types: Vec<DataType>,
}

impl DataRecord {
    pub fn new(data: impl Into<String>, ds_types: Vec<DataType>) -> Self {
        Self { data: data.into(), ds_types }
    }

    /// Record tagged with the default ITPS data type.
    pub fn itps(data: impl Into<String>) -> Self {
        Self::new(data, vec![DataType::Itps])
    }
}

/// Application-state block, used both in outbound state requests and in
/// the inbound `meta.currentApplicationState` echo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStateBlock {
    #[serde(default)]
    pub application_state_code: Option<ApplicationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_state_change_reason_code: Option<StateChangeReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_state_change_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_brand: Option<String>,
}

impl ApplicationStateBlock {
    /// Block for an outbound `platformApplicationsStaterequest`.
    pub fn request(
        state: ApplicationState,
        reason_code: StateChangeReason,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            application_state_code: Some(state),
            application_state_change_reason_code: Some(reason_code),
            application_state_change_reason: Some(reason.into()),
            application_brand: None,
        }
    }
}

/// Activation parameters delivered when the application enters `ACTIVE`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationActivation {
    #[serde(default)]
    pub application_brand: Option<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub accessible_mode: bool,
    #[serde(default)]
    pub execution_options: Option<String>,
    #[serde(rename = "languageID", default)]
    pub language_id: Option<String>,
    #[serde(default)]
    pub transfer_data: Option<String>,
}

/// Platform environment descriptor (`platformEnvironment` reply).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentLevel {
    #[serde(rename = "deviceID", default)]
    pub device_id: Option<Uuid>,
    #[serde(default)]
    pub session_timeout: Option<u64>,
    #[serde(default)]
    pub kill_timeout: Option<u64>,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

/// Capability lists inside a component descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentCharacteristics {
    #[serde(default)]
    pub ds_types_list: Vec<DataType>,
    #[serde(default)]
    pub media_types_list: Vec<MediaType>,
    #[serde(default)]
    pub device_types_list: Vec<DeviceType>,
}

/// One entry of the `platformComponents` component list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentDescriptor {
    #[serde(rename = "componentID", default)]
    pub component_id: ComponentId,
    #[serde(default)]
    pub component_type: Option<ComponentType>,
    #[serde(default)]
    pub component_description: Option<String>,
    #[serde(default)]
    pub component_characteristics: Vec<ComponentCharacteristics>,
    #[serde(rename = "linkedComponentIDs", default)]
    pub linked_component_ids: Vec<ComponentId>,
}

impl Default for ComponentId {
    fn default() -> Self {
        Self(0)
    }
}

impl ComponentDescriptor {
    /// First characteristics block, which carries the classification
    /// capabilities for every known platform.
    pub fn characteristics(&self) -> Option<&ComponentCharacteristics> {
        self.component_characteristics.first()
    }
}

// ── Envelopes ────────────────────────────────────────────────────────

/// Metadata block of an outbound envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMeta {
    #[serde(rename = "requestID", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub directive: Directive,
    #[serde(rename = "componentID", default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<ComponentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_token: Option<String>,
    /// Nil until the platform assigns one through the environment reply.
    #[serde(rename = "deviceID", default)]
    pub device_id: Uuid,
}

/// Payload block of an outbound envelope. Unused slots are omitted from
/// the wire; `extra` carries collaborator-supplied payload shapes
/// (illumination, payment, biometric, ...) untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_state: Option<ApplicationStateBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_records: Option<Vec<DataRecord>>,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

/// Outbound envelope: one directive addressed to the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationData {
    pub meta: ApplicationMeta,
    #[serde(default)]
    pub payload: ApplicationPayload,
}

impl ApplicationData {
    pub fn new(directive: Directive) -> Self {
        Self {
            meta: ApplicationMeta {
                request_id: None,
                directive,
                component_id: None,
                oauth_token: None,
                device_id: Uuid::nil(),
            },
            payload: ApplicationPayload::default(),
        }
    }

    pub fn with_component(mut self, id: ComponentId) -> Self {
        self.meta.component_id = Some(id);
        self
    }

    pub fn with_request_id(mut self, id: RequestId) -> Self {
        self.meta.request_id = Some(id);
        self
    }

    pub fn with_data_records(mut self, records: Vec<DataRecord>) -> Self {
        self.payload.data_records = Some(records);
        self
    }

    pub fn with_application_state(mut self, block: ApplicationStateBlock) -> Self {
        self.payload.application_state = Some(block);
        self
    }

    pub fn directive(&self) -> Directive {
        self.meta.directive
    }
}

/// Metadata block of an inbound envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformMeta {
    #[serde(rename = "requestID", default)]
    pub request_id: Option<RequestId>,
    #[serde(rename = "componentID", default)]
    pub component_id: Option<ComponentId>,
    #[serde(default)]
    pub message_code: MessageCode,
    #[serde(default)]
    pub component_state: Option<ComponentState>,
    #[serde(default)]
    pub current_application_state: Option<ApplicationStateBlock>,
    /// Echo of the directive this envelope replies to. Absent on
    /// unsolicited envelopes.
    #[serde(default)]
    pub platform_directive: Option<Directive>,
}

/// Payload block of an inbound envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformPayload {
    #[serde(default)]
    pub environment_level: Option<EnvironmentLevel>,
    #[serde(default)]
    pub component_list: Option<Vec<ComponentDescriptor>>,
    #[serde(default)]
    pub application_activation: Option<ApplicationActivation>,
    #[serde(default)]
    pub data_records: Option<Vec<DataRecord>>,
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

/// Inbound envelope from the platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformData {
    #[serde(default)]
    pub meta: PlatformMeta,
    // Some directives reply with `payload: null`.
    #[serde(default, deserialize_with = "null_to_default")]
    pub payload: PlatformPayload,
}

impl PlatformData {
    /// The platform-confirmed application state, if the envelope carries
    /// one.
    pub fn state_code(&self) -> Option<ApplicationState> {
        self.meta
            .current_application_state
            .as_ref()
            .and_then(|block| block.application_state_code)
    }

    /// An envelope with no directive echo was not produced by any request
    /// of ours.
    pub fn is_unsolicited(&self) -> bool {
        self.meta.platform_directive.is_none()
    }
}

fn null_to_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn outbound_envelope_uses_wire_field_names() {
        let data = ApplicationData::new(Directive::PeripheralsQuery)
            .with_component(ComponentId::new(4))
            .with_request_id(RequestId::from("req-1"));

        let value = serde_json::to_value(&data).expect("serialize");
        assert_eq!(
            value,
            json!({
                "meta": {
                    "requestID": "req-1",
                    "directive": "peripheralsQuery",
                    "componentID": 4,
                    "deviceID": "00000000-0000-0000-0000-000000000000",
                },
                "payload": {},
            })
        );
    }

    #[test]
    fn state_request_payload_shape() {
        let data = ApplicationData::new(Directive::PlatformApplicationsStaterequest)
            .with_application_state(ApplicationStateBlock::request(
                ApplicationState::Unavailable,
                StateChangeReason::NotApplicable,
                "",
            ));

        let value = serde_json::to_value(&data).expect("serialize");
        assert_eq!(
            value["payload"]["applicationState"],
            json!({
                "applicationStateCode": "UNAVAILABLE",
                "applicationStateChangeReasonCode": "NOTAPPLICABLE",
                "applicationStateChangeReason": "",
            })
        );
    }

    #[test]
    fn inbound_envelope_parses_state_and_directive_echo() {
        let raw = json!({
            "meta": {
                "requestID": "abc",
                "messageCode": "OK",
                "currentApplicationState": { "applicationStateCode": "AVAILABLE" },
                "platformDirective": "platformApplicationsStaterequest",
            },
            "payload": null,
        });

        let data: PlatformData = serde_json::from_value(raw).expect("parse");
        assert_eq!(data.state_code(), Some(ApplicationState::Available));
        assert!(!data.is_unsolicited());
        assert_eq!(data.meta.message_code, MessageCode::Ok);
    }

    #[test]
    fn unsolicited_component_envelope() {
        let raw = json!({
            "meta": {
                "componentID": 7,
                "messageCode": "HARDWAREERROR",
                "componentState": "UNAVAILABLE",
                "currentApplicationState": { "applicationStateCode": "AVAILABLE" },
            },
            "payload": {},
        });

        let data: PlatformData = serde_json::from_value(raw).expect("parse");
        assert!(data.is_unsolicited());
        assert_eq!(data.meta.component_id, Some(ComponentId::new(7)));
        assert_eq!(data.meta.component_state, Some(ComponentState::Unavailable));
        assert!(data.meta.message_code.is_critical());
    }

    #[test]
    fn unknown_codes_degrade_to_informational() {
        let raw = json!({
            "meta": { "messageCode": "SOMEFUTURECODE" },
        });

        let data: PlatformData = serde_json::from_value(raw).expect("parse");
        assert_eq!(data.meta.message_code, MessageCode::Unknown);
        assert!(!data.meta.message_code.is_critical());
    }

    #[test]
    fn critical_denylist_membership() {
        assert!(MessageCode::Cancelled.is_critical());
        assert!(MessageCode::OutOfSequence.is_critical());
        assert!(MessageCode::BaggageJammed.is_critical());
        assert!(!MessageCode::Ok.is_critical());
        assert!(!MessageCode::DataPresent.is_critical());
        assert!(!MessageCode::MediaPresent.is_critical());
    }

    #[test]
    fn component_list_descriptor_fields() {
        let raw = json!({
            "componentID": 2,
            "componentType": "MEDIA_OUTPUT",
            "componentCharacteristics": [{
                "deviceTypesList": ["PRINT"],
                "mediaTypesList": ["BAGGAGETAG"],
                "dsTypesList": ["DS_TYPES_ITPS"],
            }],
            "linkedComponentIDs": [3, 4],
        });

        let descriptor: ComponentDescriptor = serde_json::from_value(raw).expect("parse");
        assert_eq!(descriptor.component_id, ComponentId::new(2));
        assert_eq!(descriptor.component_type, Some(ComponentType::MediaOutput));
        let chars = descriptor.characteristics().expect("characteristics");
        assert_eq!(chars.device_types_list, vec![DeviceType::Print]);
        assert_eq!(chars.media_types_list, vec![MediaType::BaggageTag]);
        assert_eq!(
            descriptor.linked_component_ids,
            vec![ComponentId::new(3), ComponentId::new(4)]
        );
    }

    #[test]
    fn activation_defaults() {
        let activation: ApplicationActivation =
            serde_json::from_value(json!({})).expect("parse");
        assert_eq!(activation.execution_mode, ExecutionMode::Dsam);
        assert!(!activation.accessible_mode);
        assert_eq!(activation.language_id, None);

        let activation: ApplicationActivation = serde_json::from_value(json!({
            "executionMode": "MAM",
            "accessibleMode": true,
            "languageID": "fr-FR",
        }))
        .expect("parse");
        assert_eq!(activation.execution_mode, ExecutionMode::Mam);
        assert!(activation.accessible_mode);
        assert_eq!(activation.language_id.as_deref(), Some("fr-FR"));
    }
}
