// ── Device classification ──
//
// The platform's component list describes capabilities, not roles: a
// bag-tag printer is "a MEDIA_OUTPUT whose first device type is PRINT
// and whose media types include BAGGAGETAG". This module condenses the
// capability heuristics into a closed set of roles the rest of the
// crate dispatches on.
//
// Classification is a trait so deployments with nonstandard descriptor
// quirks can substitute their own mapping.

use cuss2_api::model::{
    ComponentDescriptor, ComponentType, DataType, DeviceType, MediaType,
};

// ── DeviceRole ───────────────────────────────────────────────────────

/// Functional role of a platform component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DeviceRole {
    Announcement,
    Feeder,
    Dispenser,
    BagTagPrinter,
    BoardingPassPrinter,
    DocumentReader,
    BarcodeReader,
    CardReader,
    Keypad,
    FaceReader,
    Scale,
    Camera,
    Illumination,
    Headset,
    /// Descriptor matched no known heuristic. Still usable through the
    /// generic component operations.
    Unknown,
}

impl DeviceRole {
    /// Printers carry the feeder/dispenser link aggregation.
    pub fn is_printer(self) -> bool {
        matches!(self, Self::BagTagPrinter | Self::BoardingPassPrinter)
    }

    /// Roles that deliver passenger data through `DATAPRESENT` records.
    pub fn reads_data(self) -> bool {
        matches!(
            self,
            Self::DocumentReader
                | Self::BarcodeReader
                | Self::CardReader
                | Self::Keypad
                | Self::FaceReader
                | Self::Scale
                | Self::Camera
                | Self::Headset
        )
    }
}

// ── Classifier seam ──────────────────────────────────────────────────

/// Maps component descriptors to functional roles.
pub trait DeviceClassifier: Send + Sync + 'static {
    fn classify(&self, descriptor: &ComponentDescriptor) -> DeviceRole;
}

/// The standard capability heuristics.
///
/// Precedence follows the platform conventions: taxonomy-typed
/// components (announcement, feeder, dispenser) first, then printers,
/// then readers from most to least specific. First match wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardClassifier;

impl DeviceClassifier for StandardClassifier {
    fn classify(&self, descriptor: &ComponentDescriptor) -> DeviceRole {
        match descriptor.component_type {
            Some(ComponentType::Announcement) => return DeviceRole::Announcement,
            Some(ComponentType::Feeder) => return DeviceRole::Feeder,
            Some(ComponentType::Dispenser) => return DeviceRole::Dispenser,
            _ => {}
        }

        let Some(chars) = descriptor.characteristics() else {
            return DeviceRole::Unknown;
        };

        let first_device = chars.device_types_list.first().copied();
        let has_media = |m: MediaType| chars.media_types_list.contains(&m);
        let has_ds = |d: DataType| chars.ds_types_list.contains(&d);
        let typed = |t: ComponentType| descriptor.component_type == Some(t);

        if first_device == Some(DeviceType::Print) && has_media(MediaType::BaggageTag) {
            DeviceRole::BagTagPrinter
        } else if first_device == Some(DeviceType::Print)
            && has_media(MediaType::BoardingPass)
        {
            DeviceRole::BoardingPassPrinter
        } else if has_media(MediaType::Passport) {
            DeviceRole::DocumentReader
        } else if has_ds(DataType::Barcode) {
            DeviceRole::BarcodeReader
        } else if has_media(MediaType::MagCard) {
            DeviceRole::CardReader
        } else if has_ds(DataType::Key) && has_ds(DataType::KeyUp) && has_ds(DataType::KeyDown)
        {
            DeviceRole::Keypad
        } else if has_ds(DataType::Biometric) {
            DeviceRole::FaceReader
        } else if typed(ComponentType::DataInput)
            && first_device == Some(DeviceType::Scale)
            && has_media(MediaType::Baggage)
        {
            DeviceRole::Scale
        } else if typed(ComponentType::DataInput)
            && first_device == Some(DeviceType::Camera)
            && has_media(MediaType::Image)
        {
            DeviceRole::Camera
        } else if first_device == Some(DeviceType::Illumination) {
            DeviceRole::Illumination
        } else if typed(ComponentType::MediaInput)
            && first_device == Some(DeviceType::Assistive)
            && has_media(MediaType::Audio)
        {
            DeviceRole::Headset
        } else {
            DeviceRole::Unknown
        }
    }
}
