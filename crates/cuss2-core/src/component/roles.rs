// ── Typed peripheral handles ──
//
// Thin wrappers over arena records, one per role family. Each adds the
// operations that only make sense for its role and derefs to the
// underlying [`Component`] for the generic ones.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use cuss2_api::model::{DataRecord, DataType, Directive, PlatformData};

use crate::component::Component;
use crate::error::CoreError;

// ── Printer ──────────────────────────────────────────────────────────

/// Composite printer: the printing device plus its linked feeder and
/// dispenser. Readiness and status read as the aggregate of the triple.
#[derive(Clone)]
pub struct Printer {
    component: Arc<Component>,
    feeder: Arc<Component>,
    dispenser: Arc<Component>,
}

impl Printer {
    pub(crate) fn new(
        component: Arc<Component>,
        feeder: Arc<Component>,
        dispenser: Arc<Component>,
    ) -> Self {
        Self {
            component,
            feeder,
            dispenser,
        }
    }

    pub fn component(&self) -> &Arc<Component> {
        &self.component
    }

    pub fn feeder(&self) -> &Arc<Component> {
        &self.feeder
    }

    pub fn dispenser(&self) -> &Arc<Component> {
        &self.dispenser
    }

    /// Whether the dispenser holds media waiting to be taken.
    pub fn media_present(&self) -> bool {
        self.dispenser.media_present()
    }

    pub fn media_present_changes(&self) -> watch::Receiver<bool> {
        self.dispenser.media_present_changes()
    }

    /// Print one ITPS payload.
    ///
    /// A failed send leaves the device mid-job, so a cancel goes out
    /// before the failure surfaces; the cancel's own outcome never
    /// masks the print error.
    pub async fn print_raw(&self, data: impl Into<String>) -> Result<PlatformData, CoreError> {
        match self
            .component
            .send_records(vec![DataRecord::itps(data)])
            .await
        {
            Ok(reply) => Ok(reply),
            Err(e) => {
                if let Err(cancel_err) = self.component.cancel().await {
                    debug!(
                        component = %self.component.id(),
                        error = %cancel_err,
                        "Cancel after failed print also failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Push setup payloads (pectabs, templates) one record at a time,
    /// then print.
    pub async fn setup_and_print_raw<I, S>(
        &self,
        setup: I,
        data: impl Into<String>,
    ) -> Result<PlatformData, CoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let data = data.into();
        if data.is_empty() {
            return Err(CoreError::InvalidArgument {
                message: "print data must not be empty".into(),
            });
        }
        for record in setup {
            self.component.setup(vec![DataRecord::itps(record)]).await?;
        }
        self.print_raw(data).await
    }
}

impl Deref for Printer {
    type Target = Component;

    fn deref(&self) -> &Self::Target {
        &self.component
    }
}

// ── DataReader ───────────────────────────────────────────────────────

/// A component that delivers passenger data through `DATAPRESENT`
/// records (barcode, document, card, keypad, biometric, scale, camera).
#[derive(Clone)]
pub struct DataReader {
    component: Arc<Component>,
}

impl DataReader {
    pub(crate) fn new(component: Arc<Component>) -> Self {
        Self { component }
    }

    pub fn component(&self) -> &Arc<Component> {
        &self.component
    }

    /// Enable the device, wait for one batch of data records, and
    /// disable it again.
    ///
    /// The device is disabled exactly once on every exit path, whether
    /// the read produced records, timed out, or the enable itself
    /// failed. The data subscription opens before the enable goes out,
    /// so a record arriving while the enable reply is in flight cannot
    /// be lost.
    pub async fn read(&self, timeout: Duration) -> Result<Vec<DataRecord>, CoreError> {
        let mut records = self.component.data_records();

        let outcome = match self.component.enable().await {
            Err(e) => Err(e),
            Ok(_reply) => {
                match tokio::time::timeout(timeout, recv_records(&mut records)).await {
                    Err(_elapsed) => Err(CoreError::ReadTimeout {
                        component: self.component.id(),
                        timeout,
                    }),
                    Ok(received) => received,
                }
            }
        };

        if let Err(e) = self.component.disable().await {
            debug!(
                component = %self.component.id(),
                error = %e,
                "Disable after read failed"
            );
        }

        outcome
    }
}

impl Deref for DataReader {
    type Target = Component;

    fn deref(&self) -> &Self::Target {
        &self.component
    }
}

async fn recv_records(
    rx: &mut broadcast::Receiver<Vec<DataRecord>>,
) -> Result<Vec<DataRecord>, CoreError> {
    loop {
        match rx.recv().await {
            Ok(records) => return Ok(records),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Data record subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Err(CoreError::Disconnected),
        }
    }
}

// ── CardReader ───────────────────────────────────────────────────────

/// Magnetic-stripe reader. Reads FOID data by default; the payment
/// filter swaps the accepted data type for one transaction.
#[derive(Clone)]
pub struct CardReader {
    reader: DataReader,
}

impl CardReader {
    pub(crate) fn new(reader: DataReader) -> Self {
        Self { reader }
    }

    /// Swap the accepted data-type filter between payment and FOID.
    pub async fn enable_payment(&self, enabled: bool) -> Result<(), CoreError> {
        let filter = if enabled {
            DataType::PaymentIso
        } else {
            DataType::FoidIso
        };
        self.reader
            .component
            .setup(vec![DataRecord::new("", vec![filter])])
            .await?;
        Ok(())
    }

    /// One payment read: engage the payment filter, read, and restore
    /// the FOID filter whatever the read's outcome.
    pub async fn read_payment(&self, timeout: Duration) -> Result<Vec<DataRecord>, CoreError> {
        self.enable_payment(true).await?;
        let outcome = self.reader.read(timeout).await;
        if let Err(e) = self.enable_payment(false).await {
            warn!(
                component = %self.reader.component.id(),
                error = %e,
                "Restoring the FOID filter failed"
            );
        }
        outcome
    }
}

impl Deref for CardReader {
    type Target = DataReader;

    fn deref(&self) -> &Self::Target {
        &self.reader
    }
}

// ── Announcement ─────────────────────────────────────────────────────

/// Text-to-speech output.
#[derive(Clone)]
pub struct Announcement {
    component: Arc<Component>,
}

impl Announcement {
    pub(crate) fn new(component: Arc<Component>) -> Self {
        Self { component }
    }

    pub fn component(&self) -> &Arc<Component> {
        &self.component
    }

    /// Speak plain text by wrapping it in an SSML document.
    pub async fn say(&self, text: &str, language: &str) -> Result<PlatformData, CoreError> {
        self.play(ssml_document(text, language)).await
    }

    /// Play a complete SSML document.
    pub async fn play(&self, ssml: impl Into<String>) -> Result<PlatformData, CoreError> {
        self.component
            .command_with_records(
                Directive::PeripheralsAnnouncementPlay,
                vec![DataRecord::new(ssml, vec![DataType::Ssml])],
            )
            .await
    }

    pub async fn pause(&self) -> Result<PlatformData, CoreError> {
        self.component
            .command(Directive::PeripheralsAnnouncementPause)
            .await
    }

    pub async fn resume(&self) -> Result<PlatformData, CoreError> {
        self.component
            .command(Directive::PeripheralsAnnouncementResume)
            .await
    }

    pub async fn stop(&self) -> Result<PlatformData, CoreError> {
        self.component
            .command(Directive::PeripheralsAnnouncementStop)
            .await
    }
}

impl Deref for Announcement {
    type Target = Component;

    fn deref(&self) -> &Self::Target {
        &self.component
    }
}

fn ssml_document(text: &str, language: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<speak version="1.0" xmlns="http://www.w3.org/2001/10/synthesis""#,
            r#" xml:lang="{language}">{text}</speak>"#,
        ),
        language = language,
        text = text,
    )
}
