// ── Component arena ──
//
// Built once from the discovery list and treated as immutable: records
// are added or removed only by rebuilding. Printers keep the ids of
// their feeder and dispenser, and every aggregate is recomputed from
// arena lookups, so no record ever holds a copy of another's state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cuss2_api::model::{ComponentDescriptor, ComponentId, MessageCode};

use crate::classify::{DeviceClassifier, DeviceRole};
use crate::component::roles::{Announcement, CardReader, DataReader, Printer};
use crate::component::{Component, PrinterLinks, StateDelta};
use crate::error::CoreError;
use crate::session::Session;

/// Every component the platform reported at discovery, by id.
pub struct ComponentArena {
    components: BTreeMap<ComponentId, Arc<Component>>,
    /// Printer ids in ascending order, for aggregate refresh sweeps.
    printers: Vec<ComponentId>,
}

impl ComponentArena {
    /// Build records for a discovery list and resolve printer links.
    ///
    /// Fails when a printer's linked component list names no feeder or
    /// no dispenser; a printer that cannot aggregate is a deployment
    /// fault worth failing initialization over.
    pub(crate) fn build(
        descriptors: &[ComponentDescriptor],
        classifier: &dyn DeviceClassifier,
        session: &Session,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self, CoreError> {
        let mut components = BTreeMap::new();
        for descriptor in descriptors {
            let role = classifier.classify(descriptor);
            let component = Component::new(
                descriptor.clone(),
                role,
                session.clone(),
                poll_interval,
                cancel.clone(),
            );
            components.insert(descriptor.component_id, Arc::new(component));
        }

        let mut printers = Vec::new();
        for component in components.values() {
            if component.role().is_printer() {
                let links = resolve_links(component, &components)?;
                component.set_links(links);
                printers.push(component.id());
            }
        }

        Ok(Self {
            components,
            printers,
        })
    }

    // ── Lookup ───────────────────────────────────────────────────────

    pub fn get(&self, id: ComponentId) -> Option<Arc<Component>> {
        self.components.get(&id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Component>> {
        self.components.values()
    }

    pub fn ids(&self) -> Vec<ComponentId> {
        self.components.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Lowest-id component with the given role.
    pub fn first_of(&self, role: DeviceRole) -> Option<Arc<Component>> {
        self.components
            .values()
            .find(|c| c.role() == role)
            .cloned()
    }

    // ── Typed handles ────────────────────────────────────────────────

    /// Composite printer handle for a printer role.
    pub fn printer(&self, role: DeviceRole) -> Option<Printer> {
        if !role.is_printer() {
            return None;
        }
        let component = self.first_of(role)?;
        let links = *component.links()?;
        let feeder = self.get(links.feeder)?;
        let dispenser = self.get(links.dispenser)?;
        Some(Printer::new(component, feeder, dispenser))
    }

    /// Data-reader handle for a role that delivers `DATAPRESENT`
    /// records.
    pub fn reader(&self, role: DeviceRole) -> Option<DataReader> {
        if !role.reads_data() {
            return None;
        }
        self.first_of(role).map(DataReader::new)
    }

    pub fn card_reader(&self) -> Option<CardReader> {
        self.reader(DeviceRole::CardReader).map(CardReader::new)
    }

    pub fn announcement(&self) -> Option<Announcement> {
        self.first_of(DeviceRole::Announcement).map(Announcement::new)
    }

    // ── Aggregation ──────────────────────────────────────────────────

    /// Recompute the combined tracks of every printer whose triple
    /// contains `member`. Returns the printers whose aggregates moved.
    pub(crate) fn refresh_assemblies(
        &self,
        member: ComponentId,
    ) -> Vec<(ComponentId, StateDelta)> {
        let mut moved = Vec::new();
        for printer_id in &self.printers {
            let Some(printer) = self.components.get(printer_id) else {
                continue;
            };
            let Some(links) = printer.links().copied() else {
                continue;
            };
            if *printer_id != member && !links.contains(member) {
                continue;
            }
            if let Some(delta) = self.refresh_combined(printer, links) {
                if delta.any() {
                    moved.push((*printer_id, delta));
                }
            }
        }
        moved
    }

    fn refresh_combined(
        &self,
        printer: &Arc<Component>,
        links: PrinterLinks,
    ) -> Option<StateDelta> {
        let feeder = self.components.get(&links.feeder)?;
        let dispenser = self.components.get(&links.dispenser)?;

        let ready = printer.own_ready() && feeder.own_ready() && dispenser.own_ready();
        let status = [
            printer.own_status(),
            feeder.own_status(),
            dispenser.own_status(),
        ]
        .into_iter()
        .find(|code| *code != MessageCode::Ok)
        .unwrap_or(MessageCode::Ok);

        Some(printer.set_combined(ready, status))
    }

    /// Required components that are not ready, by their outward
    /// readiness (combined, for printers).
    pub(crate) fn unavailable_required(&self) -> Vec<ComponentId> {
        self.components
            .values()
            .filter(|c| c.required() && !c.ready())
            .map(|c| c.id())
            .collect()
    }

    /// Whether a later discovery list names exactly the ids this arena
    /// was built from.
    pub(crate) fn matches_list(&self, descriptors: &[ComponentDescriptor]) -> bool {
        let fresh: BTreeSet<ComponentId> =
            descriptors.iter().map(|d| d.component_id).collect();
        let known: BTreeSet<ComponentId> = self.components.keys().copied().collect();
        fresh == known
    }
}

impl std::fmt::Debug for ComponentArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentArena")
            .field("components", &self.ids())
            .field("printers", &self.printers)
            .finish()
    }
}

fn resolve_links(
    printer: &Arc<Component>,
    components: &BTreeMap<ComponentId, Arc<Component>>,
) -> Result<PrinterLinks, CoreError> {
    let mut feeder = None;
    let mut dispenser = None;

    for id in &printer.descriptor().linked_component_ids {
        let Some(role) = components.get(id).map(|c| c.role()) else {
            continue;
        };
        match role {
            DeviceRole::Feeder if feeder.is_none() => feeder = Some(*id),
            DeviceRole::Dispenser if dispenser.is_none() => dispenser = Some(*id),
            _ => {}
        }
    }

    Ok(PrinterLinks {
        feeder: feeder.ok_or(CoreError::LinkMissing {
            printer: printer.id(),
            missing: DeviceRole::Feeder,
        })?,
        dispenser: dispenser.ok_or(CoreError::LinkMissing {
            printer: printer.id(),
            missing: DeviceRole::Dispenser,
        })?,
    })
}

// ── Tests ────────────────────────────────────────────────────────────
