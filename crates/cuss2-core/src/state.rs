// ── Application state tracking ──

use serde::{Deserialize, Serialize};

use cuss2_api::model::{ApplicationActivation, ApplicationState, ExecutionMode};

/// Language reported to the application when activation names none.
const DEFAULT_LANGUAGE: &str = "en-US";

/// One confirmed application-state transition.
///
/// `previous == current` only for the initial value, before the platform
/// has confirmed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub previous: ApplicationState,
    pub current: ApplicationState,
}

impl StateChange {
    /// Value before any platform confirmation.
    pub fn initial() -> Self {
        Self {
            previous: ApplicationState::Stopped,
            current: ApplicationState::Stopped,
        }
    }

    /// Advance to a newly confirmed state.
    pub fn advanced(self, next: ApplicationState) -> Self {
        Self {
            previous: self.current,
            current: next,
        }
    }
}

impl Default for StateChange {
    fn default() -> Self {
        Self::initial()
    }
}

// ── Activation snapshot ──────────────────────────────────────────────

/// Parameters the platform delivered with the latest `ACTIVE` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    /// Whether the platform hosts several applications (MAM mode).
    pub multi_tenant: bool,
    /// Whether the passenger asked for the accessible interface.
    pub accessible_mode: bool,
    /// BCP 47 language tag for the session.
    pub language: String,
}

impl From<&ApplicationActivation> for Activation {
    fn from(raw: &ApplicationActivation) -> Self {
        Self {
            multi_tenant: raw.execution_mode == ExecutionMode::Mam,
            accessible_mode: raw.accessible_mode,
            language: raw
                .language_id
                .clone()
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_owned()),
        }
    }
}
