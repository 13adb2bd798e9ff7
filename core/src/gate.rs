//! Localization gate.
//!
//! Publishing is only permitted while the device is localized. The gate also
//! remembers which map it was last localized against so a switch to a
//! different map can be surfaced to the session.

use crate::events::LocalizationEvent;
use crate::types::LocalizationState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateTransition {
    Unchanged,
    StateChanged {
        from: LocalizationState,
        to: LocalizationState,
    },
    /// Localized against a map different from the previously localized one.
    MapSwitched {
        previous: String,
        current: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct LocalizationGate {
    state: LocalizationState,
    map_id: Option<String>,
}

impl LocalizationGate {
    pub fn new(state: LocalizationState) -> Self {
        Self {
            state,
            map_id: None,
        }
    }

    pub fn is_localized(&self) -> bool {
        self.state == LocalizationState::Localized
    }

    pub fn state(&self) -> LocalizationState {
        self.state
    }

    /// Map id of the last successful localization.
    pub fn map_id(&self) -> Option<&str> {
        self.map_id.as_deref()
    }

    pub fn apply(&mut self, event: &LocalizationEvent) -> GateTransition {
        let from = self.state;
        self.state = event.state;

        if event.state == LocalizationState::Localized
            && let Some(current) = event.map_id.as_deref()
        {
            let previous = self.map_id.replace(current.to_string());
            if let Some(previous) = previous
                && previous != current
            {
                return GateTransition::MapSwitched {
                    previous,
                    current: current.to_string(),
                };
            }
        }

        if from == event.state {
            GateTransition::Unchanged
        } else {
            GateTransition::StateChanged {
                from,
                to: event.state,
            }
        }
    }

    /// Forget the remembered map. Used when the session itself requests a
    /// new localization and has already torn its state down.
    pub fn reset(&mut self) {
        self.state = LocalizationState::NotLocalized;
        self.map_id = None;
    }
}
