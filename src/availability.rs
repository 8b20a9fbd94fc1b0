use std::collections::HashMap;

use crate::error::ReadFailure;
use crate::field::FieldValue;

/// Consecutive missed updates after which an entity is unavailable
pub const UNAVAILABLE_THRESHOLD: u32 = 5;

/// What one coordinator tick meant for one entity
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    FieldPresent(FieldValue),
    FieldAbsent,
    ReadFailed(ReadFailure),
}

/// Recent read history of one entity.
///
/// A fresh state is available with no misses. The miss counter is reset by
/// any success and otherwise only grows, up to [`UNAVAILABLE_THRESHOLD`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityState {
    missed: u32,
    available: bool,
}

impl Default for AvailabilityState {
    fn default() -> Self {
        Self {
            missed: 0,
            available: true,
        }
    }
}

impl AvailabilityState {
    pub fn update(self, outcome: &TickOutcome) -> Self {
        match outcome {
            TickOutcome::FieldPresent(_) => Self::default(),
            // Absent fields and failed reads are not told apart here.
            TickOutcome::FieldAbsent | TickOutcome::ReadFailed(_) => {
                let missed = (self.missed + 1).min(UNAVAILABLE_THRESHOLD);
                Self {
                    missed,
                    available: missed < UNAVAILABLE_THRESHOLD,
                }
            }
        }
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn is_available(&self) -> bool {
        self.available
    }
}

/// Availability of every entity of one device, keyed by entity id
#[derive(Debug, Default)]
pub struct AvailabilityTracker {
    states: HashMap<String, AvailabilityState>,
}

impl AvailabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, entity_id: &str, outcome: &TickOutcome) -> AvailabilityState {
        let state = self.states.entry(entity_id.to_string()).or_default();
        *state = state.update(outcome);
        *state
    }

    pub fn get(&self, entity_id: &str) -> AvailabilityState {
        self.states.get(entity_id).copied().unwrap_or_default()
    }
}
