//! Read-only state snapshots for the presentation layer.

use serde::Serialize;

use crate::model::{Assignment, Availability, Offer};

/// Published after every event-loop tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub availability: Availability,
    pub decision_pending_offer: Option<Offer>,
    pub backlog_size: usize,
    pub active_assignment: Option<Assignment>,
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self {
            availability: Availability::Offline,
            decision_pending_offer: None,
            backlog_size: 0,
            active_assignment: None,
        }
    }
}
