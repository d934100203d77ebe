//! Active assignment lifecycle.
//!
//! At most one non-terminal assignment exists per worker at any time —
//! mirroring the backend invariant that at most one worker holds a
//! non-terminal assignment per offer. Stage transitions come from explicit
//! worker actions only, never inferred from location.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AssignmentError;
use crate::model::{Assignment, AssignmentStage};

/// Result of handling an upstream cancellation event.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The active assignment was cancelled; exactly one notification is due.
    Cancelled(Assignment),
    /// Redelivered cancellation for an assignment already cleared — no-op.
    AlreadyHandled,
    /// Id the tracker never knew about. Stale reference, dropped silently.
    Unknown,
}

pub struct AssignmentTracker {
    active: Option<Assignment>,
    /// Last assignment id cleared by a cancellation, kept for idempotency
    /// against redelivered cancellation events.
    last_cancelled: Option<Uuid>,
}

impl AssignmentTracker {
    pub fn new() -> Self {
        Self {
            active: None,
            last_cancelled: None,
        }
    }

    pub fn active(&self) -> Option<&Assignment> {
        self.active.as_ref()
    }

    pub fn has_active(&self) -> bool {
        self.active.as_ref().is_some_and(Assignment::is_active)
    }

    /// Install an assignment from a won claim or from reconciliation.
    ///
    /// A different assignment already in the slot is left in place; the
    /// backend would never commit two, so the conflict is deferred to the
    /// next reconciliation read.
    pub fn adopt(&mut self, assignment: Assignment) {
        match &self.active {
            Some(current) if current.id != assignment.id && current.is_active() => {
                warn!(
                    current = %current.id,
                    incoming = %assignment.id,
                    "Refusing to adopt a second active assignment"
                );
            }
            _ => {
                debug!(assignment_id = %assignment.id, stage = %assignment.stage, "Assignment adopted");
                self.active = Some(assignment);
            }
        }
    }

    /// Advance to the next stage on explicit worker action.
    pub fn advance(&mut self) -> Result<AssignmentStage, AssignmentError> {
        let assignment = self.active.as_mut().ok_or(AssignmentError::NoActive)?;

        let next = assignment
            .stage
            .next()
            .ok_or(AssignmentError::InvalidTransition {
                from: assignment.stage,
                to: assignment.stage,
            })?;

        assignment.stage = next;
        Ok(next)
    }

    /// Clear a completed assignment from the slot, returning it once.
    pub fn take_completed(&mut self) -> Option<Assignment> {
        if self
            .active
            .as_ref()
            .is_some_and(|a| a.stage == AssignmentStage::Completed)
        {
            self.active.take()
        } else {
            None
        }
    }

    /// Handle an upstream cancellation event. Idempotent: redelivered events
    /// for an already-cleared id produce `AlreadyHandled`, not a second
    /// transition.
    pub fn cancel(&mut self, assignment_id: Uuid) -> CancelOutcome {
        match &self.active {
            Some(current) if current.id == assignment_id => {
                let mut cancelled = self.active.take().expect("checked above");
                cancelled.stage = AssignmentStage::Cancelled;
                self.last_cancelled = Some(assignment_id);
                CancelOutcome::Cancelled(cancelled)
            }
            _ if self.last_cancelled == Some(assignment_id) => CancelOutcome::AlreadyHandled,
            _ => CancelOutcome::Unknown,
        }
    }

    /// Reconciliation found no remote counterpart — clear the local slot.
    pub fn clear_as_cancelled(&mut self) -> Option<Assignment> {
        let mut cleared = self.active.take()?;
        cleared.stage = AssignmentStage::Cancelled;
        self.last_cancelled = Some(cleared.id);
        Some(cleared)
    }
}

impl Default for AssignmentTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment() -> Assignment {
        Assignment {
            id: Uuid::new_v4(),
            offer_id: Uuid::new_v4(),
            worker_id: Uuid::new_v4(),
            stage: AssignmentStage::Claimed,
        }
    }

    #[test]
    fn advance_walks_the_ladder_to_completed() {
        let mut tracker = AssignmentTracker::new();
        tracker.adopt(assignment());

        let stages: Vec<_> = std::iter::from_fn(|| tracker.advance().ok()).collect();
        assert_eq!(
            stages,
            vec![
                AssignmentStage::EnRouteToOrigin,
                AssignmentStage::AtOrigin,
                AssignmentStage::EnRouteToDestination,
                AssignmentStage::AtDestination,
                AssignmentStage::Completed,
            ]
        );

        let completed = tracker.take_completed().unwrap();
        assert_eq!(completed.stage, AssignmentStage::Completed);
        assert!(tracker.active().is_none());
        // The slot only yields the completed assignment once.
        assert!(tracker.take_completed().is_none());
    }

    #[test]
    fn advance_without_assignment_fails() {
        let mut tracker = AssignmentTracker::new();
        assert_eq!(tracker.advance(), Err(AssignmentError::NoActive));
    }

    #[test]
    fn cancellation_is_idempotent() {
        let mut tracker = AssignmentTracker::new();
        let a = assignment();
        tracker.adopt(a.clone());

        assert!(matches!(tracker.cancel(a.id), CancelOutcome::Cancelled(_)));
        assert_eq!(tracker.cancel(a.id), CancelOutcome::AlreadyHandled);
        assert_eq!(tracker.cancel(a.id), CancelOutcome::AlreadyHandled);
    }

    #[test]
    fn unknown_cancellation_is_dropped() {
        let mut tracker = AssignmentTracker::new();
        tracker.adopt(assignment());
        assert_eq!(tracker.cancel(Uuid::new_v4()), CancelOutcome::Unknown);
        assert!(tracker.has_active());
    }

    #[test]
    fn second_active_assignment_is_refused() {
        let mut tracker = AssignmentTracker::new();
        let first = assignment();
        tracker.adopt(first.clone());
        tracker.adopt(assignment());
        assert_eq!(tracker.active().unwrap().id, first.id);
    }

    #[test]
    fn adopting_same_id_updates_stage() {
        let mut tracker = AssignmentTracker::new();
        let mut a = assignment();
        tracker.adopt(a.clone());

        // Remote wins: reconciliation may report a later stage.
        a.stage = AssignmentStage::AtOrigin;
        tracker.adopt(a.clone());
        assert_eq!(tracker.active().unwrap().stage, AssignmentStage::AtOrigin);
    }

    #[test]
    fn reconciliation_clear_counts_as_cancellation() {
        let mut tracker = AssignmentTracker::new();
        let a = assignment();
        tracker.adopt(a.clone());

        let cleared = tracker.clear_as_cancelled().unwrap();
        assert_eq!(cleared.stage, AssignmentStage::Cancelled);
        // A late push cancellation for the same id stays a no-op.
        assert_eq!(tracker.cancel(a.id), CancelOutcome::AlreadyHandled);
    }
}
