//! Availability state machine.
//!
//! Owns the `Offline → GoingOnline → Online → GoingOffline → Offline` cycle.
//! Toggle side effects run outside the event loop; this controller only
//! tracks which transition is in flight and when the last one succeeded, so
//! toggles stay strictly sequential and debounced.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::ToggleError;
use crate::model::Availability;

#[derive(Debug)]
pub struct AvailabilityController {
    state: Availability,
    debounce: Duration,
    last_success_at: Option<Instant>,
}

impl AvailabilityController {
    pub fn new(debounce: Duration) -> Self {
        Self {
            state: Availability::Offline,
            debounce,
            last_success_at: None,
        }
    }

    pub fn state(&self) -> Availability {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == Availability::Online
    }

    /// Start a toggle. Returns the terminal state the toggle is driving
    /// toward; the controller enters the matching transient state.
    ///
    /// Rejected with `InProgress` while another toggle is in flight and with
    /// `Debounced` inside the cooldown window after the previous successful
    /// toggle — both are soft no-ops for the caller.
    pub fn begin_toggle(&mut self, now: Instant) -> Result<Availability, ToggleError> {
        if self.state.is_transitioning() {
            return Err(ToggleError::InProgress);
        }
        if let Some(last) = self.last_success_at {
            if now.duration_since(last) < self.debounce {
                return Err(ToggleError::Debounced);
            }
        }

        let target = match self.state {
            Availability::Offline => {
                self.state = Availability::GoingOnline;
                Availability::Online
            }
            Availability::Online => {
                self.state = Availability::GoingOffline;
                Availability::Offline
            }
            // Unreachable: transitioning states rejected above.
            other => return Err(ToggleError::Failed(format!("unexpected state {other}"))),
        };

        Ok(target)
    }

    /// Finish the in-flight toggle. A failed side-effect sequence converges
    /// to `Offline` — the controller never stays in a transient state.
    pub fn complete_toggle(&mut self, now: Instant, target: Availability, success: bool) {
        if !self.state.is_transitioning() {
            warn!(state = %self.state, "Toggle completion with no toggle in flight");
        }

        if success {
            self.state = target;
            self.last_success_at = Some(now);
        } else {
            self.state = Availability::Offline;
        }
    }

    /// Reconciliation override — remote state wins, no debounce applies.
    pub fn force(&mut self, state: Availability) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AvailabilityController {
        AvailabilityController::new(Duration::from_secs(3))
    }

    #[test]
    fn toggle_cycle() {
        let mut ctrl = controller();
        let t0 = Instant::now();

        let target = ctrl.begin_toggle(t0).unwrap();
        assert_eq!(target, Availability::Online);
        assert_eq!(ctrl.state(), Availability::GoingOnline);

        ctrl.complete_toggle(t0, target, true);
        assert_eq!(ctrl.state(), Availability::Online);

        let t1 = t0 + Duration::from_secs(5);
        let target = ctrl.begin_toggle(t1).unwrap();
        assert_eq!(target, Availability::Offline);
        assert_eq!(ctrl.state(), Availability::GoingOffline);

        ctrl.complete_toggle(t1, target, true);
        assert_eq!(ctrl.state(), Availability::Offline);
    }

    #[test]
    fn second_toggle_while_in_flight_is_rejected() {
        let mut ctrl = controller();
        let t0 = Instant::now();
        ctrl.begin_toggle(t0).unwrap();
        assert_eq!(ctrl.begin_toggle(t0), Err(ToggleError::InProgress));
    }

    #[test]
    fn toggle_within_cooldown_is_debounced() {
        let mut ctrl = controller();
        let t0 = Instant::now();
        let target = ctrl.begin_toggle(t0).unwrap();
        ctrl.complete_toggle(t0, target, true);

        assert_eq!(
            ctrl.begin_toggle(t0 + Duration::from_secs(1)),
            Err(ToggleError::Debounced)
        );
        // One state change happened, and only one.
        assert_eq!(ctrl.state(), Availability::Online);

        assert!(ctrl.begin_toggle(t0 + Duration::from_secs(4)).is_ok());
    }

    #[test]
    fn failed_toggle_converges_to_offline() {
        let mut ctrl = controller();
        let t0 = Instant::now();
        let target = ctrl.begin_toggle(t0).unwrap();
        ctrl.complete_toggle(t0, target, false);
        assert_eq!(ctrl.state(), Availability::Offline);

        // A failed toggle does not arm the debounce window.
        assert!(ctrl.begin_toggle(t0 + Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn force_overrides_without_debounce() {
        let mut ctrl = controller();
        ctrl.force(Availability::Online);
        assert!(ctrl.is_online());
        ctrl.force(Availability::Offline);
        assert_eq!(ctrl.state(), Availability::Offline);
    }
}
