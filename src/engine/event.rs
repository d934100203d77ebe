//! Events flowing through the dispatch loop.
//!
//! Every mutation of shared state arrives here: push events, user actions,
//! timers, and the completions of operations that ran outside the loop.
//! Events are processed strictly one at a time in arrival order.

use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::channel::transport::PushEvent;
use crate::error::{AssignmentError, ClaimError, ToggleError};
use crate::model::{AssignmentStage, Availability, ClaimOutcome};
use crate::reconcile::RemoteState;

/// An event entering the dispatch loop.
#[derive(Debug)]
pub enum EngineEvent {
    /// Event delivered by the push channel.
    Push(PushEvent),

    /// User toggles availability. Answered once the side-effect sequence
    /// resolves, or immediately on a local rejection.
    Toggle {
        respond: oneshot::Sender<Result<Availability, ToggleError>>,
    },

    /// User accepts the decision-pending offer. Answered with the final
    /// claim outcome, or immediately on a local rejection.
    Accept {
        offer_id: Uuid,
        respond: oneshot::Sender<Result<ClaimOutcome, ClaimError>>,
    },

    /// User declines an offer. Purely local, always succeeds.
    Decline { offer_id: Uuid },

    /// Explicit worker action advancing the active assignment.
    AdvanceStage {
        respond: oneshot::Sender<Result<AssignmentStage, AssignmentError>>,
    },

    /// Toggle side-effect sequence finished outside the loop.
    ToggleResolved {
        target: Availability,
        error: Option<String>,
    },

    /// Claim round-trip finished outside the loop.
    ClaimResolved {
        offer_id: Uuid,
        outcome: ClaimOutcome,
    },

    /// Expiry timer fired for an offer.
    OfferExpired { offer_id: Uuid },

    /// Push transport recovered after an outage long enough to need
    /// reconciliation.
    Reconnected { outage: Duration },

    /// Reconciliation fetched authoritative remote state.
    ReconcileResolved { remote: RemoteState },

    /// The backend rejected our credentials. Fatal for this session.
    AuthExpired,

    /// Stop the loop.
    Shutdown,
}

/// Notifications fanned out to collaborators.
///
/// `AssignmentCompleted` and `AssignmentCancelled` are emitted exactly once
/// per assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotice {
    /// The decision-pending offer went away without the worker winning it
    /// (race lost, withdrawn, or claim given up). Neutral — not a failure.
    OfferUnavailable { offer_id: Uuid },

    /// A job finished; the earnings collaborator consumes this.
    AssignmentCompleted {
        assignment_id: Uuid,
        offer_id: Uuid,
    },

    /// The backend withdrew the active assignment.
    AssignmentCancelled { assignment_id: Uuid },

    /// Session credentials expired; the host application must sign out.
    AuthExpired,
}
