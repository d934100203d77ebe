//! In-memory dispatch backend.
//!
//! Implements the same conditional-write claim semantics as the real
//! backend: the offer table mutation happens under one lock, so concurrent
//! claims against the same offer id see a genuine compare-and-swap. Used by
//! unit tests and local simulation; call recording makes side effects
//! observable.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::backend::{ClaimResponse, DispatchBackend};
use crate::error::TransportError;
use crate::model::{Assignment, AssignmentStage};

#[derive(Debug, Clone, PartialEq)]
enum OfferStatus {
    Pending,
    Assigned(Uuid),
}

#[derive(Default)]
struct MemoryState {
    offers: HashMap<Uuid, OfferStatus>,
    assignments: HashMap<Uuid, Assignment>,
    availability: HashMap<Uuid, bool>,
    availability_calls: Vec<(Uuid, bool)>,
    declines: Vec<(Uuid, Uuid)>,
    stage_calls: Vec<(Uuid, AssignmentStage)>,
    claim_calls: usize,
}

/// In-memory backend with atomic claim arbitration.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an offer as claimable.
    pub fn seed_offer(&self, offer_id: Uuid) {
        self.state
            .lock()
            .unwrap()
            .offers
            .insert(offer_id, OfferStatus::Pending);
    }

    /// Register an already-bound offer (another worker won it).
    pub fn seed_taken_offer(&self, offer_id: Uuid, winner: Uuid) {
        self.state
            .lock()
            .unwrap()
            .offers
            .insert(offer_id, OfferStatus::Assigned(winner));
    }

    /// Install an assignment as the worker's active one.
    pub fn seed_assignment(&self, assignment: Assignment) {
        let mut state = self.state.lock().unwrap();
        state
            .assignments
            .insert(assignment.worker_id, assignment);
    }

    /// Set the authoritative availability flag without recording a call.
    pub fn seed_availability(&self, worker_id: Uuid, available: bool) {
        self.state
            .lock()
            .unwrap()
            .availability
            .insert(worker_id, available);
    }

    /// All `set_availability` calls observed, in order.
    pub fn availability_calls(&self) -> Vec<(Uuid, bool)> {
        self.state.lock().unwrap().availability_calls.clone()
    }

    /// Number of `attempt_claim` calls observed.
    pub fn claim_calls(&self) -> usize {
        self.state.lock().unwrap().claim_calls
    }

    /// All declines logged, in order.
    pub fn declines(&self) -> Vec<(Uuid, Uuid)> {
        self.state.lock().unwrap().declines.clone()
    }

    /// All stage advances persisted, in order.
    pub fn stage_calls(&self) -> Vec<(Uuid, AssignmentStage)> {
        self.state.lock().unwrap().stage_calls.clone()
    }
}

#[async_trait]
impl DispatchBackend for MemoryBackend {
    async fn attempt_claim(
        &self,
        offer_id: Uuid,
        worker_id: Uuid,
    ) -> Result<ClaimResponse, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.claim_calls += 1;

        // The compare-and-swap: only a pending, unbound offer can be taken.
        match state.offers.get(&offer_id) {
            Some(OfferStatus::Pending) => {
                state.offers.insert(offer_id, OfferStatus::Assigned(worker_id));
                let assignment = Assignment {
                    id: Uuid::new_v4(),
                    offer_id,
                    worker_id,
                    stage: AssignmentStage::Claimed,
                };
                state.assignments.insert(worker_id, assignment.clone());
                Ok(ClaimResponse {
                    claimed: true,
                    assignment: Some(assignment),
                })
            }
            Some(OfferStatus::Assigned(_)) | None => Ok(ClaimResponse {
                claimed: false,
                assignment: None,
            }),
        }
    }

    async fn set_availability(
        &self,
        worker_id: Uuid,
        available: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.availability_calls.push((worker_id, available));
        state.availability.insert(worker_id, available);
        Ok(())
    }

    async fn get_availability(&self, worker_id: Uuid) -> Result<bool, TransportError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .availability
            .get(&worker_id)
            .copied()
            .unwrap_or(false))
    }

    async fn get_active_assignment(
        &self,
        worker_id: Uuid,
    ) -> Result<Option<Assignment>, TransportError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .assignments
            .get(&worker_id)
            .filter(|a| a.is_active())
            .cloned())
    }

    async fn advance_assignment_stage(
        &self,
        assignment_id: Uuid,
        stage: AssignmentStage,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.stage_calls.push((assignment_id, stage));
        for assignment in state.assignments.values_mut() {
            if assignment.id == assignment_id {
                assignment.stage = stage;
            }
        }
        Ok(())
    }

    async fn log_decline(&self, offer_id: Uuid, worker_id: Uuid) -> Result<(), TransportError> {
        self.state
            .lock()
            .unwrap()
            .declines
            .push((offer_id, worker_id));
        Ok(())
    }
}
