//! Backend authority abstraction.
//!
//! The backend is the sole authority for who wins a claim race: local state
//! is always a cache that defers to a fresh authoritative read on ambiguity.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::TransportError;
use crate::model::{Assignment, AssignmentStage};

pub use http::HttpBackend;
pub use memory::MemoryBackend;

/// Response to a conditional claim write.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClaimResponse {
    /// Whether the conditional write committed for this worker.
    pub claimed: bool,
    /// The created assignment, present iff `claimed` is true.
    pub assignment: Option<Assignment>,
}

/// Backend-agnostic dispatch API.
#[async_trait]
pub trait DispatchBackend: Send + Sync {
    /// Atomically bind `offer_id` to `worker_id` iff the offer is still
    /// pending and unbound. This conditional write is the linearization
    /// point for the whole acceptance protocol — `claimed: false` means
    /// another worker got there first.
    async fn attempt_claim(
        &self,
        offer_id: Uuid,
        worker_id: Uuid,
    ) -> Result<ClaimResponse, TransportError>;

    /// Report the worker's availability to the authority.
    async fn set_availability(&self, worker_id: Uuid, available: bool)
    -> Result<(), TransportError>;

    /// Authoritative availability read, used by reconciliation.
    async fn get_availability(&self, worker_id: Uuid) -> Result<bool, TransportError>;

    /// The worker's current non-terminal assignment, if any.
    async fn get_active_assignment(
        &self,
        worker_id: Uuid,
    ) -> Result<Option<Assignment>, TransportError>;

    /// Persist an explicit stage advance.
    async fn advance_assignment_stage(
        &self,
        assignment_id: Uuid,
        stage: AssignmentStage,
    ) -> Result<(), TransportError>;

    /// Best-effort decline signal. Failures are logged, never surfaced.
    async fn log_decline(&self, offer_id: Uuid, worker_id: Uuid) -> Result<(), TransportError>;
}
