//! Reconciliation — force local state to match the backend authority.
//!
//! Runs at cold start and after any transport outage longer than the grace
//! window. The fetch retries with backoff until it succeeds; the resulting
//! remote state re-enters the event loop as a single event, where the
//! engine applies the remote-always-wins rules.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::DispatchBackend;
use crate::engine::event::EngineEvent;
use crate::model::Assignment;

/// Authoritative worker state as reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteState {
    pub available: bool,
    pub active_assignment: Option<Assignment>,
}

/// Fetch authoritative state, retrying with backoff until it succeeds, then
/// feed it back into the event loop.
pub fn spawn_reconcile(
    backend: Arc<dyn DispatchBackend>,
    worker_id: Uuid,
    events_tx: mpsc::Sender<EngineEvent>,
    backoff: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delay = backoff;

        loop {
            let fetch = futures::future::try_join(
                backend.get_availability(worker_id),
                backend.get_active_assignment(worker_id),
            )
            .await;

            match fetch {
                Ok((available, active_assignment)) => {
                    info!(
                        available,
                        has_assignment = active_assignment.is_some(),
                        "Fetched authoritative worker state"
                    );
                    let _ = events_tx
                        .send(EngineEvent::ReconcileResolved {
                            remote: RemoteState {
                                available,
                                active_assignment,
                            },
                        })
                        .await;
                    return;
                }
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "Reconciliation hit expired authentication");
                    let _ = events_tx.send(EngineEvent::AuthExpired).await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Reconciliation fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::model::AssignmentStage;

    #[tokio::test]
    async fn reconcile_reports_remote_state() {
        let backend = Arc::new(MemoryBackend::new());
        let worker_id = Uuid::new_v4();
        backend.seed_availability(worker_id, true);
        backend.seed_assignment(Assignment {
            id: Uuid::new_v4(),
            offer_id: Uuid::new_v4(),
            worker_id,
            stage: AssignmentStage::AtOrigin,
        });

        let (tx, mut rx) = mpsc::channel(4);
        spawn_reconcile(backend, worker_id, tx, Duration::from_millis(5));

        match rx.recv().await.unwrap() {
            EngineEvent::ReconcileResolved { remote } => {
                assert!(remote.available);
                assert_eq!(
                    remote.active_assignment.unwrap().stage,
                    AssignmentStage::AtOrigin
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconcile_defaults_for_unknown_worker() {
        let backend = Arc::new(MemoryBackend::new());
        let (tx, mut rx) = mpsc::channel(4);
        spawn_reconcile(backend, Uuid::new_v4(), tx, Duration::from_millis(5));

        match rx.recv().await.unwrap() {
            EngineEvent::ReconcileResolved { remote } => {
                assert!(!remote.available);
                assert!(remote.active_assignment.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
