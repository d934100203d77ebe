//! The dispatch engine and its event loop.
//!
//! All shared state (availability, offer arbitration, active assignment)
//! is owned by one task and mutated one event at a time, in arrival order.
//! Long-running operations — the claim round-trip, the toggle side-effect
//! sequence, the reconciliation fetch — run on spawned tasks and re-enter
//! the loop as completion events, so no handler ever blocks the loop.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::arbiter::{ClaimAttempt, OfferArbiter, OfferDisposition, RemovedFrom};
use crate::assignment::{AssignmentTracker, CancelOutcome};
use crate::availability::AvailabilityController;
use crate::backend::DispatchBackend;
use crate::channel::transport::{PushEvent, PushTransport};
use crate::channel::OfferChannel;
use crate::config::DispatchConfig;
use crate::engine::event::{EngineEvent, EngineNotice};
use crate::engine::snapshot::EngineSnapshot;
use crate::error::{ClaimError, EngineError, Error, Result, ToggleError};
use crate::location::LocationSink;
use crate::model::{AssignmentStage, Availability, ClaimOutcome, Offer};
use crate::reconcile::{spawn_reconcile, RemoteState};

const EVENT_QUEUE_DEPTH: usize = 256;
const NOTICE_QUEUE_DEPTH: usize = 64;

/// Cloneable handle for feeding user actions into the engine and observing
/// its state. This is the only public surface; the engine itself is moved
/// into its own task by [`Engine::run`].
#[derive(Clone)]
pub struct DispatchHandle {
    events_tx: mpsc::Sender<EngineEvent>,
    snapshot_rx: watch::Receiver<EngineSnapshot>,
    notice_tx: broadcast::Sender<EngineNotice>,
}

impl DispatchHandle {
    /// Toggle availability. Resolves once the side-effect sequence has
    /// settled; rejected locally with `InProgress` or `Debounced`.
    pub async fn toggle_availability(&self) -> Result<Availability> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineEvent::Toggle { respond: tx }).await?;
        match rx.await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(e)) => Err(Error::Toggle(e)),
            Err(_) => Err(Error::Engine(EngineError::Stopped)),
        }
    }

    /// Accept the decision-pending offer. Resolves with the final claim
    /// outcome; local rejections (`Expired`, `NotPending`) never reach the
    /// network.
    pub async fn accept(&self, offer_id: Uuid) -> Result<ClaimOutcome> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineEvent::Accept {
            offer_id,
            respond: tx,
        })
        .await?;
        match rx.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(Error::Claim(e)),
            Err(_) => Err(Error::Engine(EngineError::Stopped)),
        }
    }

    /// Decline an offer. Purely local; always succeeds once enqueued.
    pub async fn decline(&self, offer_id: Uuid) -> Result<()> {
        self.send(EngineEvent::Decline { offer_id }).await
    }

    /// Confirm the next assignment step (arrived at pickup, picked up,
    /// arrived at drop-off, dropped off).
    pub async fn advance_stage(&self) -> Result<AssignmentStage> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineEvent::AdvanceStage { respond: tx }).await?;
        match rx.await {
            Ok(Ok(stage)) => Ok(stage),
            Ok(Err(e)) => Err(Error::Assignment(e)),
            Err(_) => Err(Error::Engine(EngineError::Stopped)),
        }
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch snapshots published after every event-loop tick.
    pub fn snapshots(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Subscribe to collaborator notifications.
    pub fn notices(&self) -> broadcast::Receiver<EngineNotice> {
        self.notice_tx.subscribe()
    }

    /// Notifications as a stream.
    pub fn notice_stream(&self) -> BroadcastStream<EngineNotice> {
        BroadcastStream::new(self.notice_tx.subscribe())
    }

    /// Stop the engine after the events already queued are processed.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(EngineEvent::Shutdown).await
    }

    async fn send(&self, event: EngineEvent) -> Result<()> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| Error::Engine(EngineError::Stopped))
    }
}

/// The offer dispatch and acceptance engine.
pub struct Engine {
    config: DispatchConfig,
    backend: Arc<dyn DispatchBackend>,
    channel: OfferChannel,
    location: Arc<dyn LocationSink>,

    availability: AvailabilityController,
    arbiter: OfferArbiter,
    tracker: AssignmentTracker,

    events_tx: mpsc::Sender<EngineEvent>,
    events_rx: mpsc::Receiver<EngineEvent>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    notice_tx: broadcast::Sender<EngineNotice>,

    pending_toggle: Option<oneshot::Sender<std::result::Result<Availability, ToggleError>>>,
    /// True until the first reconciliation of this process completes.
    fresh_start: bool,
    reconcile_in_flight: bool,
    location_active: bool,
}

impl Engine {
    pub fn new(
        config: DispatchConfig,
        backend: Arc<dyn DispatchBackend>,
        transport: Arc<dyn PushTransport>,
        location: Arc<dyn LocationSink>,
    ) -> (Self, DispatchHandle) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot::default());
        let (notice_tx, _) = broadcast::channel(NOTICE_QUEUE_DEPTH);

        let channel = OfferChannel::new(transport, events_tx.clone(), &config);

        let handle = DispatchHandle {
            events_tx: events_tx.clone(),
            snapshot_rx,
            notice_tx: notice_tx.clone(),
        };

        let engine = Self {
            availability: AvailabilityController::new(config.toggle_debounce),
            arbiter: OfferArbiter::new(config.backlog_cap),
            tracker: AssignmentTracker::new(),
            config,
            backend,
            channel,
            location,
            events_tx,
            events_rx,
            snapshot_tx,
            notice_tx,
            pending_toggle: None,
            fresh_start: true,
            reconcile_in_flight: false,
            location_active: false,
        };

        (engine, handle)
    }

    /// Run the event loop until shutdown.
    pub async fn run(mut self) {
        info!(worker_id = %self.config.worker_id, "Dispatch engine starting");

        // Cold start: local state defers to the authority before anything
        // else happens.
        self.start_reconcile();

        while let Some(event) = self.events_rx.recv().await {
            let stop = matches!(event, EngineEvent::Shutdown);
            self.handle_event(event);
            self.publish_snapshot();
            if stop {
                break;
            }
        }

        self.channel.cancel();
        if self.location_active {
            self.location.on_became_inactive();
            self.location_active = false;
        }
        info!("Dispatch engine stopped");
    }

    // ── Event dispatch ──────────────────────────────────────────────

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Push(push) => self.handle_push(push),
            EngineEvent::Toggle { respond } => self.handle_toggle(respond),
            EngineEvent::Accept { offer_id, respond } => self.handle_accept(offer_id, respond),
            EngineEvent::Decline { offer_id } => self.handle_decline(offer_id),
            EngineEvent::AdvanceStage { respond } => self.handle_advance(respond),
            EngineEvent::ToggleResolved { target, error } => {
                self.handle_toggle_resolved(target, error)
            }
            EngineEvent::ClaimResolved { offer_id, outcome } => {
                self.handle_claim_resolved(offer_id, outcome)
            }
            EngineEvent::OfferExpired { offer_id } => self.handle_offer_expired(offer_id),
            EngineEvent::Reconnected { outage } => {
                info!(outage_ms = outage.as_millis() as u64, "Transport back after outage, reconciling");
                self.start_reconcile();
            }
            EngineEvent::ReconcileResolved { remote } => {
                self.reconcile_in_flight = false;
                self.apply_remote_state(remote);
            }
            EngineEvent::AuthExpired => self.handle_auth_expired(),
            EngineEvent::Shutdown => {}
        }
    }

    fn handle_push(&mut self, push: PushEvent) {
        match push {
            PushEvent::OfferCreated { offer } => {
                if !self.availability.is_online() {
                    debug!(offer_id = %offer.id, "Offer ignored while not online");
                    return;
                }
                match self.arbiter.offer_received(offer.clone(), Utc::now()) {
                    OfferDisposition::Pending => {
                        info!(offer_id = %offer.id, price = %offer.price, "Offer presented for decision");
                        self.arm_expiry(&offer);
                    }
                    OfferDisposition::Queued => {
                        debug!(offer_id = %offer.id, backlog = self.arbiter.backlog_len(), "Offer queued");
                    }
                    OfferDisposition::Dropped => {}
                }
            }
            PushEvent::OfferWithdrawn { offer_id } => {
                let (removed, attempt) = self.arbiter.remove(offer_id);
                answer_abandoned(attempt, offer_id);
                if removed == Some(RemovedFrom::Pending) {
                    info!(offer_id = %offer_id, "Pending offer withdrawn upstream");
                    self.notify(EngineNotice::OfferUnavailable { offer_id });
                    self.promote_next();
                } else if removed.is_some() {
                    debug!(offer_id = %offer_id, "Queued offer withdrawn upstream");
                }
            }
            PushEvent::AssignmentCancelled { assignment_id } => {
                self.handle_cancellation(assignment_id);
            }
        }
    }

    fn handle_toggle(
        &mut self,
        respond: oneshot::Sender<std::result::Result<Availability, ToggleError>>,
    ) {
        match self.availability.begin_toggle(Instant::now()) {
            Err(e) => {
                let _ = respond.send(Err(e));
            }
            Ok(Availability::Online) => {
                self.pending_toggle = Some(respond);
                // A new session must not inherit offers from the last one,
                // and the slate is wiped before the subscription opens so
                // nothing stale can be presented.
                self.drop_offer_state();
                self.start_toggle_side_effects(Availability::Online);
            }
            Ok(target) => {
                self.pending_toggle = Some(respond);
                // Close the subscription first: no late offer may reach a
                // worker who believes they are offline.
                self.channel.cancel();
                self.drop_offer_state();
                self.start_toggle_side_effects(target);
            }
        }
    }

    fn handle_accept(
        &mut self,
        offer_id: Uuid,
        respond: oneshot::Sender<std::result::Result<ClaimOutcome, ClaimError>>,
    ) {
        match self.arbiter.begin_claim(offer_id, Utc::now()) {
            Ok(offer) => {
                self.arbiter.record_claim(ClaimAttempt {
                    offer_id,
                    issued_at: Utc::now(),
                    respond: Some(respond),
                });
                self.start_claim(offer);
            }
            Err(e) => {
                if matches!(e, ClaimError::Expired(_)) {
                    self.promote_next();
                }
                let _ = respond.send(Err(e));
            }
        }
    }

    fn handle_decline(&mut self, offer_id: Uuid) {
        let (removed, attempt) = self.arbiter.remove(offer_id);
        answer_abandoned(attempt, offer_id);
        match removed {
            Some(from) => {
                debug!(offer_id = %offer_id, ?from, "Offer declined");
                self.spawn_log_decline(offer_id);
                self.promote_next();
            }
            None => {
                // Stale reference — the offer already resolved some other way.
                debug!(offer_id = %offer_id, "Decline for unknown offer ignored");
            }
        }
    }

    fn handle_advance(
        &mut self,
        respond: oneshot::Sender<std::result::Result<AssignmentStage, crate::error::AssignmentError>>,
    ) {
        match self.tracker.advance() {
            Ok(stage) => {
                if let Some(assignment) = self.tracker.active() {
                    self.spawn_persist_stage(assignment.id, stage);
                }
                if stage == AssignmentStage::Completed {
                    if let Some(done) = self.tracker.take_completed() {
                        info!(assignment_id = %done.id, "Assignment completed");
                        self.notify(EngineNotice::AssignmentCompleted {
                            assignment_id: done.id,
                            offer_id: done.offer_id,
                        });
                    }
                    self.sync_location();
                } else {
                    info!(stage = %stage, "Assignment advanced");
                }
                let _ = respond.send(Ok(stage));
            }
            Err(e) => {
                let _ = respond.send(Err(e));
            }
        }
    }

    fn handle_toggle_resolved(&mut self, target: Availability, error: Option<String>) {
        let success = error.is_none();
        self.availability
            .complete_toggle(Instant::now(), target, success);

        if self.availability.is_online() {
            // Offers become deliverable only once the loop itself is online;
            // nothing the channel delivers can land in a transient state.
            self.channel.subscribe(self.config.worker_id);
        }

        if let Some(msg) = &error {
            warn!(error = %msg, "Toggle side effects failed, converged to offline");
            self.channel.cancel();
            self.drop_offer_state();
        }

        self.sync_location();

        if let Some(respond) = self.pending_toggle.take() {
            let _ = respond.send(match error {
                None => Ok(self.availability.state()),
                Some(msg) => Err(ToggleError::Failed(msg)),
            });
        }
    }

    fn handle_claim_resolved(&mut self, offer_id: Uuid, outcome: ClaimOutcome) {
        let attempt = self.arbiter.take_claim(offer_id);
        let was_pending = self.arbiter.clear_pending(offer_id);

        match outcome {
            ClaimOutcome::Won(assignment) => {
                // The backend has committed the world to this outcome, so a
                // win is adopted even if local state stopped expecting it
                // (abandoned claim, force-toggle, decline race).
                info!(offer_id = %offer_id, assignment_id = %assignment.id, "Claim won");
                self.tracker.adopt(assignment.clone());
                if let Some(tx) = attempt.and_then(|a| a.respond) {
                    let _ = tx.send(Ok(ClaimOutcome::Won(assignment)));
                }
                self.sync_location();
            }
            other => {
                if attempt.is_some() || was_pending {
                    // Expected outcome, not a failure: someone else was
                    // faster, or the claim gave up.
                    info!(offer_id = %offer_id, "Offer no longer available");
                    self.notify(EngineNotice::OfferUnavailable { offer_id });
                } else {
                    debug!(offer_id = %offer_id, "Discarding late claim resolution");
                }
                if let Some(tx) = attempt.and_then(|a| a.respond) {
                    let _ = tx.send(Ok(other));
                }
            }
        }

        self.promote_next();
    }

    fn handle_offer_expired(&mut self, offer_id: Uuid) {
        if self.arbiter.expire(offer_id) {
            debug!(offer_id = %offer_id, "Decision-pending offer expired, retired silently");
            self.promote_next();
        }
    }

    fn handle_cancellation(&mut self, assignment_id: Uuid) {
        match self.tracker.cancel(assignment_id) {
            CancelOutcome::Cancelled(assignment) => {
                info!(assignment_id = %assignment.id, "Assignment cancelled upstream");
                self.sync_location();
                self.notify(EngineNotice::AssignmentCancelled { assignment_id });
            }
            CancelOutcome::AlreadyHandled => {
                debug!(assignment_id = %assignment_id, "Duplicate cancellation event ignored");
            }
            CancelOutcome::Unknown => {
                debug!(assignment_id = %assignment_id, "Cancellation for unknown assignment dropped");
            }
        }
    }

    fn handle_auth_expired(&mut self) {
        warn!("Authentication expired, forcing offline");
        self.channel.cancel();
        self.drop_offer_state();
        self.availability.force(Availability::Offline);
        self.sync_location();
        self.notify(EngineNotice::AuthExpired);
    }

    // ── Reconciliation ──────────────────────────────────────────────

    fn start_reconcile(&mut self) {
        if self.reconcile_in_flight {
            return;
        }
        self.reconcile_in_flight = true;
        spawn_reconcile(
            self.backend.clone(),
            self.config.worker_id,
            self.events_tx.clone(),
            self.config.reconcile_backoff,
        );
    }

    fn apply_remote_state(&mut self, remote: RemoteState) {
        // Assignments first. Remote always wins.
        let local_id = self.tracker.active().map(|a| a.id);
        match (local_id, remote.active_assignment) {
            (None, Some(assignment)) if assignment.is_active() => {
                info!(assignment_id = %assignment.id, "Adopting assignment found on backend");
                self.tracker.adopt(assignment);
            }
            (Some(local), Some(assignment)) => {
                if assignment.id == local && assignment.is_active() {
                    self.tracker.adopt(assignment);
                } else {
                    self.clear_orphaned_assignment();
                    if assignment.is_active() {
                        self.tracker.adopt(assignment);
                    }
                }
            }
            (Some(_), None) => self.clear_orphaned_assignment(),
            _ => {}
        }

        // Availability. A fresh process never silently resumes "available
        // for offers": the worker must take an explicit new action.
        if self.fresh_start {
            self.fresh_start = false;
            if remote.available {
                info!("Backend reports online on fresh start, forcing offline");
                self.spawn_force_unavailable();
            }
        } else {
            match (remote.available, self.availability.state()) {
                (false, Availability::Online) => {
                    warn!("Backend reports offline, deferring to remote");
                    self.channel.cancel();
                    self.drop_offer_state();
                    self.availability.force(Availability::Offline);
                }
                (true, Availability::Offline) => {
                    info!("Backend reports online, resuming subscription");
                    self.availability.force(Availability::Online);
                    self.channel.subscribe(self.config.worker_id);
                }
                _ => {}
            }
        }

        self.sync_location();
    }

    fn clear_orphaned_assignment(&mut self) {
        if let Some(cleared) = self.tracker.clear_as_cancelled() {
            info!(
                assignment_id = %cleared.id,
                "Backend no longer recognizes local assignment, treating as cancelled"
            );
            self.notify(EngineNotice::AssignmentCancelled {
                assignment_id: cleared.id,
            });
        }
    }

    // ── Spawned operations ──────────────────────────────────────────

    fn start_toggle_side_effects(&self, target: Availability) {
        let backend = self.backend.clone();
        let events_tx = self.events_tx.clone();
        let worker_id = self.config.worker_id;
        let timeout = self.config.toggle_timeout;
        let going_online = target == Availability::Online;

        tokio::spawn(async move {
            let result = tokio::time::timeout(
                timeout,
                backend.set_availability(worker_id, going_online),
            )
            .await;

            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("availability update timed out after {timeout:?}")),
            };

            let _ = events_tx
                .send(EngineEvent::ToggleResolved { target, error })
                .await;
        });
    }

    fn start_claim(&self, offer: Offer) {
        let backend = self.backend.clone();
        let events_tx = self.events_tx.clone();
        let worker_id = self.config.worker_id;
        let claim_timeout = self.config.claim_timeout;
        let max_attempts = self.config.max_claim_attempts;
        let offer_id = offer.id;

        tokio::spawn(async move {
            let mut outcome = ClaimOutcome::Failed(format!(
                "claim gave up after {max_attempts} attempts"
            ));

            for attempt in 1..=max_attempts {
                match tokio::time::timeout(
                    claim_timeout,
                    backend.attempt_claim(offer_id, worker_id),
                )
                .await
                {
                    Ok(Ok(resp)) => {
                        outcome = match (resp.claimed, resp.assignment) {
                            (true, Some(assignment)) => ClaimOutcome::Won(assignment),
                            (true, None) => {
                                ClaimOutcome::Failed("claim response missing assignment".into())
                            }
                            (false, _) => ClaimOutcome::LostRace,
                        };
                        break;
                    }
                    Ok(Err(e)) if e.is_fatal() => {
                        let _ = events_tx.send(EngineEvent::AuthExpired).await;
                        outcome = ClaimOutcome::Failed("authentication expired".into());
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(offer_id = %offer_id, attempt, error = %e, "Claim attempt failed");
                    }
                    Err(_) => {
                        warn!(offer_id = %offer_id, attempt, "Claim attempt timed out");
                    }
                }
            }

            let _ = events_tx
                .send(EngineEvent::ClaimResolved { offer_id, outcome })
                .await;
        });
    }

    /// Fire-and-forget stage persistence.
    fn spawn_persist_stage(&self, assignment_id: Uuid, stage: AssignmentStage) {
        let backend = self.backend.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.advance_assignment_stage(assignment_id, stage).await {
                warn!(assignment_id = %assignment_id, stage = %stage, error = %e, "Failed to persist stage advance");
            }
        });
    }

    /// Fire-and-forget decline signal.
    fn spawn_log_decline(&self, offer_id: Uuid) {
        let backend = self.backend.clone();
        let worker_id = self.config.worker_id;
        tokio::spawn(async move {
            if let Err(e) = backend.log_decline(offer_id, worker_id).await {
                debug!(offer_id = %offer_id, error = %e, "Failed to log decline");
            }
        });
    }

    /// The single `set_availability(false)` issued by cold-start safety.
    fn spawn_force_unavailable(&self) {
        let backend = self.backend.clone();
        let worker_id = self.config.worker_id;
        tokio::spawn(async move {
            if let Err(e) = backend.set_availability(worker_id, false).await {
                warn!(error = %e, "Failed to report forced offline state");
            }
        });
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn drop_offer_state(&mut self) {
        if let Some(attempt) = self.arbiter.clear() {
            answer_abandoned(Some(attempt), Uuid::nil());
        }
    }

    fn promote_next(&mut self) {
        if let Some(offer) = self.arbiter.promote(Utc::now()) {
            info!(offer_id = %offer.id, "Promoted backlog offer to decision slot");
            self.arm_expiry(&offer);
        }
    }

    fn arm_expiry(&self, offer: &Offer) {
        let events_tx = self.events_tx.clone();
        let offer_id = offer.id;
        let delay = (offer.expires_at - Utc::now()).to_std().unwrap_or_default();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(EngineEvent::OfferExpired { offer_id }).await;
        });
    }

    fn sync_location(&mut self) {
        let desired = self.availability.is_online() || self.tracker.has_active();
        if desired != self.location_active {
            self.location_active = desired;
            if desired {
                self.location.on_became_active();
            } else {
                self.location.on_became_inactive();
            }
        }
    }

    fn notify(&self, notice: EngineNotice) {
        let _ = self.notice_tx.send(notice);
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(EngineSnapshot {
            availability: self.availability.state(),
            decision_pending_offer: self.arbiter.pending().cloned(),
            backlog_size: self.arbiter.backlog_len(),
            active_assignment: self.tracker.active().cloned(),
        });
    }
}

/// Answer an abandoned claim attempt so the waiting accept() call resolves.
fn answer_abandoned(attempt: Option<ClaimAttempt>, offer_id: Uuid) {
    if let Some(attempt) = attempt {
        let id = if offer_id.is_nil() {
            attempt.offer_id
        } else {
            offer_id
        };
        if let Some(tx) = attempt.respond {
            let _ = tx.send(Err(ClaimError::NotPending(id)));
        }
    }
}
