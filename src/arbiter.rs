//! Offer arbitration — single decision slot plus FIFO backlog.
//!
//! Only one offer is ever presented for decision at a time. Offers arriving
//! while a decision is pending queue behind it; resolution of the current
//! offer (accept, decline, withdrawal, expiry) promotes the next live
//! backlog entry. The arbiter holds no IO — the event loop drives it and
//! spawns the actual claim round-trips.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::ClaimError;
use crate::model::{ClaimOutcome, Offer};

/// Ids of retired offers remembered so a late `accept()` can be answered
/// with `Expired` instead of a confusing "not pending".
const EXPIRED_MEMORY: usize = 32;

/// A claim round-trip in flight against the backend.
///
/// Exists only for the duration of the round-trip; never persisted.
pub struct ClaimAttempt {
    pub offer_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub respond: Option<oneshot::Sender<Result<ClaimOutcome, ClaimError>>>,
}

/// Where an incoming offer ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    /// Became the decision-pending offer.
    Pending,
    /// Queued behind the current decision.
    Queued,
    /// Expired, duplicate, or backlog full.
    Dropped,
}

/// What a removal hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovedFrom {
    Pending,
    Backlog,
}

pub struct OfferArbiter {
    pending: Option<Offer>,
    backlog: VecDeque<Offer>,
    backlog_cap: usize,
    claim: Option<ClaimAttempt>,
    recently_expired: VecDeque<Uuid>,
}

impl OfferArbiter {
    pub fn new(backlog_cap: usize) -> Self {
        Self {
            pending: None,
            backlog: VecDeque::new(),
            backlog_cap,
            claim: None,
            recently_expired: VecDeque::new(),
        }
    }

    pub fn pending(&self) -> Option<&Offer> {
        self.pending.as_ref()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn claim_in_flight(&self) -> bool {
        self.claim.is_some()
    }

    /// Route a newly delivered offer.
    pub fn offer_received(&mut self, offer: Offer, now: DateTime<Utc>) -> OfferDisposition {
        if offer.is_expired(now) {
            debug!(offer_id = %offer.id, "Dropping already-expired offer");
            return OfferDisposition::Dropped;
        }

        let duplicate = self.pending.as_ref().is_some_and(|p| p.id == offer.id)
            || self.backlog.iter().any(|queued| queued.id == offer.id);
        if duplicate {
            return OfferDisposition::Dropped;
        }

        if self.pending.is_none() {
            self.pending = Some(offer);
            OfferDisposition::Pending
        } else if self.backlog.len() >= self.backlog_cap {
            debug!(offer_id = %offer.id, "Backlog full, dropping offer");
            OfferDisposition::Dropped
        } else {
            self.backlog.push_back(offer);
            OfferDisposition::Queued
        }
    }

    /// Validate an accept locally before any network round-trip.
    ///
    /// An expired decision-pending offer is retired here and the accept
    /// fails with `Expired` without ever reaching the backend.
    pub fn begin_claim(&mut self, offer_id: Uuid, now: DateTime<Utc>) -> Result<Offer, ClaimError> {
        if let Some(attempt) = &self.claim {
            return Err(ClaimError::InFlight(attempt.offer_id));
        }

        match &self.pending {
            Some(offer) if offer.id == offer_id => {
                if offer.is_expired(now) {
                    self.retire_pending();
                    return Err(ClaimError::Expired(offer_id));
                }
                Ok(offer.clone())
            }
            _ if self.recently_expired.contains(&offer_id) => Err(ClaimError::Expired(offer_id)),
            _ => Err(ClaimError::NotPending(offer_id)),
        }
    }

    /// Record the claim round-trip started for the pending offer.
    pub fn record_claim(&mut self, attempt: ClaimAttempt) {
        self.claim = Some(attempt);
    }

    /// Take the in-flight claim if it refers to `offer_id`.
    pub fn take_claim(&mut self, offer_id: Uuid) -> Option<ClaimAttempt> {
        if self.claim.as_ref().is_some_and(|c| c.offer_id == offer_id) {
            self.claim.take()
        } else {
            None
        }
    }

    /// Clear the decision slot if it holds `offer_id`.
    pub fn clear_pending(&mut self, offer_id: Uuid) -> bool {
        if self.pending.as_ref().is_some_and(|p| p.id == offer_id) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// Remove an offer wherever it sits (decline or upstream withdrawal).
    ///
    /// A claim in flight for the removed offer is abandoned; its attempt is
    /// returned so the caller can answer the waiting accept.
    pub fn remove(&mut self, offer_id: Uuid) -> (Option<RemovedFrom>, Option<ClaimAttempt>) {
        let attempt = self.take_claim(offer_id);

        if self.clear_pending(offer_id) {
            return (Some(RemovedFrom::Pending), attempt);
        }

        let before = self.backlog.len();
        self.backlog.retain(|offer| offer.id != offer_id);
        if self.backlog.len() < before {
            (Some(RemovedFrom::Backlog), attempt)
        } else {
            (None, attempt)
        }
    }

    /// Silently retire the decision-pending offer on expiry.
    ///
    /// No-op while a claim is in flight for it — the claim resolution path
    /// owns the slot in that case.
    pub fn expire(&mut self, offer_id: Uuid) -> bool {
        if self.claim.as_ref().is_some_and(|c| c.offer_id == offer_id) {
            return false;
        }
        if self.pending.as_ref().is_some_and(|p| p.id == offer_id) {
            self.retire_pending();
            true
        } else {
            false
        }
    }

    /// Fill an empty decision slot from the backlog, skipping entries that
    /// expired while queued. Returns the newly pending offer for expiry
    /// timer arming.
    pub fn promote(&mut self, now: DateTime<Utc>) -> Option<Offer> {
        if self.pending.is_some() {
            return None;
        }
        while let Some(next) = self.backlog.pop_front() {
            if next.is_expired(now) {
                self.remember_expired(next.id);
                continue;
            }
            self.pending = Some(next.clone());
            return Some(next);
        }
        None
    }

    /// Drop all offer state, abandoning any claim in flight.
    ///
    /// Used when the session ends (going offline) and when a new session
    /// starts and must not inherit stale offers.
    pub fn clear(&mut self) -> Option<ClaimAttempt> {
        self.pending = None;
        self.backlog.clear();
        self.claim.take()
    }

    fn retire_pending(&mut self) {
        if let Some(offer) = self.pending.take() {
            self.remember_expired(offer.id);
        }
    }

    fn remember_expired(&mut self, offer_id: Uuid) {
        self.recently_expired.push_back(offer_id);
        while self.recently_expired.len() > EXPIRED_MEMORY {
            self.recently_expired.pop_front();
        }
    }
}
