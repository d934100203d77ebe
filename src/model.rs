//! Domain data model: offers, assignments, availability.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A geographic point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

/// A perishable job proposal broadcast to one or more eligible workers.
///
/// Immutable once received — never mutated locally, only superseded or
/// discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub origin: Coordinate,
    pub destination: Coordinate,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Offer {
    /// Whether the offer can no longer be claimed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Worker availability state.
///
/// `GoingOnline`/`GoingOffline` are transient, bounded-duration states
/// entered only while a toggle operation is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Offline,
    GoingOnline,
    Online,
    GoingOffline,
}

impl Availability {
    /// True while a toggle operation is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::GoingOnline | Self::GoingOffline)
    }
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offline => "offline",
            Self::GoingOnline => "going_online",
            Self::Online => "online",
            Self::GoingOffline => "going_offline",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle stage of a committed assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStage {
    Claimed,
    EnRouteToOrigin,
    AtOrigin,
    EnRouteToDestination,
    AtDestination,
    Completed,
    Cancelled,
}

impl AssignmentStage {
    /// Check if this stage allows transitioning to another stage.
    ///
    /// Stages advance strictly in order; `Cancelled` is reachable from any
    /// non-terminal stage via an upstream cancellation event.
    pub fn can_transition_to(&self, target: AssignmentStage) -> bool {
        use AssignmentStage::*;

        if target == Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, target),
            (Claimed, EnRouteToOrigin)
                | (EnRouteToOrigin, AtOrigin)
                | (AtOrigin, EnRouteToDestination)
                | (EnRouteToDestination, AtDestination)
                | (AtDestination, Completed)
        )
    }

    /// The stage reached by the next explicit worker action, if any.
    pub fn next(&self) -> Option<AssignmentStage> {
        use AssignmentStage::*;

        match self {
            Claimed => Some(EnRouteToOrigin),
            EnRouteToOrigin => Some(AtOrigin),
            AtOrigin => Some(EnRouteToDestination),
            EnRouteToDestination => Some(AtDestination),
            AtDestination => Some(Completed),
            Completed | Cancelled => None,
        }
    }

    /// Check if this is a terminal stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for AssignmentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Claimed => "claimed",
            Self::EnRouteToOrigin => "en_route_to_origin",
            Self::AtOrigin => "at_origin",
            Self::EnRouteToDestination => "en_route_to_destination",
            Self::AtDestination => "at_destination",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// The committed, in-progress job resulting from a won claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub worker_id: Uuid,
    pub stage: AssignmentStage,
}

impl Assignment {
    /// Whether the assignment still occupies the worker's active slot.
    pub fn is_active(&self) -> bool {
        !self.stage.is_terminal()
    }
}

/// Final outcome of a claim round-trip.
///
/// `LostRace` is the expected outcome when another worker's claim commits
/// first — it is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Won(Assignment),
    LostRace,
    Expired,
    Failed(String),
}
