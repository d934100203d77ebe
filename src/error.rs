//! Error types for the dispatch engine.
//!
//! Race losses are deliberately absent from this taxonomy: another worker
//! winning a claim is an expected outcome, modeled as
//! [`crate::model::ClaimOutcome::LostRace`], never as an error.

use std::time::Duration;

use uuid::Uuid;

use crate::model::AssignmentStage;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Toggle error: {0}")]
    Toggle(#[from] ToggleError),

    #[error("Claim error: {0}")]
    Claim(#[from] ClaimError),

    #[error("Assignment error: {0}")]
    Assignment(#[from] AssignmentError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Backend transport errors.
///
/// Everything here is retryable with backoff except `AuthExpired`, which is
/// fatal and propagates to forced sign-out outside this engine.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to decode backend response: {0}")]
    Decode(String),

    #[error("Authentication expired")]
    AuthExpired,
}

impl TransportError {
    /// Fatal errors must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthExpired)
    }
}

/// Availability toggle rejections and failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ToggleError {
    #[error("A toggle is already in flight")]
    InProgress,

    #[error("Toggled too soon after the previous toggle")]
    Debounced,

    #[error("Toggle side effects failed: {0}")]
    Failed(String),
}

/// Local claim rejections — returned before any network round-trip.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClaimError {
    #[error("Offer {0} is not the decision-pending offer")]
    NotPending(Uuid),

    #[error("Offer {0} has expired")]
    Expired(Uuid),

    #[error("A claim for offer {0} is already in flight")]
    InFlight(Uuid),
}

/// Assignment lifecycle errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("No active assignment")]
    NoActive,

    #[error("Cannot transition assignment from {from} to {to}")]
    InvalidTransition {
        from: AssignmentStage,
        to: AssignmentStage,
    },
}

/// Offer channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Subscription failed for worker {worker_id}: {reason}")]
    SubscribeFailed { worker_id: Uuid, reason: String },
}

/// Engine lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine event loop has stopped")]
    Stopped,
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
