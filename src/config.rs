//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;
use uuid::Uuid;

use crate::error::ConfigError;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Worker identity this engine instance acts for.
    pub worker_id: Uuid,
    /// Minimum cooldown between successful availability toggles.
    pub toggle_debounce: Duration,
    /// Hard bound on the toggle side-effect sequence.
    pub toggle_timeout: Duration,
    /// Hard bound on a single claim request.
    pub claim_timeout: Duration,
    /// Claim attempts before the claim is treated as lost.
    pub max_claim_attempts: u32,
    /// Initial reconnect backoff for the push channel.
    pub reconnect_backoff_base: Duration,
    /// Reconnect backoff cap.
    pub reconnect_backoff_cap: Duration,
    /// Outages longer than this trigger reconciliation on reconnect.
    pub reconnect_grace: Duration,
    /// Recent offer ids remembered for duplicate suppression.
    pub dedup_window: usize,
    /// Maximum offers queued behind the decision-pending slot.
    pub backlog_cap: usize,
    /// Long-poll timeout for the push transport.
    pub poll_timeout: Duration,
    /// Backoff between reconciliation fetch attempts.
    pub reconcile_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_id: Uuid::new_v4(),
            toggle_debounce: Duration::from_secs(3),
            toggle_timeout: Duration::from_secs(15),
            claim_timeout: Duration::from_secs(10),
            max_claim_attempts: 3,
            reconnect_backoff_base: Duration::from_secs(1),
            reconnect_backoff_cap: Duration::from_secs(30),
            reconnect_grace: Duration::from_secs(10),
            dedup_window: 256,
            backlog_cap: 32,
            poll_timeout: Duration::from_secs(25),
            reconcile_backoff: Duration::from_secs(2),
        }
    }
}

/// Connection settings for the dispatch backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the dispatch API, without a trailing slash.
    pub base_url: String,
    /// Bearer token for backend requests.
    pub auth_token: SecretString,
    /// Worker identity registered with the backend.
    pub worker_id: Uuid,
}

impl BackendConfig {
    /// Load from `DISPATCH_BASE_URL`, `DISPATCH_AUTH_TOKEN` and
    /// `DISPATCH_WORKER_ID`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("DISPATCH_BASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DISPATCH_BASE_URL".into()))?
            .trim_end_matches('/')
            .to_string();

        let auth_token = std::env::var("DISPATCH_AUTH_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("DISPATCH_AUTH_TOKEN".into()))?;

        let worker_id = std::env::var("DISPATCH_WORKER_ID")
            .map_err(|_| ConfigError::MissingEnvVar("DISPATCH_WORKER_ID".into()))?;
        let worker_id = worker_id
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "DISPATCH_WORKER_ID".into(),
                message: format!("not a UUID: {e}"),
            })?;

        Ok(Self {
            base_url,
            auth_token: SecretString::from(auth_token),
            worker_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_bounded() {
        let config = DispatchConfig::default();
        assert!(config.toggle_debounce < config.toggle_timeout);
        assert!(config.reconnect_backoff_base < config.reconnect_backoff_cap);
        assert!(config.max_claim_attempts >= 1);
        assert!(config.backlog_cap >= 1);
    }
}
