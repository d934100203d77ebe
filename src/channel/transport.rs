//! Push transport — long-polls the backend for worker-scoped events.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BackendConfig;
use crate::error::TransportError;
use crate::model::Offer;

/// Offer lifecycle and cancellation events pushed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    OfferCreated { offer: Offer },
    OfferWithdrawn { offer_id: Uuid },
    AssignmentCancelled { assignment_id: Uuid },
}

/// A push event with its position in the worker's event sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub cursor: u64,
    #[serde(flatten)]
    pub event: PushEvent,
}

/// Transport seam for the push channel.
///
/// `poll` blocks up to `timeout` waiting for events past `cursor` and may
/// return an empty batch. No delivery guarantee is made across a
/// disconnected window — reconnection is followed by a reconciliation read,
/// not a gap-fill replay.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn poll(
        &self,
        worker_id: Uuid,
        cursor: u64,
        timeout: Duration,
    ) -> Result<Vec<PushEnvelope>, TransportError>;
}

/// Long-polling HTTP transport.
pub struct HttpPushTransport {
    base_url: String,
    auth_token: SecretString,
    client: reqwest::Client,
}

impl HttpPushTransport {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            auth_token: config.auth_token.clone(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn poll(
        &self,
        worker_id: Uuid,
        cursor: u64,
        timeout: Duration,
    ) -> Result<Vec<PushEnvelope>, TransportError> {
        let url = format!(
            "{}/workers/{worker_id}/events?cursor={cursor}&timeout_secs={}",
            self.base_url,
            timeout.as_secs()
        );

        let resp = self
            .client
            .get(url)
            .bearer_auth(self.auth_token.expose_secret())
            // Leave headroom over the server-side long-poll window.
            .timeout(timeout + Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(timeout)
                } else {
                    TransportError::Http(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::AuthExpired);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<Vec<PushEnvelope>>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn push_event_wire_format() {
        let json = r#"{
            "cursor": 7,
            "type": "offer_withdrawn",
            "offer_id": "4a2d8e9c-0000-0000-0000-000000000001"
        }"#;
        let envelope: PushEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.cursor, 7);
        assert!(matches!(envelope.event, PushEvent::OfferWithdrawn { .. }));
    }

    #[test]
    fn offer_created_roundtrip() {
        let now = Utc::now();
        let envelope = PushEnvelope {
            cursor: 1,
            event: PushEvent::OfferCreated {
                offer: Offer {
                    id: Uuid::new_v4(),
                    origin: crate::model::Coordinate { lat: 1.0, lon: 2.0 },
                    destination: crate::model::Coordinate { lat: 3.0, lon: 4.0 },
                    price: dec!(8.00),
                    created_at: now,
                    expires_at: now + chrono::Duration::seconds(45),
                },
            },
        };

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"offer_created\""));
        let parsed: PushEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, envelope);
    }
}
