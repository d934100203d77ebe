//! HTTP dispatch backend — JSON over the backend REST API.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::backend::{ClaimResponse, DispatchBackend};
use crate::config::BackendConfig;
use crate::error::TransportError;
use crate::model::{Assignment, AssignmentStage};

/// Dispatch backend speaking JSON over HTTP with bearer auth.
pub struct HttpBackend {
    base_url: String,
    auth_token: SecretString,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            auth_token: config.auth_token.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Map a response to `TransportError` unless it is a success.
    ///
    /// A 401 becomes `AuthExpired` so callers can stop retrying.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::AuthExpired);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, TransportError> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(self.auth_token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Self::check(resp).await
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, TransportError> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(self.auth_token.expose_secret())
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Self::check(resp).await
    }
}

#[async_trait]
impl DispatchBackend for HttpBackend {
    async fn attempt_claim(
        &self,
        offer_id: Uuid,
        worker_id: Uuid,
    ) -> Result<ClaimResponse, TransportError> {
        let body = serde_json::json!({ "worker_id": worker_id });
        let resp = self
            .post_json(&format!("/offers/{offer_id}/claim"), &body)
            .await?;
        resp.json::<ClaimResponse>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn set_availability(
        &self,
        worker_id: Uuid,
        available: bool,
    ) -> Result<(), TransportError> {
        let body = serde_json::json!({ "available": available });
        self.post_json(&format!("/workers/{worker_id}/availability"), &body)
            .await?;
        Ok(())
    }

    async fn get_availability(&self, worker_id: Uuid) -> Result<bool, TransportError> {
        #[derive(serde::Deserialize)]
        struct AvailabilityResponse {
            available: bool,
        }

        let resp = self
            .get(&format!("/workers/{worker_id}/availability"))
            .await?;
        let parsed: AvailabilityResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(parsed.available)
    }

    async fn get_active_assignment(
        &self,
        worker_id: Uuid,
    ) -> Result<Option<Assignment>, TransportError> {
        let resp = self.get(&format!("/workers/{worker_id}/assignment")).await?;
        resp.json::<Option<Assignment>>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn advance_assignment_stage(
        &self,
        assignment_id: Uuid,
        stage: AssignmentStage,
    ) -> Result<(), TransportError> {
        let body = serde_json::json!({ "stage": stage });
        self.post_json(&format!("/assignments/{assignment_id}/stage"), &body)
            .await?;
        Ok(())
    }

    async fn log_decline(&self, offer_id: Uuid, worker_id: Uuid) -> Result<(), TransportError> {
        let body = serde_json::json!({ "worker_id": worker_id });
        self.post_json(&format!("/offers/{offer_id}/decline"), &body)
            .await?;
        Ok(())
    }
}
