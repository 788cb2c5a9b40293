//! Thin REST client for the two backend calls the orchestrator makes.

use async_trait::async_trait;
use proctor_wire::{EntityId, StatusUpdate, WireError};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::pairing::{PairingError, PairingLinkRequest, PairingLinkSender};
use crate::status::{StatusError, StatusFetcher};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{endpoint} answered {status}")]
    Status { endpoint: String, status: u16 },
    #[error("api url {0} cannot carry a path")]
    InvalidBase(String),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Deserialize)]
struct EventStatusResponse {
    #[serde(alias = "event_id")]
    id: EntityId,
    status: i64,
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base: Url,
}

impl ApiClient {
    pub fn new(base: Url) -> Result<Self, ApiError> {
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidBase(base.to_string()));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidBase(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `GET {api}/events/{id}/status`
    pub async fn event_status(&self, id: &EntityId) -> Result<StatusUpdate, ApiError> {
        let url = self.endpoint(&["events", id.as_str(), "status"])?;
        debug!(target: "api", url = %url, "fetching event status");
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::Status {
                endpoint: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let body: EventStatusResponse = response.json().await?;
        Ok(StatusUpdate::from_code(body.id, body.status)?)
    }

    /// `POST {api}/sessions/{session}/pairing-link`
    pub async fn request_pairing_link(&self, request: &PairingLinkRequest) -> Result<(), ApiError> {
        let url = self.endpoint(&["sessions", &request.session_id, "pairing-link"])?;
        debug!(target: "api", url = %url, "requesting pairing link");
        let response = self.client.post(url.clone()).json(request).send().await?;
        if !response.status().is_success() {
            return Err(ApiError::Status {
                endpoint: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

impl From<ApiError> for StatusError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Wire(wire) => StatusError::Wire(wire),
            other => StatusError::Fetch(other.to_string()),
        }
    }
}

#[async_trait]
impl StatusFetcher for ApiClient {
    async fn fetch_status(&self, id: &EntityId) -> Result<StatusUpdate, StatusError> {
        Ok(self.event_status(id).await?)
    }
}

#[async_trait]
impl PairingLinkSender for ApiClient {
    async fn send_pairing_link(&self, request: &PairingLinkRequest) -> Result<(), PairingError> {
        self.request_pairing_link(request)
            .await
            .map_err(|err| PairingError::Link(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_joined_per_segment() {
        let client = ApiClient::new(Url::parse("http://127.0.0.1:8000/api/").unwrap()).unwrap();
        let url = client
            .endpoint(&["events", "a/b", "status"])
            .unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8000/api/events/a%2Fb/status");
    }

    #[test]
    fn status_body_accepts_numeric_ids() {
        let body: EventStatusResponse =
            serde_json::from_str(r#"{ "event_id": 12, "status": 2 }"#).unwrap();
        assert_eq!(body.id, EntityId::from("12"));
        assert_eq!(body.status, 2);
    }

    #[test]
    fn wire_errors_stay_typed_as_status_errors() {
        let err: StatusError = ApiError::Wire(WireError::UnknownStatusCode(9)).into();
        assert!(matches!(err, StatusError::Wire(WireError::UnknownStatusCode(9))));
    }
}
