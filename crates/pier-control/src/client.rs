//! The [`ControlPlane`] seam and its HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ControlError;
use crate::types::{Assignment, PingRequest};

/// Default connection timeout for control-plane requests.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default overall timeout for control-plane requests.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Registration and deregistration with the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register (or re-register) the node and fetch its current assignment.
    async fn ping(&self, request: &PingRequest) -> Result<Assignment, ControlError>;

    /// Tell the control plane the node is going away.
    async fn shutdown(&self, secret: &str) -> Result<(), ControlError>;
}

#[derive(Serialize)]
struct StopRequest<'a> {
    secret: &'a str,
}

/// JSON-over-HTTP control-plane client.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    base_url: String,
    client: Client,
}

impl HttpControlPlane {
    /// Create a client with default timeouts.
    pub fn new(base_url: &str) -> Result<Self, ControlError> {
        Self::with_timeouts(base_url, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client with custom timeouts.
    pub fn with_timeouts(
        base_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ControlError> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ControlError::InvalidUrl(base_url.to_string()));
        }

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            base_url: base_url.to_string(),
            client,
        })
    }

    /// Base URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn ping(&self, request: &PingRequest) -> Result<Assignment, ControlError> {
        let url = format!("{}/ping", self.base_url);
        let response = self.client.post(&url).json(request).send().await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!("control plane refused node secret");
            return Err(ControlError::NotWanted);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(ControlError::NotWanted);
        }

        let assignment: Assignment =
            serde_json::from_slice(&body).map_err(|e| ControlError::Decode(e.to_string()))?;
        debug!(image_server = %assignment.image_server, "ping accepted");
        Ok(assignment)
    }

    async fn shutdown(&self, secret: &str) -> Result<(), ControlError> {
        let url = format!("{}/stop", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&StopRequest { secret })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
