//! Authority API client for the agent.
//!
//! Provides the three calls the agent makes against the authority:
//! - Pulling the peers assigned to this host
//! - Pulling the networks this host advertises
//! - Reporting agent state

use std::time::Duration;

use async_trait::async_trait;
use dynroute_events::{
    AdvertiseNetworks, AgentStateReport, AssignedPeers, NetworkRef, PeerDescriptor,
    ReportStateAck, SyncRequest,
};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, error};

/// Authority client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to authority failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("authority returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// The authority does not offer this capability.
    #[error("authority does not support {0}")]
    Unsupported(&'static str),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Request(e) if e.is_timeout())
    }
}

/// The authority as seen by the agent.
#[async_trait]
pub trait Authority: Send + Sync {
    /// Peers bound to this agent's host.
    async fn get_assigned_peers(&self) -> Result<Vec<PeerDescriptor>, ClientError>;

    /// Prefixes this agent's host should advertise.
    async fn get_advertise_networks(&self) -> Result<Vec<NetworkRef>, ClientError>;

    /// Report agent state. `Unsupported` when the authority has reporting off.
    async fn report_state(&self, report: &AgentStateReport)
        -> Result<ReportStateAck, ClientError>;
}

/// HTTP client for the authority's agent-sync API.
pub struct AuthorityClient {
    client: reqwest::Client,
    base_url: String,
    host: String,
}

impl AuthorityClient {
    /// Create a client syncing as `host`. Every request is bounded by `timeout`.
    pub fn new(
        base_url: impl Into<String>,
        host: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url: String = base_url.into();

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            host: host.into(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/v1/agent-sync/{}", self.base_url, path);
        debug!(url = %url, "Calling authority");

        let response = self.client.post(&url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, path, "Authority request failed");
            return Err(ClientError::Status { status, body });
        }

        Ok(response.json().await?)
    }

    fn sync_request(&self) -> SyncRequest {
        SyncRequest {
            host: self.host.clone(),
        }
    }
}

#[async_trait]
impl Authority for AuthorityClient {
    async fn get_assigned_peers(&self) -> Result<Vec<PeerDescriptor>, ClientError> {
        let assigned: AssignedPeers = self.post("routingpeers", &self.sync_request()).await?;
        debug!(peers = assigned.routing_peers.len(), "Fetched assigned peers");
        Ok(assigned.routing_peers)
    }

    async fn get_advertise_networks(&self) -> Result<Vec<NetworkRef>, ClientError> {
        let advertised: AdvertiseNetworks =
            self.post("advertisenetworks", &self.sync_request()).await?;
        debug!(
            networks = advertised.networks.len(),
            "Fetched advertise networks"
        );
        Ok(advertised.networks)
    }

    async fn report_state(
        &self,
        report: &AgentStateReport,
    ) -> Result<ReportStateAck, ClientError> {
        match self.post("report-state", report).await {
            Err(ClientError::Status { status, .. })
                if status == StatusCode::NOT_IMPLEMENTED || status == StatusCode::NOT_FOUND =>
            {
                Err(ClientError::Unsupported("state reporting"))
            }
            other => other,
        }
    }
}
