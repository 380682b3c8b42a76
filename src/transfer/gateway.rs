use crate::model::{DomesticTransferProgress, TransferRejectionReason};
use async_trait::async_trait;
use money2::Money;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transfer gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("transfer gateway returned a malformed payload: {0}")]
    Malformed(String),
}

/// Wire request for both initiation and progress checks; the gateway keys
/// progress lookups by the caller-supplied reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRequest {
    pub account_number: String,
    pub routing_number: String,
    pub amount: Money,
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayTransferStatus {
    Outgoing,
    InProgress,
    Complete,
    Failed,
}

impl From<GatewayTransferStatus> for DomesticTransferProgress {
    fn from(status: GatewayTransferStatus) -> Self {
        match status {
            GatewayTransferStatus::Outgoing => Self::Outgoing,
            GatewayTransferStatus::InProgress => Self::InProgress,
            GatewayTransferStatus::Complete => Self::Complete,
            GatewayTransferStatus::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub ok: bool,
    pub status: GatewayTransferStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

impl GatewayResponse {
    /// Maps the gateway's failure vocabulary onto the domain's rejection
    /// reasons; anything unrecognized is `Unknown`.
    pub fn rejection_reason(&self) -> TransferRejectionReason {
        match self.reason.as_deref() {
            Some("invalid_account_info") | Some("invalid_routing_number")
            | Some("invalid_account_number") => TransferRejectionReason::InvalidAccountInfo,
            Some("account_closed") => TransferRejectionReason::AccountClosed,
            Some("insufficient_recipient_info") => {
                TransferRejectionReason::InsufficientRecipientInfo
            },
            _ => TransferRejectionReason::Unknown,
        }
    }
}

#[async_trait]
pub trait TransferGatewayApi: Send + Sync {
    async fn initiate(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError>;

    async fn check_progress(&self, request: GatewayRequest)
        -> Result<GatewayResponse, GatewayError>;
}

/// JSON-over-HTTP client for the external domestic transfer gateway.
#[derive(Debug, Clone)]
pub struct HttpTransferGateway {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTransferGateway {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.base_url
            .join(path)
            .map_err(|err| GatewayError::Malformed(format!("bad gateway url: {err}")))
    }
}

#[async_trait]
impl TransferGatewayApi for HttpTransferGateway {
    async fn initiate(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let url = self.endpoint("transfers")?;
        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }

    async fn check_progress(
        &self, request: GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        let url = self.endpoint("transfers/progress")?;
        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }
}
