//! Feeder client (report producer → skyfuse server).

use reqwest::Client;
use url::Url;

use super::ClientError;
use crate::objects::{ReportBatch, ReportBatchAccepted, ReportEnvelope};
use crate::signature::{SIGNATURE_HEADER, SignedObject};

/// Typed HTTP client for pushing reports.
///
/// Every request body is signed with
/// `HMAC-SHA256("{timestamp}.{json}", feeder_secret)`.
#[derive(Debug, Clone)]
pub struct FeederClient {
    http: Client,
    base_url: Url,
    secret: Vec<u8>,
}

impl FeederClient {
    /// * `base_url` – root URL of the skyfuse server.
    /// * `feeder_secret` – the shared HMAC secret for body signing.
    pub fn new(base_url: Url, feeder_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            http: Client::new(),
            base_url,
            secret: feeder_secret.into(),
        }
    }

    /// Replace the default `reqwest::Client` (timeouts, proxy, …).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// `POST /api/v1/reports` – enqueue a batch of reports.
    pub async fn submit(
        &self,
        reports: Vec<ReportEnvelope>,
    ) -> Result<ReportBatchAccepted, ClientError> {
        let signed = SignedObject::new(ReportBatch { reports }, &self.secret)?;
        let url = self.base_url.join("/api/v1/reports")?;

        let resp = self
            .http
            .post(url)
            .header(SIGNATURE_HEADER, signed.to_header())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(signed.json)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Api { status, body });
        }
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(ClientError::Json)
    }
}
