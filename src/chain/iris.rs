//! Circle attestation API client

use crate::error::{SettlementError, SettlementResult};
use crate::jobs::cctp::{AttestationFetcher, AttestationStatus};

use alloy_primitives::{Bytes, B256};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct AttestationResponse {
    status: Option<String>,
    attestation: Option<Bytes>,
    error: Option<String>,
}

pub struct IrisClient {
    http: reqwest::Client,
    base_url: String,
}

impl IrisClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SettlementResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SettlementError::Config(format!("Attestation client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AttestationFetcher for IrisClient {
    async fn fetch(&self, message_hash: B256) -> SettlementResult<AttestationStatus> {
        let url = format!("{}/v1/attestations/{}", self.base_url, message_hash);

        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            // not indexed yet is indistinguishable from slow
            Err(e) if e.is_timeout() => {
                debug!("Attestation request for {} timed out", message_hash);
                return Ok(AttestationStatus::Pending);
            }
            Err(e) => return Err(SettlementError::Attestation(e.to_string())),
        };

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(AttestationStatus::Pending);
        }
        if !response.status().is_success() {
            return Err(SettlementError::Attestation(format!(
                "Attestation API returned {} for {}",
                response.status(),
                message_hash
            )));
        }

        let body: AttestationResponse = response
            .json()
            .await
            .map_err(|e| SettlementError::Attestation(format!("Invalid response: {}", e)))?;

        if let Some(error) = body.error {
            if error.to_lowercase().contains("not found") {
                return Ok(AttestationStatus::Pending);
            }
            return Err(SettlementError::Attestation(error));
        }

        match (body.status.as_deref(), body.attestation) {
            (Some("complete"), Some(attestation)) => Ok(AttestationStatus::Complete { attestation }),
            (Some("complete"), None) => Err(SettlementError::Attestation(format!(
                "Attestation for {} reported complete without a signature",
                message_hash
            ))),
            _ => Ok(AttestationStatus::Pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{b256, bytes};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HASH: B256 = b256!("abc0000000000000000000000000000000000000000000000000000000000abc");

    fn attestation_path() -> String {
        format!("/v1/attestations/{}", HASH)
    }

    async fn client_for(server: &MockServer) -> IrisClient {
        IrisClient::new(server.uri(), Duration::from_millis(200)).unwrap()
    }

    #[tokio::test]
    async fn test_complete_attestation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(attestation_path()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "status": "complete", "attestation": "0xdead" })),
            )
            .mount(&server)
            .await;

        let status = client_for(&server).await.fetch(HASH).await.unwrap();
        assert_eq!(status, AttestationStatus::Complete { attestation: bytes!("dead") });
    }

    #[tokio::test]
    async fn test_pending_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(attestation_path()))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "status": "pending_confirmations" })),
            )
            .mount(&server)
            .await;

        assert_eq!(client_for(&server).await.fetch(HASH).await.unwrap(), AttestationStatus::Pending);
    }

    #[tokio::test]
    async fn test_unindexed_message_is_pending() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(attestation_path()))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        assert_eq!(client.fetch(HASH).await.unwrap(), AttestationStatus::Pending);

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(attestation_path()))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "error": "Message hash not found" })),
            )
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        assert_eq!(client.fetch(HASH).await.unwrap(), AttestationStatus::Pending);
    }

    #[tokio::test]
    async fn test_timeout_is_pending() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(attestation_path()))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        assert_eq!(client_for(&server).await.fetch(HASH).await.unwrap(), AttestationStatus::Pending);
    }

    #[tokio::test]
    async fn test_server_error_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(attestation_path()))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server).await.fetch(HASH).await.unwrap_err();
        assert!(matches!(err, SettlementError::Attestation(_)));
        assert!(err.is_retryable());
    }
}
