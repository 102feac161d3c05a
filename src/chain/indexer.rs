//! Indexer client for batch scans

use crate::error::{SettlementError, SettlementResult};
use crate::jobs::intents::{BatchIndexer, IndexedProve, IndexedWithdrawal, Reward};

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct IndexerResponse<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct WithdrawalRecord {
    intent: Value,
}

/// Chain ids arrive as numbers or decimal strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChainNumber {
    Number(u64),
    Text(String),
}

impl ChainNumber {
    fn value(&self) -> SettlementResult<u64> {
        match self {
            ChainNumber::Number(n) => Ok(*n),
            ChainNumber::Text(s) => s
                .parse()
                .map_err(|_| SettlementError::Indexer(format!("Invalid chain id: {}", s))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WithdrawalIntent {
    route_hash: B256,
    source: ChainNumber,
    destination: ChainNumber,
    reward: Reward,
}

pub struct IndexerClient {
    http: reqwest::Client,
    base_url: String,
}

impl IndexerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SettlementResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SettlementError::Config(format!("Indexer client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, endpoint: &str, intent_source: Address) -> SettlementResult<Vec<T>> {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .http
            .get(&url)
            .query(&[("evt_log_address", intent_source.to_string())])
            .send()
            .await
            .map_err(|e| SettlementError::Indexer(format!("{}: {}", endpoint, e)))?;

        if !response.status().is_success() {
            return Err(SettlementError::Indexer(format!(
                "{} returned {}",
                endpoint,
                response.status()
            )));
        }

        let body: IndexerResponse<T> = response
            .json()
            .await
            .map_err(|e| SettlementError::Indexer(format!("{}: invalid response: {}", endpoint, e)))?;
        Ok(body.data)
    }
}

/// Gasless intents are settled elsewhere
fn is_gasless(intent: &Value) -> bool {
    intent.get("intentHash").is_some() && intent.get("fundingSource").is_some()
}

#[async_trait]
impl BatchIndexer for IndexerClient {
    async fn next_sendable_batch(&self, intent_source: Address) -> SettlementResult<Vec<IndexedProve>> {
        self.get("/intents/nextBatch", intent_source).await
    }

    async fn next_withdrawable_batch(
        &self,
        intent_source: Address,
    ) -> SettlementResult<Vec<IndexedWithdrawal>> {
        let records: Vec<WithdrawalRecord> =
            self.get("/intents/nextBatchWithdrawals", intent_source).await?;

        let total = records.len();
        let mut withdrawals = Vec::with_capacity(total);
        for record in records {
            if is_gasless(&record.intent) {
                continue;
            }
            let intent: WithdrawalIntent = serde_json::from_value(record.intent)
                .map_err(|e| SettlementError::Indexer(format!("Invalid withdrawal record: {}", e)))?;
            withdrawals.push(IndexedWithdrawal {
                route_hash: intent.route_hash,
                source: intent.source.value()?,
                destination: intent.destination.value()?,
                reward: intent.reward,
            });
        }

        debug!(
            "Indexer returned {} withdrawals for {} ({} gasless skipped)",
            total,
            intent_source,
            total - withdrawals.len()
        );
        Ok(withdrawals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, U256};
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SOURCE: Address = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

    fn reward_json() -> Value {
        json!({
            "creator": "0x3333333333333333333333333333333333333333",
            "prover": "0x4444444444444444444444444444444444444444",
            "deadline": "0x7d2b7500",
            "nativeValue": "0x0",
            "tokens": [{ "token": "0x5555555555555555555555555555555555555555", "amount": "0xf4240" }]
        })
    }

    fn client(server: &MockServer) -> IndexerClient {
        IndexerClient::new(server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_next_sendable_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/intents/nextBatch"))
            .and(query_param("evt_log_address", SOURCE.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "hash": "0x0000000000000000000000000000000000000000000000000000000000000001",
                    "prover": "0x1111111111111111111111111111111111111111",
                    "chainId": 8453,
                    "destinationChainId": 10
                }]
            })))
            .mount(&server)
            .await;

        let proves = client(&server).next_sendable_batch(SOURCE).await.unwrap();
        assert_eq!(proves.len(), 1);
        assert_eq!(proves[0].hash, B256::with_last_byte(1));
        assert_eq!(proves[0].destination_chain_id, 10);
    }

    #[tokio::test]
    async fn test_withdrawals_skip_gasless_and_parse_string_chains() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/intents/nextBatchWithdrawals"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "intent": {
                        "routeHash": "0x0000000000000000000000000000000000000000000000000000000000000002",
                        "source": "8453",
                        "destination": 10,
                        "reward": reward_json()
                    } },
                    { "intent": { "intentHash": "0x01", "fundingSource": "permit" } }
                ]
            })))
            .mount(&server)
            .await;

        let withdrawals = client(&server).next_withdrawable_batch(SOURCE).await.unwrap();
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0].source, 8453);
        assert_eq!(withdrawals[0].destination, 10);
        assert_eq!(withdrawals[0].reward.tokens[0].amount, U256::from(1_000_000u64));
    }

    #[tokio::test]
    async fn test_error_status_is_indexer_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = client(&server).next_sendable_batch(SOURCE).await.unwrap_err();
        assert!(matches!(err, SettlementError::Indexer(_)));
    }
}
