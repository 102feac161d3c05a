//! Per-wallet balance checks

use crate::error::SettlementResult;
use crate::jobs::{JobManager, JobName, ProcessorContext};
use crate::metrics;
use crate::queue::{Job, JobOptions, NewJob};

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Balance of one tracked token held by a wallet
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBalance {
    pub chain_id: u64,
    pub token: Address,
    pub symbol: String,
    pub balance: U256,
    pub decimals: u8,
    /// Warn threshold in whole tokens
    pub min_balance: Option<f64>,
}

impl TokenBalance {
    /// Balance in whole tokens
    pub fn amount(&self) -> f64 {
        let raw: f64 = self.balance.to_string().parse().unwrap_or(f64::MAX);
        raw / 10f64.powi(self.decimals as i32)
    }

    pub fn is_low(&self) -> bool {
        self.min_balance.is_some_and(|min| self.amount() < min)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BalanceMonitor: Send + Sync {
    async fn token_balances(&self, wallet: Address) -> SettlementResult<Vec<TokenBalance>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckBalancesData {
    pub wallet_address: Address,
}

pub struct CheckBalancesManager;

impl CheckBalancesManager {
    /// One pending check per wallet
    pub fn job_id(wallet: Address) -> String {
        format!("check-balances-{}", wallet.to_string().to_lowercase())
    }

    pub fn job(wallet: Address) -> SettlementResult<NewJob> {
        let options = JobOptions::default()
            .with_job_id(Self::job_id(wallet))
            .remove_on_complete(true)
            .remove_on_fail(true);
        NewJob::from_payload(
            JobName::CheckBalances.as_str(),
            &CheckBalancesData {
                wallet_address: wallet,
            },
            options,
        )
    }
}

#[async_trait]
impl JobManager for CheckBalancesManager {
    fn kind(&self) -> JobName {
        JobName::CheckBalances
    }

    async fn execute(&self, job: &Job, ctx: &dyn ProcessorContext) -> SettlementResult<Value> {
        let data: CheckBalancesData = job.payload()?;
        let wallet = data.wallet_address.to_string();
        let balances = ctx
            .services()
            .balances()?
            .token_balances(data.wallet_address)
            .await?;

        let mut low = Vec::new();
        for balance in &balances {
            let amount = balance.amount();
            metrics::record_token_balance(
                balance.chain_id,
                &wallet,
                &balance.symbol,
                amount,
            );
            debug!(
                "Wallet {} holds {} {} on chain {}",
                wallet, amount, balance.symbol, balance.chain_id
            );

            if balance.is_low() {
                warn!(
                    "Low balance: wallet {} holds {} {} on chain {} (minimum {})",
                    wallet,
                    amount,
                    balance.symbol,
                    balance.chain_id,
                    balance.min_balance.unwrap_or_default()
                );
                low.push(json!({
                    "chainId": balance.chain_id,
                    "token": balance.token,
                    "amount": amount,
                }));
            }
        }

        info!(
            "Checked {} balances for wallet {}, {} below minimum",
            balances.len(),
            wallet,
            low.len()
        );
        Ok(json!({
            "walletAddress": data.wallet_address,
            "checked": balances.len(),
            "low": low,
        }))
    }
}
