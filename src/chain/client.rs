//! Signing chain clients
//!
//! One ethers signer stack per enabled chain. Calldata is encoded with the
//! `sol!` interfaces in [`super::abi`]; the clients implement the executor
//! traits the job managers consume.

use super::abi;
use super::{from_ethers_u256, to_ethers_address, to_ethers_u256};
use crate::config::{ChainConfig, IntentSourceConfig, Settings, TrackedToken};
use crate::error::{SettlementError, SettlementResult};
use crate::jobs::balances::{BalanceMonitor, TokenBalance};
use crate::jobs::cctp::{DestinationSwapExecutor, MintExecutor, SwapExecution};
use crate::jobs::intents::{BatchExecutor, WithdrawItem};

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use dashmap::DashMap;
use ethers::middleware::{NonceManagerMiddleware, SignerMiddleware};
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{TransactionRequest, H256, U64};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

type SignerStack = NonceManagerMiddleware<SignerMiddleware<Provider<Http>, LocalWallet>>;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Load the relayer wallet from the configured environment variable
pub fn load_wallet(env_var: &str) -> SettlementResult<LocalWallet> {
    let key = std::env::var(env_var).map_err(|_| {
        SettlementError::Config(format!("No wallet configured. Set {}", env_var))
    })?;
    key.trim()
        .parse::<LocalWallet>()
        .map_err(|e| SettlementError::Config(format!("Invalid private key: {}", e)))
}

/// Signing client for one chain
pub struct ChainClient {
    config: ChainConfig,
    client: SignerStack,
}

impl ChainClient {
    pub fn new(config: ChainConfig, wallet: LocalWallet) -> SettlementResult<Self> {
        let url = config
            .rpc_urls
            .first()
            .ok_or_else(|| SettlementError::ChainConnection {
                chain_id: config.chain_id,
                message: "No RPC URLs configured".to_string(),
            })?;
        let provider = Provider::<Http>::try_from(url.as_str())
            .map_err(|e| SettlementError::ChainConnection {
                chain_id: config.chain_id,
                message: e.to_string(),
            })?
            .interval(Duration::from_millis(100));

        let wallet = wallet.with_chain_id(config.chain_id);
        let address = wallet.address();
        let client = NonceManagerMiddleware::new(SignerMiddleware::new(provider, wallet), address);

        Ok(Self { config, client })
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    fn connection_error(&self, e: impl std::fmt::Display) -> SettlementError {
        SettlementError::ChainConnection {
            chain_id: self.config.chain_id,
            message: e.to_string(),
        }
    }

    /// Sign and broadcast a call; returns once the node accepted it
    pub async fn send(&self, to: Address, data: Bytes, value: U256) -> SettlementResult<B256> {
        let tx = TransactionRequest::new()
            .to(to_ethers_address(to))
            .data(data.to_vec())
            .value(to_ethers_u256(value));

        let pending = self.client.send_transaction(tx, None).await.map_err(|e| {
            SettlementError::Transaction(format!("chain {}: {}", self.config.chain_id, e))
        })?;
        let tx_hash = B256::from(pending.tx_hash().0);
        debug!("Chain {}: submitted {} to {}", self.config.chain_id, tx_hash, to);
        Ok(tx_hash)
    }

    /// Read-only call
    pub async fn call(&self, to: Address, data: Bytes) -> SettlementResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(to_ethers_address(to))
            .data(data.to_vec())
            .into();
        let output = self
            .client
            .call(&tx, None)
            .await
            .map_err(|e| self.connection_error(e))?;
        Ok(Bytes::from(output.to_vec()))
    }

    /// Wait until the transaction is mined with enough confirmations
    pub async fn wait_for_receipt(&self, tx_hash: B256) -> SettlementResult<()> {
        let hash = H256::from(tx_hash.0);
        let confirmations = self.config.confirmations.max(1) as u64;

        let wait = async {
            loop {
                let receipt = self
                    .client
                    .get_transaction_receipt(hash)
                    .await
                    .map_err(|e| self.connection_error(e))?;

                if let Some(receipt) = receipt {
                    let head = self
                        .client
                        .get_block_number()
                        .await
                        .map_err(|e| self.connection_error(e))?
                        .as_u64();
                    let mined_at = receipt.block_number.map(|b| b.as_u64()).unwrap_or(head);
                    if head + 1 >= mined_at + confirmations {
                        return Ok::<_, SettlementError>(receipt);
                    }
                }
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            }
        };

        let receipt = timeout(Duration::from_secs(self.config.receipt_timeout_secs), wait)
            .await
            .map_err(|_| SettlementError::Timeout {
                operation: format!("receipt {} on chain {}", tx_hash, self.config.chain_id),
            })??;

        if receipt.status != Some(U64::from(1)) {
            return Err(SettlementError::TransactionReverted {
                chain_id: self.config.chain_id,
                tx_hash: tx_hash.to_string(),
            });
        }
        Ok(())
    }

    pub async fn erc20_balance(&self, token: Address, owner: Address) -> SettlementResult<U256> {
        let output = self.call(token, abi::balance_of(owner)).await?;
        abi::decode_uint256(&output)
    }

    pub async fn native_balance(&self, owner: Address) -> SettlementResult<U256> {
        let balance = self
            .client
            .get_balance(to_ethers_address(owner), None)
            .await
            .map_err(|e| self.connection_error(e))?;
        Ok(from_ethers_u256(balance))
    }

    pub async fn erc20_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> SettlementResult<U256> {
        let output = self.call(token, abi::allowance(owner, spender)).await?;
        abi::decode_uint256(&output)
    }
}

/// Prepared transaction inside a swap quote
#[derive(Debug, Clone, Deserialize)]
pub struct SwapTransaction {
    pub to: Address,
    pub data: Bytes,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapEstimate {
    pub approval_address: Option<Address>,
    pub from_amount: Option<String>,
    pub to_amount: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteToken {
    pub address: Address,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapAction {
    pub from_token: Option<QuoteToken>,
    pub to_token: Option<QuoteToken>,
}

/// The parts of an aggregator quote needed to execute it
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapQuote {
    pub transaction_request: SwapTransaction,
    #[serde(default)]
    pub estimate: SwapEstimate,
    #[serde(default)]
    pub action: SwapAction,
    #[serde(default)]
    pub from_amount: Option<String>,
}

fn parse_amount(field: &str, value: &str) -> SettlementResult<U256> {
    U256::from_str(value)
        .map_err(|e| SettlementError::Swap(format!("Invalid {} {:?}: {}", field, value, e)))
}

impl SwapQuote {
    pub fn from_value(quote: &Value) -> SettlementResult<Self> {
        serde_json::from_value(quote.clone())
            .map_err(|e| SettlementError::Swap(format!("Unusable swap quote: {}", e)))
    }

    pub fn value(&self) -> SettlementResult<U256> {
        match self.transaction_request.value.as_deref() {
            Some(value) => parse_amount("value", value),
            None => Ok(U256::ZERO),
        }
    }

    pub fn from_amount(&self) -> SettlementResult<Option<U256>> {
        self.estimate
            .from_amount
            .as_deref()
            .or(self.from_amount.as_deref())
            .map(|v| parse_amount("fromAmount", v))
            .transpose()
    }

    pub fn to_amount(&self) -> SettlementResult<U256> {
        self.estimate
            .to_amount
            .as_deref()
            .map(|v| parse_amount("toAmount", v))
            .transpose()
            .map(Option::unwrap_or_default)
    }

    /// ERC-20 approval the swap needs: (token, spender, amount)
    pub fn approval(&self) -> SettlementResult<Option<(Address, Address, U256)>> {
        let (Some(spender), Some(token)) = (self.estimate.approval_address, &self.action.from_token)
        else {
            return Ok(None);
        };
        if token.address == Address::ZERO {
            return Ok(None);
        }
        Ok(self
            .from_amount()?
            .map(|amount| (token.address, spender, amount)))
    }
}

/// Signing clients for every enabled chain
pub struct ChainClients {
    clients: DashMap<u64, Arc<ChainClient>>,
    address: Address,
    message_transmitters: HashMap<u64, Address>,
    intent_sources: Vec<IntentSourceConfig>,
    tracked_tokens: Vec<TrackedToken>,
}

impl ChainClients {
    pub fn new(settings: &Settings) -> SettlementResult<Self> {
        let wallet = load_wallet(&settings.wallet.private_key_env)?;
        let address = Address::from(wallet.address().0);
        info!("Chain clients initialized with wallet: {}", address);

        let clients = DashMap::new();
        for (name, chain) in settings.enabled_chains() {
            let client = ChainClient::new(chain.clone(), wallet.clone())?;
            info!("Chain {} (ID: {}) ready", name, chain.chain_id);
            clients.insert(chain.chain_id, Arc::new(client));
        }

        Ok(Self {
            clients,
            address,
            message_transmitters: settings
                .cctp
                .chains
                .iter()
                .map(|c| (c.chain_id, c.message_transmitter))
                .collect(),
            intent_sources: settings.intent_sources.clone(),
            tracked_tokens: settings.balances.tokens.clone(),
        })
    }

    /// Relayer wallet address
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn client(&self, chain_id: u64) -> SettlementResult<Arc<ChainClient>> {
        self.clients
            .get(&chain_id)
            .map(|c| c.clone())
            .ok_or(SettlementError::ChainNotFound { chain_id })
    }

    fn intent_source_for_portal(&self, portal: Address) -> Option<&IntentSourceConfig> {
        self.intent_sources
            .iter()
            .find(|s| s.inbox == portal || s.source_address == portal)
    }
}

#[async_trait]
impl MintExecutor for ChainClients {
    async fn mint(&self, chain_id: u64, message_body: Bytes, attestation: Bytes) -> SettlementResult<B256> {
        let transmitter = self
            .message_transmitters
            .get(&chain_id)
            .copied()
            .ok_or(SettlementError::ChainNotFound { chain_id })?;
        let client = self.client(chain_id)?;
        client
            .send(transmitter, abi::receive_message(message_body, attestation), U256::ZERO)
            .await
    }

    async fn wait_for_receipt(&self, chain_id: u64, tx_hash: B256) -> SettlementResult<()> {
        self.client(chain_id)?.wait_for_receipt(tx_hash).await
    }
}

#[async_trait]
impl BatchExecutor for ChainClients {
    async fn prove(
        &self,
        chain_id: u64,
        portal: Address,
        prover: Address,
        source_domain: u64,
        intent_hashes: Vec<B256>,
    ) -> SettlementResult<B256> {
        let (fee, prover_data) = self
            .intent_source_for_portal(portal)
            .map(|s| (U256::from(s.prove_fee_wei), s.prover_data.clone()))
            .unwrap_or_default();

        let client = self.client(chain_id)?;
        let tx_hash = client
            .send(portal, abi::prove(prover, source_domain, intent_hashes, prover_data), fee)
            .await?;
        client.wait_for_receipt(tx_hash).await?;
        Ok(tx_hash)
    }

    async fn batch_withdraw(
        &self,
        chain_id: u64,
        portal: Address,
        intents: Vec<WithdrawItem>,
    ) -> SettlementResult<B256> {
        let calldata = abi::batch_withdraw(&intents)?;
        let client = self.client(chain_id)?;
        let tx_hash = client.send(portal, calldata, U256::ZERO).await?;
        client.wait_for_receipt(tx_hash).await?;
        Ok(tx_hash)
    }
}

#[async_trait]
impl DestinationSwapExecutor for ChainClients {
    async fn execute_swap(&self, chain_id: u64, wallet: Address, quote: Value) -> SettlementResult<SwapExecution> {
        if wallet != self.address {
            return Err(SettlementError::Swap(format!(
                "Wallet {} is not managed by this relayer",
                wallet
            )));
        }

        let swap = SwapQuote::from_value(&quote)?;
        let client = self.client(chain_id)?;

        if let Some((token, spender, amount)) = swap.approval()? {
            let allowance = client.erc20_allowance(token, wallet, spender).await?;
            if allowance < amount {
                info!(
                    "Approving {} of {} to {} on chain {}",
                    amount, token, spender, chain_id
                );
                let approval = client.send(token, abi::approve(spender, amount), U256::ZERO).await?;
                client.wait_for_receipt(approval).await?;
            }
        }

        let to_token = swap.action.to_token.as_ref().map(|t| t.address);
        let before = match to_token {
            Some(token) => Some(client.erc20_balance(token, wallet).await?),
            None => None,
        };

        let tx_hash = client
            .send(
                swap.transaction_request.to,
                swap.transaction_request.data.clone(),
                swap.value()?,
            )
            .await?;
        client.wait_for_receipt(tx_hash).await?;

        let final_amount = match (to_token, before) {
            (Some(token), Some(before)) => client
                .erc20_balance(token, wallet)
                .await?
                .saturating_sub(before),
            _ => swap.to_amount()?,
        };

        Ok(SwapExecution {
            tx_hash,
            final_amount,
        })
    }
}

#[async_trait]
impl BalanceMonitor for ChainClients {
    async fn token_balances(&self, wallet: Address) -> SettlementResult<Vec<TokenBalance>> {
        let mut balances = Vec::with_capacity(self.tracked_tokens.len());
        for token in &self.tracked_tokens {
            let client = match self.client(token.chain_id) {
                Ok(client) => client,
                Err(e) => {
                    warn!("Skipping {} balance: {}", token.symbol, e);
                    continue;
                }
            };

            let balance = if token.address == Address::ZERO {
                client.native_balance(wallet).await?
            } else {
                client.erc20_balance(token.address, wallet).await?
            };

            balances.push(TokenBalance {
                chain_id: token.chain_id,
                token: token.address,
                symbol: token.symbol.clone(),
                balance,
                decimals: token.decimals,
                min_balance: token.min_balance,
            });
        }
        Ok(balances)
    }
}
