//! Intent settlement batching
//!
//! Turns what the indexer reports as ready into execute-job payloads:
//! - send batches: grouped by fulfilment chain, then intent source, sorted by
//!   prover and source chain so equal routes share a chunk
//! - withdrawals: grouped by source chain and intent source

use crate::config::IntentSourceConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::jobs::intents::{
    BatchIndexer, IndexedProve, IndexedWithdrawal, ProveItem, SendBatchData, WithdrawItem,
    WithdrawsData,
};

use alloy_primitives::Address;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct IntentSettlementService {
    indexer: Arc<dyn BatchIndexer>,
    sources: Vec<IntentSourceConfig>,
    send_batch_chunk_size: usize,
    withdrawals_chunk_size: usize,
}

impl IntentSettlementService {
    pub fn new(
        indexer: Arc<dyn BatchIndexer>,
        sources: Vec<IntentSourceConfig>,
        send_batch_chunk_size: usize,
        withdrawals_chunk_size: usize,
    ) -> Self {
        Self {
            indexer,
            sources,
            send_batch_chunk_size: send_batch_chunk_size.max(1),
            withdrawals_chunk_size: withdrawals_chunk_size.max(1),
        }
    }

    /// Unique intent source addresses, in configuration order
    fn source_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = Vec::new();
        for source in &self.sources {
            if !addresses.contains(&source.source_address) {
                addresses.push(source.source_address);
            }
        }
        addresses
    }

    fn inbox_for(&self, intent_source: Address) -> SettlementResult<Address> {
        self.sources
            .iter()
            .find(|s| s.source_address == intent_source)
            .map(|s| s.inbox)
            .ok_or_else(|| {
                SettlementError::Config(format!("Intent source not found: {}", intent_source))
            })
    }

    pub async fn next_send_batches(&self) -> SettlementResult<Vec<SendBatchData>> {
        let addresses = self.source_addresses();
        let per_source = try_join_all(addresses.iter().map(|addr| async move {
            let proves = self.indexer.next_sendable_batch(*addr).await?;
            debug!("Intent source {}: {} sendable proves", addr, proves.len());
            Ok::<_, SettlementError>(proves.into_iter().map(move |p| (*addr, p)).collect::<Vec<_>>())
        }))
        .await?;

        // fulfilment chain -> intent source -> proves
        let mut grouped: BTreeMap<u32, BTreeMap<Address, Vec<IndexedProve>>> = BTreeMap::new();
        for (addr, prove) in per_source.into_iter().flatten() {
            grouped
                .entry(prove.destination_chain_id)
                .or_default()
                .entry(addr)
                .or_default()
                .push(prove);
        }

        let mut batches = Vec::new();
        for (chain_id, by_source) in grouped {
            for (intent_source, proves) in by_source {
                let inbox = self.inbox_for(intent_source)?;

                let mut items: Vec<ProveItem> = proves
                    .into_iter()
                    .map(|p| ProveItem {
                        hash: p.hash,
                        prover: p.prover,
                        source: p.chain_id,
                    })
                    .collect();
                items.sort_by_key(|item| (item.prover, item.source));

                for chunk in items.chunks(self.send_batch_chunk_size) {
                    batches.push(SendBatchData {
                        chain_id,
                        intent_source_address: intent_source,
                        inbox,
                        proves: chunk.to_vec(),
                        sent_routes: Vec::new(),
                    });
                }
            }
        }

        Ok(batches)
    }

    pub async fn next_withdrawal_batches(&self) -> SettlementResult<Vec<WithdrawsData>> {
        let addresses = self.source_addresses();
        let per_source = try_join_all(addresses.iter().map(|addr| async move {
            let withdrawals = self.indexer.next_withdrawable_batch(*addr).await?;
            debug!("Intent source {}: {} withdrawable intents", addr, withdrawals.len());
            Ok::<_, SettlementError>(
                withdrawals.into_iter().map(move |w| (*addr, w)).collect::<Vec<_>>(),
            )
        }))
        .await?;

        // (source chain, intent source) -> withdrawals
        let mut grouped: BTreeMap<(u64, Address), Vec<IndexedWithdrawal>> = BTreeMap::new();
        for (addr, withdrawal) in per_source.into_iter().flatten() {
            grouped.entry((withdrawal.source, addr)).or_default().push(withdrawal);
        }

        let mut batches = Vec::new();
        for ((source_chain, intent_source), withdrawals) in grouped {
            let chain_id = u32::try_from(source_chain).map_err(|_| {
                SettlementError::Indexer(format!("Source chain {} out of range", source_chain))
            })?;

            let items: Vec<WithdrawItem> = withdrawals
                .into_iter()
                .map(|w| WithdrawItem {
                    route_hash: w.route_hash,
                    destination: w.destination,
                    reward: w.reward,
                })
                .collect();

            for chunk in items.chunks(self.withdrawals_chunk_size) {
                batches.push(WithdrawsData {
                    chain_id,
                    intent_source_address: intent_source,
                    intents: chunk.to_vec(),
                });
            }
        }

        Ok(batches)
    }
}
