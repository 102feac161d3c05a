//! Shared business services reachable from job managers
//!
//! The registry is built once at startup and handed to each processor. Job
//! managers never construct their collaborators; a collaborator that was not
//! registered surfaces as [`SettlementError::MissingService`].

pub mod settlement;

pub use settlement::IntentSettlementService;

use crate::error::{SettlementError, SettlementResult};
use crate::jobs::balances::BalanceMonitor;
use crate::jobs::cctp::{AttestationFetcher, DestinationSwapExecutor, MintExecutor};
use crate::jobs::intents::BatchExecutor;

use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Services {
    attestations: Option<Arc<dyn AttestationFetcher>>,
    mints: Option<Arc<dyn MintExecutor>>,
    destination_swaps: Option<Arc<dyn DestinationSwapExecutor>>,
    settlement: Option<Arc<IntentSettlementService>>,
    batch_executor: Option<Arc<dyn BatchExecutor>>,
    balances: Option<Arc<dyn BalanceMonitor>>,
}

impl Services {
    pub fn with_attestations(mut self, service: Arc<dyn AttestationFetcher>) -> Self {
        self.attestations = Some(service);
        self
    }

    pub fn with_mints(mut self, service: Arc<dyn MintExecutor>) -> Self {
        self.mints = Some(service);
        self
    }

    pub fn with_destination_swaps(mut self, service: Arc<dyn DestinationSwapExecutor>) -> Self {
        self.destination_swaps = Some(service);
        self
    }

    pub fn with_settlement(mut self, service: Arc<IntentSettlementService>) -> Self {
        self.settlement = Some(service);
        self
    }

    pub fn with_batch_executor(mut self, service: Arc<dyn BatchExecutor>) -> Self {
        self.batch_executor = Some(service);
        self
    }

    pub fn with_balances(mut self, service: Arc<dyn BalanceMonitor>) -> Self {
        self.balances = Some(service);
        self
    }

    pub fn attestations(&self) -> SettlementResult<&dyn AttestationFetcher> {
        self.attestations
            .as_deref()
            .ok_or(SettlementError::MissingService("attestation fetcher"))
    }

    pub fn mints(&self) -> SettlementResult<&dyn MintExecutor> {
        self.mints
            .as_deref()
            .ok_or(SettlementError::MissingService("mint executor"))
    }

    pub fn destination_swaps(&self) -> SettlementResult<&dyn DestinationSwapExecutor> {
        self.destination_swaps
            .as_deref()
            .ok_or(SettlementError::MissingService("destination swap executor"))
    }

    pub fn settlement(&self) -> SettlementResult<&IntentSettlementService> {
        self.settlement
            .as_deref()
            .ok_or(SettlementError::MissingService("intent settlement service"))
    }

    pub fn batch_executor(&self) -> SettlementResult<&dyn BatchExecutor> {
        self.batch_executor
            .as_deref()
            .ok_or(SettlementError::MissingService("batch executor"))
    }

    pub fn balances(&self) -> SettlementResult<&dyn BalanceMonitor> {
        self.balances
            .as_deref()
            .ok_or(SettlementError::MissingService("balance monitor"))
    }
}
