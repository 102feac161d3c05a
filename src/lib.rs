//! Settlement relayer - job orchestration for cross-chain intent settlement
//!
//! Typed jobs flow through durable work queues to the managers that know how
//! to run them: CCTP burn, attest, mint and destination swap on the liquidity
//! queue; batched proves and reward withdrawals on the intent-processor queue.

pub mod chain;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod services;

pub use error::{SettlementError, SettlementResult};
