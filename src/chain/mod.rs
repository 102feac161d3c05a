//! Chain module - concrete collaborators behind the job managers
//!
//! This module provides:
//! - Contract interfaces and calldata encoding
//! - Signing clients per chain (mint, batch settlement, swaps, balances)
//! - HTTP clients for the attestation service and the intent indexer

pub mod abi;
pub mod client;
pub mod indexer;
pub mod iris;

pub use client::{ChainClient, ChainClients, SwapQuote};
pub use indexer::IndexerClient;
pub use iris::IrisClient;

use alloy_primitives::{Address, U256};

pub(crate) fn to_ethers_address(address: Address) -> ethers::types::Address {
    ethers::types::Address::from_slice(address.as_slice())
}

pub(crate) fn to_ethers_u256(value: U256) -> ethers::types::U256 {
    ethers::types::U256::from_big_endian(&value.to_be_bytes::<32>())
}

pub(crate) fn from_ethers_u256(value: ethers::types::U256) -> U256 {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    U256::from_be_bytes(bytes)
}
