//! Contract interfaces and calldata encoding

use crate::error::{SettlementError, SettlementResult};
use crate::jobs::intents::WithdrawItem;

use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolCall};

sol! {
    interface IMessageTransmitter {
        function receiveMessage(bytes message, bytes attestation) external returns (bool success);
    }

    interface IPortal {
        struct TokenAmount {
            address token;
            uint256 amount;
        }

        struct Reward {
            uint64 deadline;
            address creator;
            address prover;
            uint256 nativeAmount;
            TokenAmount[] tokens;
        }

        function batchWithdraw(uint64[] destinations, bytes32[] routeHashes, Reward[] rewards) external;

        function prove(address prover, uint64 sourceChainDomainID, bytes32[] intentHashes, bytes data) external payable;
    }

    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

pub fn receive_message(message: Bytes, attestation: Bytes) -> Bytes {
    IMessageTransmitter::receiveMessageCall {
        message,
        attestation,
    }
    .abi_encode()
    .into()
}

pub fn batch_withdraw(intents: &[WithdrawItem]) -> SettlementResult<Bytes> {
    let mut destinations = Vec::with_capacity(intents.len());
    let mut route_hashes = Vec::with_capacity(intents.len());
    let mut rewards = Vec::with_capacity(intents.len());

    for intent in intents {
        let deadline = u64::try_from(intent.reward.deadline).map_err(|_| {
            SettlementError::Transaction(format!(
                "Reward deadline {} of {} does not fit uint64",
                intent.reward.deadline, intent.route_hash
            ))
        })?;

        destinations.push(intent.destination);
        route_hashes.push(intent.route_hash);
        rewards.push(IPortal::Reward {
            deadline,
            creator: intent.reward.creator,
            prover: intent.reward.prover,
            nativeAmount: intent.reward.native_value,
            tokens: intent
                .reward
                .tokens
                .iter()
                .map(|t| IPortal::TokenAmount {
                    token: t.token,
                    amount: t.amount,
                })
                .collect(),
        });
    }

    Ok(IPortal::batchWithdrawCall {
        destinations,
        routeHashes: route_hashes,
        rewards,
    }
    .abi_encode()
    .into())
}

pub fn prove(prover: Address, source_domain: u64, intent_hashes: Vec<B256>, data: Bytes) -> Bytes {
    IPortal::proveCall {
        prover,
        sourceChainDomainID: source_domain,
        intentHashes: intent_hashes,
        data,
    }
    .abi_encode()
    .into()
}

pub fn balance_of(account: Address) -> Bytes {
    IERC20::balanceOfCall { account }.abi_encode().into()
}

pub fn allowance(owner: Address, spender: Address) -> Bytes {
    IERC20::allowanceCall { owner, spender }.abi_encode().into()
}

pub fn approve(spender: Address, amount: U256) -> Bytes {
    IERC20::approveCall { spender, amount }.abi_encode().into()
}

/// Decode a single `uint256` return value
pub fn decode_uint256(data: &[u8]) -> SettlementResult<U256> {
    IERC20::balanceOfCall::abi_decode_returns(data, true)
        .map(|ret| ret._0)
        .map_err(|e| SettlementError::Transaction(format!("Invalid uint256 return data: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::intents::{Reward, TokenAmount};
    use alloy_primitives::{address, bytes};

    #[test]
    fn test_selectors() {
        let call = receive_message(bytes!("0102"), bytes!("dead"));
        assert_eq!(&call[..4], &[0x57, 0xec, 0xfd, 0x28]);
        assert_eq!(&balance_of(Address::ZERO)[..4], &[0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(&approve(Address::ZERO, U256::ZERO)[..4], &[0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(&allowance(Address::ZERO, Address::ZERO)[..4], &[0xdd, 0x62, 0xed, 0x3e]);
    }

    #[test]
    fn test_decode_uint256() {
        let mut word = [0u8; 32];
        word[31] = 42;
        assert_eq!(decode_uint256(&word).unwrap(), U256::from(42u64));
        assert!(decode_uint256(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_batch_withdraw_rejects_oversized_deadline() {
        let item = WithdrawItem {
            route_hash: B256::with_last_byte(1),
            destination: 10,
            reward: Reward {
                creator: address!("3333333333333333333333333333333333333333"),
                prover: address!("4444444444444444444444444444444444444444"),
                deadline: U256::MAX,
                native_value: U256::ZERO,
                tokens: vec![TokenAmount {
                    token: Address::ZERO,
                    amount: U256::from(1u64),
                }],
            },
        };
        assert!(batch_withdraw(&[item.clone()]).is_err());

        let mut valid = item;
        valid.reward.deadline = U256::from(1_900_000_000u64);
        let call = batch_withdraw(&[valid]).unwrap();
        assert_eq!(&call[..4], IPortal::batchWithdrawCall::SELECTOR.as_slice());
    }
}
