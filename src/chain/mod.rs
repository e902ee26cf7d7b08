//! Chain module - the node RPC surface the engine consumes
//!
//! This module provides:
//! - The [`NodeClient`] trait covering every JSON-RPC call the engine makes
//! - [`ChainProvider`], an ethers-backed implementation with multi-RPC failover

pub mod provider;

#[cfg(test)]
pub(crate) mod testing;

pub use provider::ChainProvider;

use crate::error::DeliveryResult;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};

/// JSON-RPC calls needed to deliver transactions
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// `eth_estimateGas`
    async fn estimate_gas(&self, tx: &TypedTransaction) -> DeliveryResult<U256>;

    /// `eth_gasPrice`
    async fn suggest_gas_price(&self) -> DeliveryResult<U256>;

    /// `eth_getTransactionCount` at the pending block
    async fn pending_nonce_at(&self, account: Address) -> DeliveryResult<u64>;

    /// `eth_sendRawTransaction`
    async fn send_raw_transaction(&self, raw: Bytes) -> DeliveryResult<H256>;

    /// `eth_getTransactionReceipt`
    async fn transaction_receipt(&self, hash: H256) -> DeliveryResult<Option<TransactionReceipt>>;

    /// `eth_blockNumber`
    async fn block_number(&self) -> DeliveryResult<u64>;

    /// `eth_call` against the latest block
    async fn call(&self, tx: &TypedTransaction) -> DeliveryResult<Bytes>;

    /// `eth_chainId`
    async fn chain_id(&self) -> DeliveryResult<u64>;
}
