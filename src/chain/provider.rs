//! Chain provider with multi-RPC support and automatic failover

use super::NodeClient;
use crate::config::NodeConfig;
use crate::error::{DeliveryError, DeliveryResult};

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, TransactionReceipt, H256, U256};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Upper bound for one read-only RPC round trip
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: &NodeConfig) -> DeliveryResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!(%url, "Added HTTP provider");
                }
                Err(e) => {
                    warn!(%url, "Failed to create provider: {}", e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(DeliveryError::Config("No valid RPC providers".to_string()));
        }

        Ok(Self {
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Failover to provider {}", next);
    }

    /// Run a read-only call against each provider in turn until one answers
    async fn with_failover<'a, T, F, Fut>(&'a self, method: &'static str, f: F) -> DeliveryResult<T>
    where
        F: Fn(&'a Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = None;

        for _ in 0..self.http_providers.len() {
            match timeout(RPC_TIMEOUT, f(self.http())).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    warn!(method, "RPC call failed: {}", e);
                    last_error = Some(DeliveryError::rpc(method, e));
                }
                Err(_) => {
                    warn!(method, "RPC call timed out");
                    last_error = Some(DeliveryError::Timeout {
                        operation: method.to_string(),
                    });
                }
            }
            self.failover();
        }

        Err(last_error.unwrap_or_else(|| DeliveryError::rpc(method, "no providers")))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        self.block_number().await.is_ok()
    }
}

#[async_trait]
impl NodeClient for ChainProvider {
    async fn estimate_gas(&self, tx: &TypedTransaction) -> DeliveryResult<U256> {
        // A revert here is an answer, not an outage: no failover
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| DeliveryError::GasEstimation(e.to_string()))
    }

    async fn suggest_gas_price(&self) -> DeliveryResult<U256> {
        self.with_failover("eth_gasPrice", |p| p.get_gas_price())
            .await
    }

    async fn pending_nonce_at(&self, account: Address) -> DeliveryResult<u64> {
        let count = self
            .with_failover("eth_getTransactionCount", |p| {
                p.get_transaction_count(account, Some(BlockNumber::Pending.into()))
            })
            .await?;
        Ok(count.as_u64())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> DeliveryResult<H256> {
        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| DeliveryError::Broadcast(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: H256) -> DeliveryResult<Option<TransactionReceipt>> {
        self.with_failover("eth_getTransactionReceipt", |p| {
            p.get_transaction_receipt(hash)
        })
        .await
    }

    async fn block_number(&self) -> DeliveryResult<u64> {
        let block = self
            .with_failover("eth_blockNumber", |p| p.get_block_number())
            .await?;
        Ok(block.as_u64())
    }

    async fn call(&self, tx: &TypedTransaction) -> DeliveryResult<Bytes> {
        self.http()
            .call(tx, None)
            .await
            .map_err(|e| DeliveryError::rpc("eth_call", e))
    }

    async fn chain_id(&self) -> DeliveryResult<u64> {
        let chain_id = self
            .with_failover("eth_chainId", |p| p.get_chainid())
            .await?;
        Ok(chain_id.as_u64())
    }
}
