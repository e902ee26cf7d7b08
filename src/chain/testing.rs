//! Test doubles for the node RPC surface

use super::NodeClient;
use crate::error::{DeliveryError, DeliveryResult};

use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256, U64};
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::Mutex;

pub(crate) const CHAIN_ID: u64 = 31337;

pub(crate) fn test_wallet() -> LocalWallet {
    "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
        .parse()
        .unwrap()
}

pub(crate) fn other_wallet() -> LocalWallet {
    "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"
        .parse()
        .unwrap()
}

mockall::mock! {
    pub Node {}

    #[async_trait]
    impl NodeClient for Node {
        async fn estimate_gas(&self, tx: &TypedTransaction) -> DeliveryResult<U256>;
        async fn suggest_gas_price(&self) -> DeliveryResult<U256>;
        async fn pending_nonce_at(&self, account: Address) -> DeliveryResult<u64>;
        async fn send_raw_transaction(&self, raw: Bytes) -> DeliveryResult<H256>;
        async fn transaction_receipt(&self, hash: H256) -> DeliveryResult<Option<TransactionReceipt>>;
        async fn block_number(&self) -> DeliveryResult<u64>;
        async fn call(&self, tx: &TypedTransaction) -> DeliveryResult<Bytes>;
        async fn chain_id(&self) -> DeliveryResult<u64>;
    }
}

/// A raw transaction the fake node accepted
#[derive(Debug, Clone)]
pub(crate) struct Submission {
    pub hash: H256,
    pub raw: Bytes,
}

struct FakeState {
    nonces: HashMap<Address, u64>,
    nonce_fetches: usize,
    fail_nonce_fetch: bool,
    gas_price: U256,
    estimate: Result<U256, String>,
    call_result: Result<Bytes, String>,
    head: u64,
    receipts: HashMap<H256, TransactionReceipt>,
    submissions: Vec<Submission>,
    reject_broadcast: Option<String>,
    /// Accepted but never mined
    stall_next: usize,
    auto_mine: bool,
    revert: bool,
}

/// A tiny in-memory chain: accepts raw transactions and mines them into
/// one block each unless told to stall
pub(crate) struct FakeNode {
    state: Mutex<FakeState>,
}

impl FakeNode {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                nonces: HashMap::new(),
                nonce_fetches: 0,
                fail_nonce_fetch: false,
                gas_price: U256::exp10(9),
                estimate: Ok(U256::from(21_000)),
                call_result: Ok(Bytes::default()),
                head: 100,
                receipts: HashMap::new(),
                submissions: Vec::new(),
                reject_broadcast: None,
                stall_next: 0,
                auto_mine: true,
                revert: false,
            }),
        }
    }

    pub fn set_nonce(&self, account: Address, nonce: u64) {
        self.state.lock().unwrap().nonces.insert(account, nonce);
    }

    pub fn nonce_fetches(&self) -> usize {
        self.state.lock().unwrap().nonce_fetches
    }

    pub fn fail_nonce_fetch(&self, fail: bool) {
        self.state.lock().unwrap().fail_nonce_fetch = fail;
    }

    pub fn set_gas_price(&self, price: impl Into<U256>) {
        self.state.lock().unwrap().gas_price = price.into();
    }

    pub fn set_estimate(&self, estimate: Result<u64, &str>) {
        self.state.lock().unwrap().estimate = estimate.map(U256::from).map_err(str::to_string);
    }

    pub fn set_call_result(&self, result: Result<Bytes, &str>) {
        self.state.lock().unwrap().call_result = result.map_err(str::to_string);
    }

    pub fn reject_broadcasts(&self, reason: Option<&str>) {
        self.state.lock().unwrap().reject_broadcast = reason.map(str::to_string);
    }

    /// Accept the next `count` transactions without ever mining them
    pub fn stall_next(&self, count: usize) {
        self.state.lock().unwrap().stall_next = count;
    }

    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.state.lock().unwrap().auto_mine = auto_mine;
    }

    /// Mined receipts report a failed execution
    pub fn set_revert(&self, revert: bool) {
        self.state.lock().unwrap().revert = revert;
    }

    /// Mine an accepted transaction into a new block
    pub fn mine(&self, hash: H256) {
        let mut state = self.state.lock().unwrap();
        mine_into(&mut state, hash);
    }

    pub fn advance(&self, blocks: u64) {
        self.state.lock().unwrap().head += blocks;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }
}

fn mine_into(state: &mut FakeState, hash: H256) {
    state.head += 1;
    let receipt = TransactionReceipt {
        transaction_hash: hash,
        block_number: Some(U64::from(state.head)),
        status: Some(U64::from(if state.revert { 0 } else { 1 })),
        ..Default::default()
    };
    state.receipts.insert(hash, receipt);
}

#[async_trait]
impl NodeClient for FakeNode {
    async fn estimate_gas(&self, _tx: &TypedTransaction) -> DeliveryResult<U256> {
        self.state
            .lock()
            .unwrap()
            .estimate
            .clone()
            .map_err(DeliveryError::GasEstimation)
    }

    async fn suggest_gas_price(&self) -> DeliveryResult<U256> {
        Ok(self.state.lock().unwrap().gas_price)
    }

    async fn pending_nonce_at(&self, account: Address) -> DeliveryResult<u64> {
        let mut state = self.state.lock().unwrap();
        if state.fail_nonce_fetch {
            return Err(DeliveryError::rpc("eth_getTransactionCount", "node unavailable"));
        }
        state.nonce_fetches += 1;
        Ok(state.nonces.get(&account).copied().unwrap_or(0))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> DeliveryResult<H256> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.reject_broadcast {
            return Err(DeliveryError::Broadcast(reason.clone()));
        }

        let hash = H256::from(keccak256(&raw));
        state.submissions.push(Submission { hash, raw });

        if state.stall_next > 0 {
            state.stall_next -= 1;
        } else if state.auto_mine {
            mine_into(&mut state, hash);
        }
        Ok(hash)
    }

    async fn transaction_receipt(&self, hash: H256) -> DeliveryResult<Option<TransactionReceipt>> {
        Ok(self.state.lock().unwrap().receipts.get(&hash).cloned())
    }

    async fn block_number(&self) -> DeliveryResult<u64> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn call(&self, _tx: &TypedTransaction) -> DeliveryResult<Bytes> {
        self.state
            .lock()
            .unwrap()
            .call_result
            .clone()
            .map_err(|e| DeliveryError::rpc("eth_call", e))
    }

    async fn chain_id(&self) -> DeliveryResult<u64> {
        Ok(CHAIN_ID)
    }
}
