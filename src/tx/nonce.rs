//! Nonce allocation for reliable transaction submission
//!
//! Handles:
//! - Baseline from the node's pending transaction count on first use
//! - Local, gap-free increments afterwards
//! - Per-account locking so unrelated accounts never contend

use crate::chain::NodeClient;
use crate::error::{DeliveryError, DeliveryResult};

use dashmap::DashMap;
use ethers::types::Address;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Next nonce to hand out, `None` until the baseline is fetched
type AccountSlot = Arc<Mutex<Option<u64>>>;

/// Hands out per-account nonces, exactly one per call
pub struct NonceAllocator {
    node: Arc<dyn NodeClient>,
    accounts: DashMap<Address, AccountSlot>,
}

impl NonceAllocator {
    pub fn new(node: Arc<dyn NodeClient>) -> Self {
        Self {
            node,
            accounts: DashMap::new(),
        }
    }

    fn slot(&self, account: Address) -> AccountSlot {
        self.accounts
            .entry(account)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Reserve the next nonce for `account`.
    ///
    /// If the baseline fetch fails nothing is reserved and the next call
    /// tries the node again.
    pub async fn pending_nonce_at(&self, account: Address) -> DeliveryResult<u64> {
        let slot = self.slot(account);
        let mut next = slot.lock().await;

        let nonce = match *next {
            Some(nonce) => nonce,
            None => {
                let baseline = self.node.pending_nonce_at(account).await.map_err(|e| {
                    DeliveryError::Nonce {
                        account,
                        message: e.to_string(),
                    }
                })?;
                debug!(?account, baseline, "Fetched nonce baseline");
                baseline
            }
        };
        *next = Some(nonce + 1);

        debug!(?account, nonce, "Allocated nonce");
        Ok(nonce)
    }

    /// Hand back `nonce` after a send that never reached the node.
    ///
    /// Only the most recent reservation can be returned. An older one
    /// already has successors, so it leaves a gap at the node; the counter
    /// is dropped instead and the next allocation starts from the node's
    /// pending count, which sits at the gap. Returns whether `nonce` itself
    /// was handed back.
    pub async fn release(&self, account: Address, nonce: u64) -> bool {
        let slot = match self.accounts.get(&account) {
            Some(slot) => slot.clone(),
            None => return false,
        };
        let mut next = slot.lock().await;

        match *next {
            Some(n) if n == nonce + 1 => {
                *next = Some(nonce);
                debug!(?account, nonce, "Released nonce");
                true
            }
            Some(n) if n > nonce + 1 => {
                *next = None;
                warn!(?account, nonce, "Released out of order, resyncing from node");
                false
            }
            _ => false,
        }
    }

    /// Drop the local counter so the next call re-reads the node baseline
    pub async fn forget(&self, account: Address) {
        if let Some(slot) = self.accounts.get(&account).map(|s| s.clone()) {
            *slot.lock().await = None;
            debug!(?account, "Forgot nonce counter");
        }
    }
}
