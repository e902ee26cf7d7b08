//! Broadcast protection
//!
//! After a successful send the broadcaster watches the message until one of
//! its transactions is confirmed. A transaction that does not show up within
//! the receipt timeout is replaced at the same nonce with a higher gas price,
//! and every earlier hash stays on the watch list since any of them may be
//! the one that lands.
//!
//! A replacement that fails on a transport error is retried in the next
//! window. A permanent node rejection or a configuration error ends the loop.

use super::manager::{ReceiptWait, TransactionManager};
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::{MsgId, MsgStatus, Receipt, Request, Response};

use ethers::types::H256;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BroadcasterSettings {
    /// Depth a receipt needs before the message is finalized
    pub confirmations: u64,
    /// How long to wait for a send to record its response
    pub response_timeout: Duration,
    /// How long a broadcast may stay unmined before it is replaced
    pub receipt_timeout: Duration,
    /// `None` keeps escalating until something lands
    pub max_replacements: Option<u32>,
}

impl Default for BroadcasterSettings {
    fn default() -> Self {
        Self {
            confirmations: 1,
            response_timeout: Duration::from_secs(30),
            receipt_timeout: Duration::from_secs(120),
            max_replacements: None,
        }
    }
}

/// Sends messages and keeps them alive until confirmed
pub struct Broadcaster {
    manager: Arc<TransactionManager>,
    settings: BroadcasterSettings,
}

impl Broadcaster {
    pub fn new(manager: Arc<TransactionManager>, settings: BroadcasterSettings) -> Self {
        Self { manager, settings }
    }

    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Send `request` and start protecting it. A failed send is returned
    /// as-is and never protected.
    pub async fn send_msg(&self, request: Request) -> DeliveryResult<Response> {
        let id = request.id;
        let response = self.manager.send_msg(request).await?;
        self.protect(id);
        Ok(response)
    }

    pub async fn call_and_send_msg(&self, request: Request) -> DeliveryResult<Response> {
        let id = request.id;
        let response = self.manager.call_and_send_msg(request).await?;
        self.protect(id);
        Ok(response)
    }

    /// Spawn the protection loop for an already sent message
    pub fn protect(&self, id: MsgId) -> JoinHandle<DeliveryResult<Option<Receipt>>> {
        let manager = self.manager.clone();
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let result = protect_msg(&manager, &settings, id).await;
            if let Err(e) = &result {
                error!(%id, "Broadcast protection stopped: {}", e);
            }
            result
        })
    }
}

/// Returns `None` when there was nothing to protect
async fn protect_msg(
    manager: &TransactionManager,
    settings: &BroadcasterSettings,
    id: MsgId,
) -> DeliveryResult<Option<Receipt>> {
    let mut hashes: Vec<H256> = Vec::new();
    let mut replacements = 0u32;

    loop {
        let response = match manager
            .wait_msg_response(&id, settings.response_timeout)
            .await?
        {
            Some(response) => response,
            None => {
                warn!(%id, "No response recorded, abandoning protection");
                return Ok(None);
            }
        };

        if let Some(err) = &response.err {
            warn!(%id, err = %err, "Send failed, nothing to protect");
            return Ok(None);
        }
        let hash = match response.tx_hash() {
            Some(hash) => hash,
            None => return Ok(None),
        };
        if !hashes.contains(&hash) {
            hashes.push(hash);
        }

        match manager
            .wait_any_tx_receipt(&hashes, settings.confirmations, settings.receipt_timeout)
            .await
        {
            ReceiptWait::Confirmed(receipt) => {
                return manager.record_receipt(&id, receipt).await.map(Some);
            }
            ReceiptWait::Mined(receipt) => {
                debug!(%id, tx_hash = ?receipt.transaction_hash, "Mined, waiting for confirmations");
                let msg = manager.storage().get_msg(&id).await?;
                if let Some(receipt) = msg.receipt {
                    return Ok(Some(receipt));
                }
                if msg.status < MsgStatus::OnChain {
                    manager
                        .storage()
                        .update_msg_status(&id, MsgStatus::OnChain)
                        .await?;
                }
                continue;
            }
            ReceiptWait::NotFound => {}
        }

        // Another waiter may have finalized it meanwhile
        if let Some(receipt) = manager.storage().get_msg(&id).await?.receipt {
            return Ok(Some(receipt));
        }

        if let Some(max) = settings.max_replacements {
            if replacements >= max {
                return Err(DeliveryError::EscalationLimit {
                    id,
                    attempts: replacements,
                });
            }
        }

        info!(%id, watched = hashes.len(), "No receipt in time, escalating gas price");
        match manager.replace_msg_with_higher_gas_price(&id).await {
            Ok(_) => replacements += 1,
            Err(e) if e.is_retryable() && !e.is_node_rejection() => {
                // Previous broadcast stays on the watch list for the next window
                warn!(%id, "Replacement failed, retrying next window: {}", e);
            }
            Err(e) => {
                // An earlier broadcast may have landed while we were replacing
                warn!(%id, "Replacement rejected, checking earlier broadcasts: {}", e);
                if let ReceiptWait::Confirmed(receipt) = manager
                    .wait_any_tx_receipt(&hashes, settings.confirmations, settings.receipt_timeout)
                    .await
                {
                    return manager.record_receipt(&id, receipt).await.map(Some);
                }
                return Err(e);
            }
        }
    }
}
