//! Transaction manager: builds, signs, broadcasts and tracks messages
//!
//! Every message moves through `NonceAssigned -> Inflight` here. A stuck
//! message is replaced by re-signing its last transaction with the same
//! nonce at a higher gas price, so transactions already queued behind it at
//! higher nonces stay valid.

use super::gas::{escalate_gas_price, GasEstimator};
use super::nonce::NonceAllocator;
use super::signer::TxSigner;
use crate::chain::NodeClient;
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::{MsgId, MsgStatus, Receipt, Request, Response, SignedTx};
use crate::storage::MsgStorage;

use chrono::Utc;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::transaction::eip2930::Eip2930TransactionRequest;
use ethers::types::{Address, Bytes, TransactionReceipt, TransactionRequest, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Manager tuning
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Signing is refused until this is known
    pub chain_id: Option<u64>,
    /// Delay between polls in the `wait_*` operations
    pub poll_interval: Duration,
    /// Gas limit used when estimation fails; also caps padded estimates
    pub fallback_gas_limit: Option<u64>,
    /// Replacements never pay more than this
    pub max_gas_price: Option<U256>,
}

impl ManagerSettings {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id: Some(chain_id),
            poll_interval: Duration::from_secs(1),
            fallback_gas_limit: None,
            max_gas_price: None,
        }
    }
}

/// Result of watching one or more transaction hashes
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptWait {
    /// Included at least `confirmations` blocks below the head
    Confirmed(TransactionReceipt),
    /// Included, but not deep enough yet when the wait ended
    Mined(TransactionReceipt),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SendKind {
    /// The nonce was just reserved for this send
    Fresh,
    /// Re-broadcast of an existing nonce
    Replacement,
}

/// Transaction lifecycle driver
pub struct TransactionManager {
    node: Arc<dyn NodeClient>,
    storage: Arc<dyn MsgStorage>,
    nonces: Arc<NonceAllocator>,
    gas: GasEstimator,
    signers: RwLock<Vec<Arc<dyn TxSigner>>>,
    settings: ManagerSettings,
}

impl TransactionManager {
    pub fn new(
        node: Arc<dyn NodeClient>,
        storage: Arc<dyn MsgStorage>,
        nonces: Arc<NonceAllocator>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            node,
            storage,
            nonces,
            gas: GasEstimator::new(settings.fallback_gas_limit),
            signers: RwLock::new(Vec::new()),
            settings,
        }
    }

    /// Append a signing capability; earlier registrations are tried first
    pub async fn register_signer(&self, signer: Arc<dyn TxSigner>) {
        self.signers.write().await.push(signer);
    }

    pub fn storage(&self) -> &Arc<dyn MsgStorage> {
        &self.storage
    }

    pub fn node(&self) -> &Arc<dyn NodeClient> {
        &self.node
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    fn chain_id(&self) -> DeliveryResult<u64> {
        self.settings
            .chain_id
            .filter(|id| *id != 0)
            .ok_or_else(|| DeliveryError::Config("chain id is not configured".to_string()))
    }

    async fn ensure_signer(&self) -> DeliveryResult<()> {
        if self.signers.read().await.is_empty() {
            return Err(DeliveryError::NoSigner);
        }
        Ok(())
    }

    async fn ensure_stored(&self, request: &Request) -> DeliveryResult<()> {
        if self.storage.has_msg(&request.id).await? {
            return Ok(());
        }
        match self.storage.add_msg(request.clone()).await {
            Ok(()) | Err(DeliveryError::DuplicateMsg(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Build an unsigned transaction for `request`.
    ///
    /// Gas and price are resolved before the nonce so a failed estimate never
    /// consumes one. Pass `nonce` to reuse an existing one.
    pub async fn new_transaction(
        &self,
        request: &Request,
        nonce: Option<u64>,
    ) -> DeliveryResult<TypedTransaction> {
        let chain_id = self.chain_id()?;
        let mut tx = base_transaction(request);

        let gas = self
            .gas
            .resolve_gas_limit(self.node.as_ref(), request, &tx)
            .await?;
        let gas_price = self.gas.resolve_gas_price(self.node.as_ref(), request).await?;
        let nonce = match nonce {
            Some(nonce) => nonce,
            None => self.nonces.pending_nonce_at(request.from).await?,
        };

        tx.set_gas(gas);
        tx.set_gas_price(gas_price);
        tx.set_nonce(nonce);
        tx.set_chain_id(chain_id);

        Ok(tx)
    }

    /// Sign with the first registered signer that accepts `from`
    async fn sign(&self, from: Address, tx: &TypedTransaction) -> DeliveryResult<SignedTx> {
        let signers = self.signers.read().await.clone();
        if signers.is_empty() {
            return Err(DeliveryError::NoSigner);
        }

        for signer in signers {
            match signer.sign(from, tx).await {
                Ok(signature) => return Ok(SignedTx::new(tx.clone(), signature)),
                Err(DeliveryError::NotAuthorized(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(DeliveryError::NotAuthorized(from))
    }

    /// Build, sign and broadcast a stored or new request.
    ///
    /// Concurrent sends from one account are allowed. When an older one
    /// fails after a newer one reserved its nonce, the allocator drops its
    /// counter and the next send fills the gap from the node's pending count.
    pub async fn send_msg(&self, request: Request) -> DeliveryResult<Response> {
        self.ensure_signer().await?;
        self.ensure_stored(&request).await?;

        let tx = self.new_transaction(&request, None).await?;
        self.sign_and_broadcast(&request, tx, SendKind::Fresh, None)
            .await
    }

    /// Execute `request` as a read-only call and return its output
    pub async fn call_msg(&self, request: &Request) -> DeliveryResult<Bytes> {
        let tx = base_transaction(request);
        self.node.call(&tx).await
    }

    /// Dry-run `request` first, then send it, keeping the call output in the
    /// response
    pub async fn call_and_send_msg(&self, request: Request) -> DeliveryResult<Response> {
        self.ensure_signer().await?;
        self.ensure_stored(&request).await?;

        let return_data = self.call_msg(&request).await?;
        let tx = self.new_transaction(&request, None).await?;
        self.sign_and_broadcast(&request, tx, SendKind::Fresh, Some(return_data))
            .await
    }

    /// Re-sign the message's last transaction with the same nonce at
    /// `floor(old_price * 1.2)` and broadcast it
    pub async fn replace_msg_with_higher_gas_price(&self, id: &MsgId) -> DeliveryResult<Response> {
        let msg = self.storage.get_msg(id).await?;
        let prev = msg
            .latest_tx()
            .cloned()
            .ok_or(DeliveryError::NoPriorBroadcast(*id))?;

        let nonce = prev
            .nonce()
            .ok_or_else(|| DeliveryError::Internal("broadcast transaction has no nonce".into()))?;
        let old_price = prev
            .gas_price()
            .ok_or_else(|| DeliveryError::Internal("broadcast transaction has no gas price".into()))?;
        let new_price =
            escalate_gas_price(old_price).ok_or(DeliveryError::GasPriceCapExceeded {
                price: old_price,
                cap: self.settings.max_gas_price.unwrap_or(U256::MAX),
            })?;

        if let Some(cap) = self.settings.max_gas_price {
            if new_price > cap {
                return Err(DeliveryError::GasPriceCapExceeded {
                    price: new_price,
                    cap,
                });
            }
        }

        info!(
            %id,
            %nonce,
            %old_price,
            %new_price,
            prev_hash = ?prev.hash,
            "Replacing transaction with higher gas price"
        );

        let mut tx = prev.tx.clone();
        tx.set_gas_price(new_price);

        let response = self
            .sign_and_broadcast(&msg.request, tx, SendKind::Replacement, None)
            .await?;

        let mut msg = self.storage.get_msg(id).await?;
        msg.request.gas_price = new_price;
        self.storage.update_msg(msg).await?;

        crate::metrics::record_msg_replaced(self.settings.chain_id.unwrap_or_default());
        Ok(response)
    }

    async fn sign_and_broadcast(
        &self,
        request: &Request,
        tx: TypedTransaction,
        kind: SendKind,
        return_data: Option<Bytes>,
    ) -> DeliveryResult<Response> {
        let id = request.id;
        let nonce = tx.nonce().map(|n| n.as_u64()).unwrap_or_default();

        if let Err(e) = self
            .storage
            .update_msg_status(&id, MsgStatus::NonceAssigned)
            .await
        {
            self.release_nonce(request.from, nonce, kind).await;
            return Err(e);
        }

        let signed = match self.sign(request.from, &tx).await {
            Ok(signed) => signed,
            Err(e) => {
                self.abort_send(request, nonce, kind, None, &e).await;
                return Err(e);
            }
        };

        match self.node.send_raw_transaction(signed.raw.clone()).await {
            Ok(hash) if hash != signed.hash => {
                warn!(%id, local = ?signed.hash, node = ?hash, "Node reported a different hash");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%id, nonce, "Broadcast failed: {}", e);
                self.abort_send(request, nonce, kind, Some(signed), &e).await;
                return Err(e);
            }
        }

        self.storage
            .update_msg_status(&id, MsgStatus::Inflight)
            .await?;

        let response = Response {
            id,
            tx: Some(signed),
            return_data,
            err: None,
        };
        self.storage.update_response(response.clone()).await?;

        info!(
            %id,
            from = ?request.from,
            nonce,
            tx_hash = ?response.tx_hash(),
            "Transaction sent"
        );
        if kind == SendKind::Fresh {
            crate::metrics::record_msg_sent(self.settings.chain_id.unwrap_or_default());
        }

        Ok(response)
    }

    /// Undo the bookkeeping of a send that did not reach the node
    async fn abort_send(
        &self,
        request: &Request,
        nonce: u64,
        kind: SendKind,
        signed: Option<SignedTx>,
        err: &DeliveryError,
    ) {
        crate::metrics::record_send_failure(self.settings.chain_id.unwrap_or_default());

        match kind {
            SendKind::Fresh => {
                if err.to_string().to_lowercase().contains("nonce too low") {
                    self.nonces.forget(request.from).await;
                } else {
                    self.release_nonce(request.from, nonce, kind).await;
                }

                if signed.is_some() {
                    let response = Response::failed(request.id, signed, err);
                    if let Err(e) = self.storage.update_response(response).await {
                        warn!(id = %request.id, "Failed to record broadcast error: {}", e);
                    }
                }
            }
            SendKind::Replacement => {
                // The previous transaction is still live
                if let Err(e) = self
                    .storage
                    .update_msg_status(&request.id, MsgStatus::Inflight)
                    .await
                {
                    warn!(id = %request.id, "Failed to restore status: {}", e);
                }
            }
        }
    }

    async fn release_nonce(&self, account: Address, nonce: u64, kind: SendKind) {
        if kind == SendKind::Fresh && !self.nonces.release(account, nonce).await {
            debug!(?account, nonce, "Nonce not handed back, next send re-reads the node");
        }
    }

    /// Wait until `hash` is `confirmations` blocks deep
    pub async fn wait_tx_receipt(
        &self,
        hash: H256,
        confirmations: u64,
        timeout: Duration,
    ) -> Option<TransactionReceipt> {
        match self.wait_any_tx_receipt(&[hash], confirmations, timeout).await {
            ReceiptWait::Confirmed(receipt) => Some(receipt),
            _ => None,
        }
    }

    /// Wait until any of `hashes` is `confirmations` blocks deep.
    ///
    /// RPC errors while polling are logged and retried until the deadline.
    pub async fn wait_any_tx_receipt(
        &self,
        hashes: &[H256],
        confirmations: u64,
        timeout: Duration,
    ) -> ReceiptWait {
        let deadline = Instant::now() + timeout;
        let mut mined = None;

        loop {
            match self.check_receipts(hashes, confirmations).await {
                Ok(ReceiptWait::Confirmed(receipt)) => return ReceiptWait::Confirmed(receipt),
                Ok(ReceiptWait::Mined(receipt)) => mined = Some(receipt),
                Ok(ReceiptWait::NotFound) => mined = None,
                Err(e) => warn!(?hashes, "Receipt poll failed: {}", e),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.settings.poll_interval.min(deadline - now)).await;
        }

        match mined {
            Some(receipt) => ReceiptWait::Mined(receipt),
            None => ReceiptWait::NotFound,
        }
    }

    async fn check_receipts(
        &self,
        hashes: &[H256],
        confirmations: u64,
    ) -> DeliveryResult<ReceiptWait> {
        let mut cached_head = None;
        let mut mined = None;

        for hash in hashes {
            let receipt = match self.node.transaction_receipt(*hash).await? {
                Some(receipt) => receipt,
                None => continue,
            };
            let block = match receipt.block_number {
                Some(block) => block.as_u64(),
                None => continue,
            };

            let head = match cached_head {
                Some(head) => head,
                None => {
                    let head = self.node.block_number().await?;
                    cached_head = Some(head);
                    head
                }
            };

            if block + confirmations <= head {
                return Ok(ReceiptWait::Confirmed(receipt));
            }
            debug!(?hash, block, head, confirmations, "Transaction mined, waiting for depth");
            mined = Some(receipt);
        }

        Ok(match mined {
            Some(receipt) => ReceiptWait::Mined(receipt),
            None => ReceiptWait::NotFound,
        })
    }

    /// Wait until the message has a response
    pub async fn wait_msg_response(
        &self,
        id: &MsgId,
        wait: Duration,
    ) -> DeliveryResult<Option<Response>> {
        match timeout(wait, self.poll_msg_response(id)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn poll_msg_response(&self, id: &MsgId) -> DeliveryResult<Response> {
        loop {
            match self.storage.get_msg(id).await {
                Ok(msg) => {
                    if let Some(response) = msg.response {
                        return Ok(response);
                    }
                }
                Err(DeliveryError::MsgNotFound(_)) => {}
                Err(e) => return Err(e),
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    /// Wait until the message has a receipt at `confirmations` depth.
    ///
    /// Besides watching storage this checks the latest broadcast on the node
    /// and records the receipt itself once it is deep enough.
    pub async fn wait_msg_receipt(
        &self,
        id: &MsgId,
        confirmations: u64,
        wait: Duration,
    ) -> DeliveryResult<Option<Receipt>> {
        match timeout(wait, self.poll_msg_receipt(id, confirmations)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn poll_msg_receipt(&self, id: &MsgId, confirmations: u64) -> DeliveryResult<Receipt> {
        loop {
            let msg = self.storage.get_msg(id).await?;
            if let Some(receipt) = msg.receipt {
                return Ok(receipt);
            }

            if let Some(hash) = msg.response.as_ref().and_then(|r| r.tx_hash()) {
                match self.check_receipts(&[hash], confirmations).await {
                    Ok(ReceiptWait::Confirmed(receipt)) => {
                        return self.record_receipt(id, receipt).await;
                    }
                    Ok(ReceiptWait::Mined(_)) if msg.status < MsgStatus::OnChain => {
                        self.storage.update_msg_status(id, MsgStatus::OnChain).await?;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(%id, "Receipt poll failed: {}", e),
                }
            }

            sleep(self.settings.poll_interval).await;
        }
    }

    /// Store a confirmed receipt and finalize the message.
    ///
    /// A reverted execution is still final; it is never escalated.
    pub async fn record_receipt(
        &self,
        id: &MsgId,
        tx_receipt: TransactionReceipt,
    ) -> DeliveryResult<Receipt> {
        let receipt = Receipt {
            id: *id,
            tx_receipt,
        };
        self.storage.update_receipt(receipt.clone()).await?;
        self.storage.update_msg_status(id, MsgStatus::Finalized).await?;

        let chain_id = self.settings.chain_id.unwrap_or_default();
        let tx_hash = receipt.tx_receipt.transaction_hash;
        if receipt.succeeded() {
            info!(%id, ?tx_hash, "Message finalized");
        } else {
            warn!(%id, ?tx_hash, "Message finalized with failed execution");
            crate::metrics::record_receipt_reverted(chain_id);
        }

        if let Ok(msg) = self.storage.get_msg(id).await {
            let latency = (Utc::now() - msg.created_at).num_milliseconds().max(0) as f64 / 1000.0;
            crate::metrics::record_msg_finalized(chain_id, latency);
        }

        Ok(receipt)
    }
}

/// Unsigned transaction carrying only what the request specifies
fn base_transaction(request: &Request) -> TypedTransaction {
    let mut tx = TransactionRequest::new()
        .from(request.from)
        .value(request.value)
        .data(request.data.clone());
    if let Some(to) = request.to {
        tx = tx.to(to);
    }

    match &request.access_list {
        Some(access_list) => {
            TypedTransaction::Eip2930(Eip2930TransactionRequest::new(tx, access_list.clone()))
        }
        None => TypedTransaction::Legacy(tx),
    }
}
