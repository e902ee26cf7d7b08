//! Dispatch loop: pops released requests and hands them to the broadcaster

use super::sequencer::Sequencer;
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::{MsgId, Request};
use crate::tx::Broadcaster;

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Delivery engine tying the sequencer to the broadcaster
pub struct DeliveryEngine {
    sequencer: Arc<Sequencer>,
    broadcaster: Arc<Broadcaster>,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl DeliveryEngine {
    pub fn new(sequencer: Arc<Sequencer>, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            sequencer,
            broadcaster,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Queue a request for delivery
    pub async fn submit(&self, request: Request) -> DeliveryResult<MsgId> {
        let id = request.id;
        self.sequencer.push_msg(request).await?;
        self.update_queue_gauges().await;
        Ok(id)
    }

    /// Main dispatch loop.
    ///
    /// Requests are sent one at a time so nonces follow release order.
    pub async fn run(&self) -> DeliveryResult<()> {
        info!("Delivery engine started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            let request = match self.sequencer.pop_msg().await {
                Ok(request) => request,
                Err(DeliveryError::QueueClosed) => break,
                Err(e) => {
                    error!("Failed to pop message: {}", e);
                    continue;
                }
            };
            self.update_queue_gauges().await;

            let id = request.id;
            let from = request.from;
            if let Err(e) = self.broadcaster.send_msg(request).await {
                if e.is_retryable() {
                    warn!(%id, ?from, "Send failed, message left unsent: {}", e);
                } else {
                    error!(%id, ?from, "Send failed: {}", e);
                }
            }
        }

        info!("Delivery engine stopped");
        Ok(())
    }

    async fn update_queue_gauges(&self) {
        crate::metrics::record_queue_depths(
            self.sequencer.queued_msg_count().await,
            self.sequencer.pending_msg_count(),
        );
    }

    /// Stop the dispatch loop; protection tasks already running continue
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        self.sequencer.close().await;
        info!("Delivery engine shutdown initiated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{test_wallet, FakeNode, CHAIN_ID};
    use crate::message::MsgStatus;
    use crate::storage::{MemoryStorage, MsgStorage};
    use crate::tx::{
        BroadcasterSettings, ManagerSettings, NonceAllocator, TransactionManager, WalletSigner,
    };
    use ethers::signers::Signer;
    use ethers::types::{Address, U256};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn engine(node: Arc<FakeNode>, storage: Arc<MemoryStorage>) -> Arc<DeliveryEngine> {
        let nonces = Arc::new(NonceAllocator::new(node.clone()));
        let manager = Arc::new(TransactionManager::new(
            node,
            storage.clone(),
            nonces,
            ManagerSettings {
                poll_interval: Duration::from_millis(5),
                ..ManagerSettings::new(CHAIN_ID)
            },
        ));
        manager
            .register_signer(Arc::new(WalletSigner::new(test_wallet())))
            .await;

        let broadcaster = Arc::new(Broadcaster::new(
            manager,
            BroadcasterSettings {
                confirmations: 0,
                response_timeout: Duration::from_secs(1),
                receipt_timeout: Duration::from_millis(50),
                max_replacements: None,
            },
        ));
        let sequencer = Arc::new(Sequencer::new(storage, 16));
        Arc::new(DeliveryEngine::new(sequencer, broadcaster))
    }

    async fn wait_finalized(storage: &MemoryStorage, id: &MsgId) {
        timeout(Duration::from_secs(2), async {
            loop {
                if storage.get_msg(id).await.unwrap().status == MsgStatus::Finalized {
                    return;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("finalized in time");
    }

    #[tokio::test]
    async fn test_dependent_messages_get_ordered_nonces() {
        let node = Arc::new(FakeNode::new());
        let storage = Arc::new(MemoryStorage::new());
        let from = test_wallet().address();
        node.set_nonce(from, 7);
        let engine = engine(node, storage.clone()).await;

        let first = Request::new(from).to(Address::random());
        let second = Request::new(from).to(Address::random()).after(first.id);

        // Dependent first: it must still go out second
        engine.submit(second.clone()).await.unwrap();
        engine.submit(first.clone()).await.unwrap();

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        wait_finalized(&storage, &first.id).await;
        wait_finalized(&storage, &second.id).await;

        let nonce = |id: MsgId| {
            let storage = storage.clone();
            async move {
                storage
                    .get_msg(&id)
                    .await
                    .unwrap()
                    .latest_tx()
                    .and_then(|tx| tx.nonce())
            }
        };
        assert_eq!(nonce(first.id).await, Some(U256::from(7)));
        assert_eq!(nonce(second.id).await, Some(U256::from(8)));

        engine.stop().await;
        timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_failure_does_not_stop_loop() {
        let node = Arc::new(FakeNode::new());
        let storage = Arc::new(MemoryStorage::new());
        let engine = engine(node.clone(), storage.clone()).await;

        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        // Nobody can sign for this sender
        let stranger = Request::new(Address::random()).to(Address::random());
        engine.submit(stranger.clone()).await.unwrap();

        let ok = Request::new(test_wallet().address()).to(Address::random());
        engine.submit(ok.clone()).await.unwrap();
        wait_finalized(&storage, &ok.id).await;

        assert!(storage.get_msg(&stranger.id).await.unwrap().response.is_none());

        engine.stop().await;
        assert!(engine.submit(Request::new(Address::random())).await.is_err());
        timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
