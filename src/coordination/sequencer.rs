//! Sequencer: turns requests into graph vertices and republishes the graph's
//! release stream as a queue of ready requests

use super::dependency::{DependencyGraph, Released};
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::{MsgId, MsgStatus, Request};
use crate::storage::MsgStorage;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct Sequencer {
    storage: Arc<dyn MsgStorage>,
    graph: DependencyGraph<MsgId>,
    released: Mutex<Released<MsgId>>,
    pending: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl Sequencer {
    /// `buffer` bounds how many released requests may wait for a consumer
    pub fn new(storage: Arc<dyn MsgStorage>, buffer: usize) -> Self {
        let (graph, released) = DependencyGraph::new(buffer);
        Self {
            storage,
            graph,
            pending: released.depth(),
            released: Mutex::new(released),
            closed: AtomicBool::new(false),
        }
    }

    /// Store `request` and schedule it after its predecessor, if any.
    ///
    /// A predecessor that has not been pushed yet holds the request back
    /// until it arrives.
    pub async fn push_msg(&self, request: Request) -> DeliveryResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeliveryError::QueueClosed);
        }

        let id = request.id;
        let after = request.after_msg;
        if after == Some(id) {
            return Err(DeliveryError::SelfDependency(id));
        }

        self.storage.add_msg(request).await?;
        self.storage.update_msg_status(&id, MsgStatus::Queued).await?;

        if let Some(pred) = after {
            self.graph
                .add_edge(pred, id)
                .await
                .map_err(|_| DeliveryError::SelfDependency(id))?;
        }
        self.graph.add_vertex(id).await;

        debug!(%id, after = ?after, "Message queued");
        crate::metrics::record_msg_pushed();
        Ok(())
    }

    /// Wait for the next released request
    pub async fn pop_msg(&self) -> DeliveryResult<Request> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeliveryError::QueueClosed);
        }

        let id = {
            let mut released = self.released.lock().await;
            released.recv().await.ok_or(DeliveryError::QueueClosed)?
        };
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeliveryError::QueueClosed);
        }

        let msg = self.storage.get_msg(&id).await?;
        debug!(%id, "Message released");
        Ok(msg.request)
    }

    /// Requests registered but not yet released by the graph
    pub async fn queued_msg_count(&self) -> usize {
        self.graph.queued_count().await
    }

    /// Released requests waiting for `pop_msg`
    pub fn pending_msg_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.graph.close().await;
            info!("Sequencer closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use ethers::types::Address;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    fn sequencer() -> (Arc<MemoryStorage>, Sequencer) {
        let storage = Arc::new(MemoryStorage::new());
        let sequencer = Sequencer::new(storage.clone(), 16);
        (storage, sequencer)
    }

    fn request(seed: &str) -> Request {
        Request::new(Address::zero()).with_id(MsgId::derive(seed.as_bytes()))
    }

    async fn pop(sequencer: &Sequencer) -> MsgId {
        timeout(Duration::from_secs(1), sequencer.pop_msg())
            .await
            .expect("pop in time")
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_chain_pops_in_order() {
        let (_, sequencer) = sequencer();
        let a = request("a");
        let b = request("b").after(a.id);
        let c = request("c").after(b.id);

        assert_ok!(sequencer.push_msg(c.clone()).await);
        assert_ok!(sequencer.push_msg(b.clone()).await);
        assert_ok!(sequencer.push_msg(a.clone()).await);

        assert_eq!(pop(&sequencer).await, a.id);
        assert_eq!(pop(&sequencer).await, b.id);
        assert_eq!(pop(&sequencer).await, c.id);
    }

    #[tokio::test]
    async fn test_tree_respects_predecessors() {
        let (_, sequencer) = sequencer();
        let root = request("root");
        let left = request("left").after(root.id);
        let right = request("right").after(root.id);
        let leaf = request("leaf").after(left.id);

        for r in [&leaf, &right, &left, &root] {
            sequencer.push_msg(r.clone()).await.unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(pop(&sequencer).await);
        }
        let at = |id: MsgId| order.iter().position(|x| *x == id).unwrap();
        assert_eq!(order[0], root.id);
        assert!(at(left.id) < at(leaf.id));
        assert!(at(root.id) < at(right.id));
    }

    #[tokio::test]
    async fn test_predecessor_pushed_later() {
        let (storage, sequencer) = sequencer();
        let first = request("first");
        let second = request("second").after(first.id);

        sequencer.push_msg(second.clone()).await.unwrap();
        assert!(timeout(Duration::from_millis(50), sequencer.pop_msg()).await.is_err());
        assert_eq!(sequencer.queued_msg_count().await, 1);
        assert_eq!(
            storage.get_msg(&second.id).await.unwrap().status,
            MsgStatus::Queued
        );

        sequencer.push_msg(first.clone()).await.unwrap();
        assert_eq!(pop(&sequencer).await, first.id);
        assert_eq!(pop(&sequencer).await, second.id);
    }

    #[tokio::test]
    async fn test_cycle_is_never_popped() {
        let (_, sequencer) = sequencer();
        let a_id = MsgId::derive(b"a");
        let b_id = MsgId::derive(b"b");

        sequencer.push_msg(request("a").after(b_id)).await.unwrap();
        sequencer.push_msg(request("b").after(a_id)).await.unwrap();

        assert!(timeout(Duration::from_millis(100), sequencer.pop_msg()).await.is_err());
        assert_eq!(sequencer.queued_msg_count().await, 2);
        assert_eq!(sequencer.pending_msg_count(), 0);
    }

    #[tokio::test]
    async fn test_independent_requests_drain() {
        let (_, sequencer) = sequencer();
        let mut ids = Vec::new();
        for i in 0..4 {
            let r = request(&format!("independent-{}", i));
            ids.push(r.id);
            sequencer.push_msg(r).await.unwrap();
        }

        timeout(Duration::from_secs(1), async {
            while sequencer.pending_msg_count() < 4 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sequencer.queued_msg_count().await, 0);

        let mut popped = Vec::new();
        for _ in 0..4 {
            popped.push(pop(&sequencer).await);
        }
        popped.sort();
        ids.sort();
        assert_eq!(popped, ids);
        assert_eq!(sequencer.pending_msg_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_self_dependency_and_duplicates() {
        let (storage, sequencer) = sequencer();
        let r = request("loop");
        let looped = r.clone().after(r.id);

        let err = assert_err!(sequencer.push_msg(looped).await);
        assert!(matches!(err, DeliveryError::SelfDependency(id) if id == r.id));
        assert!(!storage.has_msg(&r.id).await.unwrap());

        assert_ok!(sequencer.push_msg(r.clone()).await);
        let err = assert_err!(sequencer.push_msg(r).await);
        assert!(matches!(err, DeliveryError::DuplicateMsg(_)));
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let (_, sequencer) = sequencer();
        sequencer.close().await;

        let err = assert_err!(sequencer.pop_msg().await);
        assert!(matches!(err, DeliveryError::QueueClosed));
        let err = assert_err!(sequencer.push_msg(request("late")).await);
        assert!(matches!(err, DeliveryError::QueueClosed));
    }
}
