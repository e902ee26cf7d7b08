//! Dependency graph with continuous topological release
//!
//! Producers add vertices and edges; a background task emits every admitted
//! vertex whose in-degree is zero into a bounded channel, removes it and
//! decrements its successors. A vertex named only as an edge endpoint is a
//! placeholder and is not emitted until it is added itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::debug;

/// Returned by [`DependencyGraph::add_edge`] for `from == to`
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a vertex cannot depend on itself")]
pub struct SelfLoop;

#[derive(Debug)]
struct Vertex<K> {
    in_degree: usize,
    successors: HashSet<K>,
    /// False while the vertex only exists as someone's predecessor
    admitted: bool,
}

impl<K> Vertex<K> {
    fn new(admitted: bool) -> Self {
        Self {
            in_degree: 0,
            successors: HashSet::new(),
            admitted,
        }
    }
}

struct GraphInner<K> {
    vertices: HashMap<K, Vertex<K>>,
    /// Emitted vertices; re-adding one is a no-op and edges from it are
    /// already satisfied
    released: HashSet<K>,
    ready: VecDeque<K>,
}

impl<K: Clone + Eq + Hash> GraphInner<K> {
    fn pop_ready(&mut self) -> Option<K> {
        let key = self.ready.pop_front()?;
        let vertex = self.vertices.remove(&key)?;

        for successor in vertex.successors {
            if let Some(next) = self.vertices.get_mut(&successor) {
                next.in_degree -= 1;
                if next.in_degree == 0 && next.admitted {
                    self.ready.push_back(successor);
                }
            }
        }

        self.released.insert(key.clone());
        Some(key)
    }
}

/// Receiving end of the graph's release stream
pub struct Released<K> {
    rx: mpsc::Receiver<K>,
    depth: Arc<AtomicUsize>,
}

impl<K> Released<K> {
    /// Next released vertex, `None` once the graph is closed and drained
    pub async fn recv(&mut self) -> Option<K> {
        let key = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(key)
    }

    /// Released vertices not yet received
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared view of [`Released::len`] that does not need the receiver
    pub fn depth(&self) -> Arc<AtomicUsize> {
        self.depth.clone()
    }
}

/// Directed graph over vertex keys, emitting vertices in dependency order
pub struct DependencyGraph<K> {
    inner: Arc<Mutex<GraphInner<K>>>,
    notify: Arc<Notify>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl<K> Clone for DependencyGraph<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            notify: self.notify.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<K> DependencyGraph<K>
where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    /// Create a graph and spawn its release task. At most `buffer` released
    /// vertices wait in the output before the task pauses.
    pub fn new(buffer: usize) -> (Self, Released<K>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let graph = Self {
            inner: Arc::new(Mutex::new(GraphInner {
                vertices: HashMap::new(),
                released: HashSet::new(),
                ready: VecDeque::new(),
            })),
            notify: Arc::new(Notify::new()),
            shutdown: Arc::new(shutdown_tx),
        };

        let (tx, rx) = mpsc::channel(buffer.max(1));
        let depth = Arc::new(AtomicUsize::new(0));
        tokio::spawn(release_loop(
            graph.inner.clone(),
            graph.notify.clone(),
            shutdown_rx,
            tx,
            depth.clone(),
        ));

        (graph, Released { rx, depth })
    }

    /// Admit `key` for release. Idempotent.
    pub async fn add_vertex(&self, key: K) {
        let mut inner = self.inner.lock().await;
        if inner.released.contains(&key) {
            return;
        }

        let vertex = inner
            .vertices
            .entry(key.clone())
            .or_insert_with(|| Vertex::new(false));
        if vertex.admitted {
            return;
        }
        vertex.admitted = true;
        if vertex.in_degree == 0 {
            inner.ready.push_back(key);
            self.notify.notify_one();
        }
    }

    /// Require `from` to be released before `to`. Duplicate edges are
    /// no-ops, and an edge from an already released vertex is satisfied.
    pub async fn add_edge(&self, from: K, to: K) -> Result<(), SelfLoop> {
        if from == to {
            return Err(SelfLoop);
        }

        let mut inner = self.inner.lock().await;
        if inner.released.contains(&from) || inner.released.contains(&to) {
            return Ok(());
        }

        inner
            .vertices
            .entry(to.clone())
            .or_insert_with(|| Vertex::new(false));
        let added = inner
            .vertices
            .entry(from.clone())
            .or_insert_with(|| Vertex::new(false))
            .successors
            .insert(to.clone());
        if !added {
            return Ok(());
        }

        if let Some(vertex) = inner.vertices.get_mut(&to) {
            vertex.in_degree += 1;
            if vertex.in_degree == 1 && vertex.admitted {
                inner.ready.retain(|k| k != &to);
            }
        }
        debug!(?from, ?to, "Added dependency edge");
        Ok(())
    }

    /// Admitted vertices still waiting for release
    pub async fn queued_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .vertices
            .values()
            .filter(|v| v.admitted)
            .count()
    }

    /// Stop the release task, even one blocked on a full output. The
    /// output ends after what was already buffered.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

async fn release_loop<K>(
    inner: Arc<Mutex<GraphInner<K>>>,
    notify: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    tx: mpsc::Sender<K>,
    depth: Arc<AtomicUsize>,
) where
    K: Clone + Eq + Hash + Send + std::fmt::Debug + 'static,
{
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = inner.lock().await.pop_ready();

        match next {
            Some(key) => {
                debug!(?key, "Released vertex");
                depth.fetch_add(1, Ordering::SeqCst);
                tokio::select! {
                    sent = tx.send(key) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.changed() => {
                        depth.fetch_sub(1, Ordering::SeqCst);
                        break;
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = notify.notified() => {}
                    changed = shutdown.changed() => {
                        // Every graph handle is gone
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("Release task stopped");
}
