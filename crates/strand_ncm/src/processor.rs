//! Worker pool abstraction the manager fans configurations out to.
//!
//! Each worker is a task draining a FIFO mailbox; per-worker ordering is the
//! property the publish pipeline leans on. The processor also owns the
//! process-wide updateable configuration slot read by non-worker consumers.

use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use strand_membership::NodesConfiguration;

/// Invoked on a worker after its local configuration reference changed.
pub type ConfigUpdateHook = Arc<dyn Fn(&WorkerContext, &Arc<NodesConfiguration>) + Send + Sync>;

type WorkerTask = Box<dyn FnOnce(&WorkerContext) + Send>;

/// Per-worker state visible to posted tasks.
pub struct WorkerContext {
    index: usize,
    nodes_configuration: RwLock<Option<Arc<NodesConfiguration>>>,
}

impl WorkerContext {
    pub fn index(&self) -> usize {
        self.index
    }

    /// The last configuration this worker accepted.
    pub fn nodes_configuration(&self) -> Option<Arc<NodesConfiguration>> {
        self.nodes_configuration.read().unwrap().clone()
    }

    pub(crate) fn set_nodes_configuration(&self, config: Arc<NodesConfiguration>) {
        *self.nodes_configuration.write().unwrap() = Some(config);
    }
}

struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerTask>,
    task: JoinHandle<()>,
}

/// Fixed-size worker pool with a process-wide updateable configuration
/// slot.
pub struct Processor {
    contexts: Vec<Arc<WorkerContext>>,
    workers: RwLock<Vec<WorkerHandle>>,
    updateable_nc: RwLock<Option<Arc<NodesConfiguration>>>,
    update_hook: Option<ConfigUpdateHook>,
}

impl Processor {
    pub fn new(num_workers: usize) -> Arc<Self> {
        Self::with_update_hook(num_workers, None)
    }

    pub fn with_update_hook(num_workers: usize, hook: Option<ConfigUpdateHook>) -> Arc<Self> {
        assert!(num_workers > 0, "a processor needs at least one worker");
        let mut contexts = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let context = Arc::new(WorkerContext {
                index,
                nodes_configuration: RwLock::new(None),
            });
            let (tx, rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(worker_loop(context.clone(), rx));
            contexts.push(context);
            workers.push(WorkerHandle { tx, task });
        }
        Arc::new(Self {
            contexts,
            workers: RwLock::new(workers),
            updateable_nc: RwLock::new(None),
            update_hook: hook,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.contexts.len()
    }

    pub fn worker_context(&self, index: usize) -> Option<Arc<WorkerContext>> {
        self.contexts.get(index).cloned()
    }

    pub fn update_hook(&self) -> Option<ConfigUpdateHook> {
        self.update_hook.clone()
    }

    /// The process-wide configuration slot, readable from any thread.
    pub fn updateable_nodes_configuration(&self) -> Option<Arc<NodesConfiguration>> {
        self.updateable_nc.read().unwrap().clone()
    }

    pub(crate) fn publish_nodes_configuration(&self, config: Arc<NodesConfiguration>) {
        *self.updateable_nc.write().unwrap() = Some(config);
    }

    /// Post `f` to every worker mailbox; returns one acknowledgement
    /// receiver per worker. A receiver yields an error if its worker went
    /// away before running the task.
    pub fn fulfill_on_all_workers<F>(&self, f: F) -> Vec<oneshot::Receiver<()>>
    where
        F: Fn(&WorkerContext) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.workers
            .read()
            .unwrap()
            .iter()
            .map(|worker| {
                let (ack_tx, ack_rx) = oneshot::channel();
                let f = f.clone();
                let task: WorkerTask = Box::new(move |ctx| {
                    f(ctx);
                    let _ = ack_tx.send(());
                });
                // A closed mailbox surfaces through the dropped ack sender.
                let _ = worker.tx.send(task);
                ack_rx
            })
            .collect()
    }

    /// Close every worker mailbox. In-flight tasks finish; later fan-outs
    /// report workers as gone. Dropping the senders ends each worker loop.
    pub fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.write().unwrap());
        drop(workers);
    }
}

async fn worker_loop(context: Arc<WorkerContext>, mut rx: mpsc::UnboundedReceiver<WorkerTask>) {
    while let Some(task) = rx.recv().await {
        task(&context);
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        for worker in self.workers.write().unwrap().drain(..) {
            worker.task.abort();
        }
    }
}
