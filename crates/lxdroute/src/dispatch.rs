//! Fixed-size task dispatcher.
//!
//! `N` workers drain one unbounded queue, so `submit` never blocks. Tasks are
//! fire-and-forget: there is no result channel, and a task reports its outcome
//! through whatever shared state it captured. Execution order across workers
//! is not the submission order.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

type Task = BoxFuture<'static, ()>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher is shut down")]
    Closed,
}

pub struct TaskDispatcher {
    tx: StdMutex<Option<mpsc::UnboundedSender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl TaskDispatcher {
    /// Spawn `size` workers (at least one) on the current runtime.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let task = { rx.lock().await.recv().await };
                        let Some(task) = task else { break };
                        // Run on its own task so a panic is contained and reported.
                        if let Err(e) = tokio::spawn(task).await
                            && e.is_panic()
                        {
                            tracing::error!(worker = worker_id, "Dispatched task panicked");
                        }
                    }
                    tracing::trace!(worker = worker_id, "Dispatcher worker stopped");
                })
            })
            .collect();

        Self {
            tx: StdMutex::new(Some(tx)),
            workers: Mutex::new(workers),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().map(|tx| tx.is_none()).unwrap_or(true)
    }

    /// Enqueue a unit of work. Never blocks.
    pub fn submit<F>(&self, task: F) -> Result<(), DispatchError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.tx.lock().map_err(|_| DispatchError::Closed)?;
        let tx = guard.as_ref().ok_or(DispatchError::Closed)?;
        tx.send(Box::pin(task)).map_err(|_| DispatchError::Closed)
    }

    /// Stop accepting tasks, let workers drain the queue, and wait for them.
    pub async fn shutdown(&self) {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tx);

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Dispatcher worker ended abnormally");
            }
        }
    }
}
