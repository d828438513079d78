use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::forwarder::dispatch::{DispatchPlan, Dispatcher};
use crate::platform::InboundMessage;

/// One (message, target) forwarding job
#[derive(Debug)]
pub struct DispatchJob {
    pub id: Uuid,
    pub message: Arc<InboundMessage>,
    pub target: String,
    pub plan: Arc<DispatchPlan>,
}

/// Producer side of the work queue. Sending never blocks.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<DispatchJob>,
}

impl JobQueue {
    /// Returns false if every worker has stopped
    pub fn push(&self, job: DispatchJob) -> bool {
        match self.tx.send(job) {
            Ok(()) => true,
            Err(mpsc::error::SendError(job)) => {
                error!("Work queue closed, dropping job {} for {}", job.id, job.target);
                false
            }
        }
    }
}

/// Fixed-size pool of tasks draining the work queue
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers on the current tokio runtime
    pub fn spawn(size: usize, dispatcher: Arc<Dispatcher>) -> (JobQueue, WorkerPool) {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..size.max(1))
            .map(|n| {
                let rx = rx.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { run_worker(n, rx, dispatcher).await })
            })
            .collect::<Vec<_>>();

        info!("Started {} forwarding worker(s)", handles.len());
        (JobQueue { tx }, WorkerPool { handles })
    }

    /// Wait until the queue is closed and drained. The queue closes once
    /// every `JobQueue` clone has been dropped.
    pub async fn join(self) {
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!("Forwarding worker panicked: {}", e);
            }
        }
    }
}

async fn run_worker(
    n: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<DispatchJob>>>,
    dispatcher: Arc<Dispatcher>,
) {
    loop {
        // Hold the lock only while waiting for the next job
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
            debug!("Worker {} stopping: queue closed", n);
            return;
        };

        debug!(
            "Worker {} running job {} ({} -> {})",
            n, job.id, job.message.group_id, job.target
        );
        let outcome = dispatcher
            .dispatch(&job.message, &job.target, &job.plan)
            .await;
        debug!("Job {} finished: {:?}", job.id, outcome);
    }
}
