use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::registry::BackgroundWork;
use crate::config::WorkerConfig;
use crate::error::{HubError, HubResult};
use crate::wecom::OutboundSender;

/// One unit of detached handler work plus where to report its outcome.
pub struct BackgroundTask {
    pub agent_id: u64,
    pub user_id: String,
    pub label: String,
    pub work: BackgroundWork,
}

/// A report that could not be delivered even after the retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub agent_id: u64,
    pub user_id: String,
    pub text: String,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

struct PoolShared {
    outbound: Arc<dyn OutboundSender>,
    retry_delay: Duration,
    dead_letters: StdMutex<VecDeque<DeadLetter>>,
    dead_letter_capacity: usize,
}

/// Fixed set of workers draining a bounded queue.
pub struct WorkerPool {
    sender: StdMutex<Option<mpsc::Sender<BackgroundTask>>>,
    shared: Arc<PoolShared>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    drain_grace: Duration,
}

impl WorkerPool {
    /// Spawn the workers; must be called inside a tokio runtime.
    pub fn start(config: &WorkerConfig, outbound: Arc<dyn OutboundSender>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let shared = Arc::new(PoolShared {
            outbound,
            retry_delay: Duration::from_millis(config.report_retry_delay_ms),
            dead_letters: StdMutex::new(VecDeque::new()),
            dead_letter_capacity: config.dead_letter_capacity.max(1),
        });

        let workers = (0..config.count.max(1))
            .map(|idx| {
                let rx = rx.clone();
                let shared = shared.clone();
                tokio::spawn(async move {
                    loop {
                        // Lock only while waiting for the next task.
                        let next = { rx.lock().await.recv().await };
                        match next {
                            Some(task) => shared.run(idx, task).await,
                            None => break,
                        }
                    }
                    debug!("[Worker {}] Queue closed, exiting", idx);
                })
            })
            .collect();
        info!(
            "[WorkerPool] Started {} workers (queue capacity {})",
            config.count, config.queue_capacity
        );

        Self {
            sender: StdMutex::new(Some(tx)),
            shared,
            workers: StdMutex::new(workers),
            drain_grace: Duration::from_millis(config.drain_grace_ms),
        }
    }

    /// Queue work without waiting; a full queue is reported as `Busy`.
    pub fn enqueue(&self, task: BackgroundTask) -> HubResult<()> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| HubError::Scheduler("worker queue lock poisoned".to_string()))?;
        let sender = guard.as_ref().ok_or(HubError::Busy)?;
        sender.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) => {
                warn!(
                    "[WorkerPool] Queue full, rejecting '{}' for {}",
                    task.label, task.user_id
                );
                HubError::Busy
            }
            mpsc::error::TrySendError::Closed(_) => HubError::Busy,
        })
    }

    /// Stop accepting work; queued tasks still run.
    pub fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    /// Close the queue and wait up to the drain grace for the workers to
    /// finish it. Returns `false` when work was still running at the
    /// deadline; that work is left to complete on its own.
    pub async fn drain(&self) -> bool {
        self.close();
        let handles: Vec<_> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        match tokio::time::timeout(self.drain_grace, join_all(handles)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    "[WorkerPool] Work still running after {:?}, not waiting for it",
                    self.drain_grace
                );
                false
            }
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared
            .dead_letters
            .lock()
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl PoolShared {
    async fn run(&self, worker: usize, task: BackgroundTask) {
        let BackgroundTask {
            agent_id,
            user_id,
            label,
            work,
        } = task;
        debug!("[Worker {}] Running '{}' for {}", worker, label, user_id);

        let report = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(Some(text))) => Some(text),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!("[Worker {}] '{}' failed: {}", worker, label, e);
                Some(e.to_string())
            }
            Err(_) => {
                error!("[Worker {}] '{}' panicked", worker, label);
                Some(format!("{} failed unexpectedly", label))
            }
        };

        if let Some(text) = report {
            self.report(agent_id, &user_id, text).await;
        }
    }

    async fn report(&self, agent_id: u64, user_id: &str, text: String) {
        let first = self.outbound.send_text(agent_id, user_id, &text).await;
        let Err(first_err) = first else {
            return;
        };
        warn!(
            "[WorkerPool] Report to {} failed ({}), retrying in {:?}",
            user_id, first_err, self.retry_delay
        );
        tokio::time::sleep(self.retry_delay).await;

        if let Err(e) = self.outbound.send_text(agent_id, user_id, &text).await {
            error!(
                "[WorkerPool] Report to {} dropped after retry: {}",
                user_id, e
            );
            if let Ok(mut letters) = self.dead_letters.lock() {
                if letters.len() == self.dead_letter_capacity {
                    letters.pop_front();
                }
                letters.push_back(DeadLetter {
                    agent_id,
                    user_id: user_id.to_string(),
                    text,
                    error: e.to_string(),
                    recorded_at: Utc::now(),
                });
            }
        }
    }
}
