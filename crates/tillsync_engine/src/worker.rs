//! Background batch processing.
//!
//! [`BatchWorker::dispatch`] marks a batch `processing` before returning, then
//! runs it on the tokio blocking pool. At most
//! `WorkerConfig::max_concurrent_batches` batches execute at once.
//!
//! A dispatched batch always settles. If the worker shuts down before the
//! batch gets a permit, or processing errors or panics, the batch is
//! abandoned as `failed` so it can be retried.

use crate::batch::{BatchManager, CancelFlag};
use crate::config::{RetryConfig, WorkerConfig};
use crate::error::{EngineResult, SyncError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tillsync_protocol::{BatchStatus, RecordErrorKind, SyncBatch, SyncResult};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Notified whenever a dispatched batch settles.
pub trait BatchObserver: Send + Sync {
    /// Called once per dispatch with the final result.
    fn batch_finished(&self, result: &SyncResult);
}

struct Job {
    cancel: CancelFlag,
    done: watch::Receiver<Option<SyncResult>>,
}

type Observers = Arc<RwLock<Vec<Arc<dyn BatchObserver>>>>;

/// Bounded pool executing batches in the background.
pub struct BatchWorker {
    manager: Arc<BatchManager>,
    retry: RetryConfig,
    permits: Arc<Semaphore>,
    jobs: Arc<Mutex<HashMap<String, Job>>>,
    observers: Observers,
}

impl BatchWorker {
    /// Creates a worker over a manager.
    pub fn new(manager: Arc<BatchManager>, config: &WorkerConfig, retry: RetryConfig) -> Self {
        Self {
            manager,
            retry,
            permits: Arc::new(Semaphore::new(config.max_concurrent_batches.max(1))),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            observers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Registers an observer.
    pub fn add_observer(&self, observer: Arc<dyn BatchObserver>) {
        self.observers.write().push(observer);
    }

    /// Moves a pending batch to `processing` and schedules it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, batch_id: &str) -> EngineResult<SyncBatch> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SyncError::invalid_state("batch worker needs a tokio runtime"))?;
        if self.permits.is_closed() {
            return Err(SyncError::invalid_state("batch worker is shut down"));
        }

        let batch = self.manager.start_processing(batch_id)?;

        let cancel = CancelFlag::new();
        let (tx, rx) = watch::channel(None);
        self.jobs.lock().insert(
            batch_id.to_string(),
            Job {
                cancel: cancel.clone(),
                done: rx,
            },
        );

        let task = JobTask {
            batch_id: batch_id.to_string(),
            manager: self.manager.clone(),
            retry: self.retry.clone(),
            permits: self.permits.clone(),
            cancel,
        };
        let jobs = self.jobs.clone();
        let observers = self.observers.clone();

        runtime.spawn(async move {
            let batch_id = task.batch_id.clone();
            let result = task.run().await;
            if let Some(result) = &result {
                for observer in observers.read().iter() {
                    observer.batch_finished(result);
                }
            }
            tx.send_replace(result);
            jobs.lock().remove(&batch_id);
        });

        debug!(batch_id, "batch dispatched");
        Ok(batch)
    }

    /// Requests cancellation of a running job.
    ///
    /// Returns false if no job runs for the batch.
    pub fn cancel(&self, batch_id: &str) -> bool {
        match self.jobs.lock().get(batch_id) {
            Some(job) => {
                job.cancel.cancel();
                info!(batch_id, "batch cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Returns true while a job runs for the batch.
    pub fn is_running(&self, batch_id: &str) -> bool {
        self.jobs.lock().contains_key(batch_id)
    }

    /// Number of jobs not yet finished.
    pub fn active_jobs(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Waits until a batch settles.
    ///
    /// For batches with no running job the stored state is returned if it is
    /// settled.
    pub async fn wait(&self, batch_id: &str) -> EngineResult<SyncResult> {
        let receiver = self.jobs.lock().get(batch_id).map(|job| job.done.clone());

        match receiver {
            Some(mut done) => {
                let settled = done
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| {
                        SyncError::invalid_state(format!("processing of {batch_id} aborted"))
                    })?;
                settled
                    .clone()
                    .ok_or_else(|| SyncError::invalid_state(format!("processing of {batch_id} aborted")))
            }
            None => {
                let batch = self.manager.get_batch(batch_id)?;
                if batch.status.is_settled() {
                    Ok(SyncResult::from_batch(&batch))
                } else {
                    Err(SyncError::invalid_state(format!(
                        "batch {batch_id} is {} and not running",
                        batch.status
                    )))
                }
            }
        }
    }

    /// Stops accepting work and cancels running jobs.
    pub fn shutdown(&self) {
        self.permits.close();
        for job in self.jobs.lock().values() {
            job.cancel.cancel();
        }
        info!("batch worker shut down");
    }
}

impl std::fmt::Debug for BatchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWorker")
            .field("active_jobs", &self.active_jobs())
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

struct JobTask {
    batch_id: String,
    manager: Arc<BatchManager>,
    retry: RetryConfig,
    permits: Arc<Semaphore>,
    cancel: CancelFlag,
}

impl JobTask {
    async fn run(self) -> Option<SyncResult> {
        let mut attempt = 0u32;
        loop {
            let result = self.execute_once().await?;

            let retry_wanted = result.status == BatchStatus::Failed
                && self.retry.auto_retry
                && !self.cancel.is_cancelled();
            if !retry_wanted {
                return Some(result);
            }

            let delay = self.retry.delay_for_attempt(attempt);
            attempt += 1;
            tokio::time::sleep(delay).await;

            let retried = self
                .manager
                .prepare_retry(&self.batch_id)
                .and_then(|_| self.manager.start_processing(&self.batch_id));
            if let Err(e) = retried {
                debug!(batch_id = %self.batch_id, error = %e, "no further automatic retry");
                return Some(result);
            }
            info!(batch_id = %self.batch_id, attempt, "automatic retry");
        }
    }

    async fn execute_once(&self) -> Option<SyncResult> {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            warn!(batch_id = %self.batch_id, "worker closed before batch started");
            return self.abandon(RecordErrorKind::Cancelled, &SyncError::Cancelled.to_string());
        };

        let manager = self.manager.clone();
        let batch_id = self.batch_id.clone();
        let cancel = self.cancel.clone();
        match tokio::task::spawn_blocking(move || manager.execute(&batch_id, &cancel)).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(e)) => {
                error!(batch_id = %self.batch_id, error = %e, "batch processing failed");
                self.abandon(e.record_kind(), &e.to_string())
            }
            Err(e) => {
                error!(batch_id = %self.batch_id, error = %e, "batch task panicked");
                self.abandon(RecordErrorKind::ApplyFailure, "batch processing panicked")
            }
        }
    }

    fn abandon(&self, kind: RecordErrorKind, message: &str) -> Option<SyncResult> {
        match self.manager.abandon(&self.batch_id, kind, message) {
            Ok(batch) => Some(SyncResult::from_batch(&batch)),
            Err(e) => {
                error!(batch_id = %self.batch_id, error = %e, "could not settle batch");
                None
            }
        }
    }
}
