//! Lifecycle wiring: recovery, worker pool, dispatcher and retention sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::RelayConfig;

use super::dispatcher::{DispatcherStats, ResultDispatcher};
use super::executor::TaskExecutor;
use super::pool::{PoolStats, ShutdownReport, WorkerPool, WorkerPoolHandle};
use super::retention::RetentionSweeper;
use super::sink::DeliverySink;
use super::store::{JobStore, JobStoreError};
use super::types::{JobId, JobPayload, ReclaimReport};

/// Producer-side entry point: admits jobs until the pipeline shuts down.
pub struct Intake<S: JobStore + ?Sized> {
    store: Arc<S>,
    wait: Duration,
    closed: CancellationToken,
}

impl<S: JobStore + ?Sized> Clone for Intake<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            wait: self.wait,
            closed: self.closed.clone(),
        }
    }
}

impl<S: JobStore + ?Sized> Intake<S> {
    pub fn new(store: Arc<S>, wait: Duration) -> Self {
        Self {
            store,
            wait,
            closed: CancellationToken::new(),
        }
    }

    /// Enqueue with the configured bounded wait for capacity.
    pub async fn submit(&self, payload: JobPayload) -> Result<JobId, JobStoreError> {
        if self.closed.is_cancelled() {
            return Err(JobStoreError::Closed);
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(JobStoreError::Closed),
            result = self.store.enqueue(payload, self.wait) => result,
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

/// Everything needed to run the relay.
pub struct Pipeline<S: JobStore + ?Sized, K: DeliverySink> {
    store: Arc<S>,
    executor: TaskExecutor,
    sink: K,
    config: RelayConfig,
}

impl<S: JobStore + ?Sized, K: DeliverySink> Pipeline<S, K> {
    pub fn new(store: Arc<S>, executor: TaskExecutor, sink: K, config: RelayConfig) -> Self {
        Self {
            store,
            executor,
            sink,
            config,
        }
    }

    /// Startup hook: reclaim orphaned jobs, then start workers, the dispatcher
    /// and the retention sweeper.
    pub async fn start(self) -> Result<PipelineHandle<S>, JobStoreError> {
        let reclaimed = self.store.reclaim_orphans().await?;

        let workers_cancel = CancellationToken::new();
        let background_cancel = CancellationToken::new();

        let executor = self.executor.with_default_timeout(self.config.task_timeout);
        let task_timeout = executor.default_timeout();
        let pool = WorkerPool::new(self.store.clone(), executor)
            .with_config(self.config.pool_config())
            .spawn(workers_cancel);

        let dispatcher = ResultDispatcher::new(self.store.clone(), self.sink)
            .with_interval(self.config.dispatch_interval);
        let dispatcher = tokio::spawn(dispatcher.run(background_cancel.clone()));

        let sweeper = RetentionSweeper::new(
            self.store.clone(),
            self.config.retention,
            self.config.cleanup_interval,
        );
        let sweeper = tokio::spawn(sweeper.run(background_cancel.clone()));

        info!(
            workers = self.config.workers,
            capacity = self.store.capacity(),
            task_timeout_secs = task_timeout.as_secs(),
            reclaimed = reclaimed.total(),
            "pipeline started"
        );

        Ok(PipelineHandle {
            intake: Intake::new(self.store, self.config.enqueue_wait),
            reclaimed,
            pool,
            background_cancel,
            dispatcher,
            sweeper,
        })
    }
}

/// Summary returned by [`PipelineHandle::shutdown`].
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub workers: ShutdownReport,
    pub dispatcher: DispatcherStats,
    pub swept: usize,
}

/// Handle to a running pipeline.
pub struct PipelineHandle<S: JobStore + ?Sized> {
    intake: Intake<S>,
    reclaimed: ReclaimReport,
    pool: WorkerPoolHandle<S>,
    background_cancel: CancellationToken,
    dispatcher: JoinHandle<DispatcherStats>,
    sweeper: JoinHandle<usize>,
}

impl<S: JobStore + ?Sized> PipelineHandle<S> {
    pub fn intake(&self) -> Intake<S> {
        self.intake.clone()
    }

    pub fn store(&self) -> &Arc<S> {
        self.intake.store()
    }

    /// Jobs recovered by the startup hook.
    pub fn reclaimed(&self) -> &ReclaimReport {
        &self.reclaimed
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Shutdown hook: stop intake, drain or abort in-flight jobs, flush the
    /// dispatcher one last time and stop background loops.
    pub async fn shutdown(self) -> PipelineReport {
        self.intake.close();
        let workers = self.pool.shutdown().await;

        self.background_cancel.cancel();
        let dispatcher = self.dispatcher.await.unwrap_or_else(|e| {
            error!(error = %e, "dispatcher task failed");
            DispatcherStats::default()
        });
        let swept = self.sweeper.await.unwrap_or_else(|e| {
            error!(error = %e, "retention task failed");
            0
        });

        info!(
            graceful = workers.graceful,
            released = workers.released.len(),
            delivered = dispatcher.jobs_delivered,
            "pipeline stopped"
        );

        PipelineReport {
            workers,
            dispatcher,
            swept,
        }
    }
}
