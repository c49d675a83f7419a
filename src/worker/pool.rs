//! Fixed-size worker pools over the job table.
//!
//! Each worker claims one job at a time with `dequeue_and_lock`, processes it
//! with no transaction held, and records the result with `finish`. Workers of
//! different kinds never talk to each other; the job table is the only
//! channel.

use chrono::Utc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cleanup;
use crate::config::WorkerConfig;
use crate::context::Context;
use crate::storage::{ClaimedJob, DispatchParams, JobKind};
use crate::websub::{self, VerifyParams};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("workers did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("{0} worker task(s) panicked")]
    Panicked(usize),
}

/// Supervises the verify and dispatch workers and the cleanup task.
pub struct WorkerPool {
    ctx: Context,
    config: WorkerConfig,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(ctx: Context, config: WorkerConfig, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            config,
            cancel,
            handles: Vec::new(),
        }
    }

    /// Spawn every configured worker. Returns immediately.
    pub fn spawn(&mut self) {
        let pools = [
            (JobKind::Verify, self.config.verify),
            (JobKind::Dispatch, self.config.dispatch),
        ];
        for (kind, count) in pools {
            for worker_id in 0..count {
                let ctx = self.ctx.clone();
                let cancel = self.cancel.clone();
                let poll_interval = self.config.poll_interval();
                self.handles.push(tokio::spawn(async move {
                    run_worker(worker_id, kind, ctx, poll_interval, cancel).await;
                }));
            }
        }

        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        let interval = self.config.cleanup_interval();
        self.handles.push(tokio::spawn(async move {
            cleanup::run(ctx, interval, cancel).await;
        }));

        info!(
            verify = self.config.verify,
            dispatch = self.config.dispatch,
            "Background workers started"
        );
    }

    pub fn has_active_workers(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Cancel all workers and wait for them to return.
    ///
    /// Jobs interrupted mid-flight are recorded as failed by their worker.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<(), WorkerError> {
        self.cancel.cancel();
        let handles = std::mem::take(&mut self.handles);

        let join_all = async {
            let mut panicked = 0;
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked");
                    panicked += 1;
                }
            }
            panicked
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(0) => {
                info!("Background workers stopped");
                Ok(())
            }
            Ok(panicked) => Err(WorkerError::Panicked(panicked)),
            Err(_) => {
                error!(
                    timeout_secs = timeout.as_secs(),
                    "Worker shutdown timed out"
                );
                Err(WorkerError::ShutdownTimeout(timeout))
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.has_active_workers() && !self.cancel.is_cancelled() {
            warn!("WorkerPool dropped without shutdown, cancelling workers");
            self.cancel.cancel();
        }
    }
}

async fn run_worker(
    worker_id: usize,
    kind: JobKind,
    ctx: Context,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    debug!(worker_id, kind = %kind, "Worker started");

    while !cancel.is_cancelled() {
        let claimed = match ctx.db.dequeue_and_lock(kind, Utc::now()).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(worker_id, kind = %kind, error = %e, "Failed to dequeue job");
                None
            }
        };

        let Some(job) = claimed else {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        };

        let success = process(&ctx, &job, &cancel).await;
        if let Err(e) = ctx.db.finish(job.id, success).await {
            error!(job_id = job.id, error = %e, "Failed to record job result");
        }
    }

    debug!(worker_id, kind = %kind, "Worker stopped");
}

/// Run one claimed job. Returns whether it succeeded.
pub async fn process(ctx: &Context, job: &ClaimedJob, cancel: &CancellationToken) -> bool {
    match job.kind {
        JobKind::Verify => {
            let params: VerifyParams = match serde_json::from_str(&job.parameters) {
                Ok(params) => params,
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "Malformed verify parameters");
                    return false;
                }
            };
            match websub::verify(ctx, &params, cancel).await {
                Ok(_) => true,
                Err(e) => {
                    info!(
                        job_id = job.id,
                        feed_id = params.feed_id,
                        callback = %params.callback,
                        error = %e,
                        "Verification failed"
                    );
                    false
                }
            }
        }
        JobKind::Dispatch => {
            let params: DispatchParams = match serde_json::from_str(&job.parameters) {
                Ok(params) => params,
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "Malformed dispatch parameters");
                    return false;
                }
            };
            match websub::dispatch(ctx, &params, cancel).await {
                Ok(_) => true,
                Err(e) => {
                    info!(
                        job_id = job.id,
                        subscription_id = params.subscription_id,
                        error = %e,
                        "Dispatch failed"
                    );
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BlobStore, Database, JobStatus};
    use pretty_assertions::assert_eq;

    async fn test_ctx() -> Context {
        let db = Database::open(":memory:").await.unwrap();
        Context::new(
            db,
            BlobStore::new(std::env::temp_dir().join("letterbox-pool-tests")),
            "mail.example.com",
            false,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            verify: 2,
            dispatch: 2,
            poll_interval_ms: 10,
            ..WorkerConfig::default()
        }
    }

    async fn wait_for_terminal(ctx: &Context, id: i64) -> JobStatus {
        for _ in 0..200 {
            let job = ctx.db.job(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job.status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never finished");
    }

    #[tokio::test]
    async fn test_malformed_parameters_fail_the_job() {
        let ctx = test_ctx().await;
        let job = ClaimedJob {
            id: 1,
            kind: JobKind::Dispatch,
            parameters: "{not json".to_string(),
        };
        assert!(!process(&ctx, &job, &CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn test_pool_drains_jobs_and_records_failures() {
        let ctx = test_ctx().await;
        let params = serde_json::to_string(&DispatchParams {
            feed_id: 404,
            feed_entry_id: 1,
            subscription_id: 1,
        })
        .unwrap();
        let id = ctx
            .db
            .enqueue(JobKind::Dispatch, Utc::now(), &params)
            .await
            .unwrap();

        let mut pool = WorkerPool::new(ctx.clone(), fast_config(), CancellationToken::new());
        pool.spawn();

        assert_eq!(wait_for_terminal(&ctx, id).await, JobStatus::Failed);
        pool.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let ctx = test_ctx().await;
        let mut pool = WorkerPool::new(ctx, fast_config(), CancellationToken::new());
        pool.spawn();
        assert!(pool.has_active_workers());

        pool.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_jobs_not_yet_due_stay_pending() {
        let ctx = test_ctx().await;
        let id = ctx
            .db
            .enqueue(
                JobKind::Verify,
                Utc::now() + chrono::Duration::hours(1),
                "{}",
            )
            .await
            .unwrap();

        let mut pool = WorkerPool::new(ctx.clone(), fast_config(), CancellationToken::new());
        pool.spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.shutdown_graceful(Duration::from_secs(5)).await.unwrap();

        let job = ctx.db.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }
}
