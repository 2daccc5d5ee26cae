use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, Outcome, INTERRUPT_DELAY};
use crate::error::{Error, Result};
use crate::queue::JobQueue;

#[derive(Clone, Copy, Debug)]
pub struct WorkerConfig {
    /// Parallel engines consuming the queue
    pub concurrency: usize,
    /// How long an idle worker waits before polling the queue again
    pub poll_interval: Duration,
    /// Length of the reservation lease handed out per job. Comfortably above
    /// the longest phase budget; an abandoned lease expires on its own.
    pub visibility_timeout: Duration,
    /// How long shutdown waits for in-flight engines to land on a checkpoint
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            poll_interval: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(45 * 60),
            shutdown_grace: Duration::from_secs(15),
        }
    }
}

/// N engines over one queue. The pool owns nothing an engine needs beyond the
/// queue hand-off; all cross-worker coordination happens through the queue's
/// reservation primitive.
pub struct WorkerPool {
    queue: JobQueue,
    engine: Arc<Engine>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, engine: Engine, config: WorkerConfig) -> Self {
        Self {
            queue,
            engine: Arc::new(engine),
            config,
        }
    }

    /// Runs until `shutdown` fires, then drains in-flight work for the grace
    /// period. Workers still running at the hard deadline are abandoned and
    /// their leases expire on their own.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(workers = self.config.concurrency, "starting worker pool");

        let mut workers = JoinSet::new();
        for id in 0..self.config.concurrency {
            workers.spawn(worker_loop(
                id,
                self.queue.clone(),
                self.engine.clone(),
                self.config,
                shutdown.clone(),
            ));
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                joined = workers.join_next() => match joined {
                    Some(Err(join_error)) if join_error.is_panic() => {
                        error!("a worker panicked, shutting the pool down");
                        shutdown.cancel();
                        workers.abort_all();

                        return Err(Error::WorkerPanic);
                    }
                    Some(_) => warn!("a worker stopped before shutdown"),
                    None => break,
                },
            }
        }

        info!("shutdown signal received, draining in-flight work");

        let drain = async {
            while let Some(joined) = workers.join_next().await {
                if matches!(joined, Err(ref join_error) if join_error.is_panic()) {
                    return Err(Error::WorkerPanic);
                }
            }

            Ok(())
        };

        match timeout(self.config.shutdown_grace, drain).await {
            Ok(result) => {
                info!("worker pool drained");

                result
            }
            Err(_elapsed) => {
                warn!("grace period elapsed, abandoning in-flight jobs to lease expiry");
                workers.abort_all();

                Ok(())
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    queue: JobQueue,
    engine: Arc<Engine>,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    debug!(worker = id, "worker started");

    while !shutdown.is_cancelled() {
        match queue.reserve(config.visibility_timeout).await {
            Ok(Some((job, lease))) => {
                debug!(worker = id, deployment_id = %job.deployment_id, "reserved a job");

                let outcome = engine.execute(&job, shutdown.child_token()).await;

                // Every exit path settles the reservation exactly once
                let settled = match outcome {
                    Outcome::Complete | Outcome::Abandon => queue.ack(lease).await,
                    Outcome::Retry { delay } => queue.nack(lease, delay).await,
                    Outcome::Interrupted => queue.nack(lease, INTERRUPT_DELAY).await,
                };

                if let Err(error) = settled {
                    warn!(worker = id, %error, "could not settle the reservation");
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(config.poll_interval) => {}
                }
            }
            Err(error) => {
                warn!(worker = id, %error, "queue reservation failed");

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(config.poll_interval) => {}
                }
            }
        }
    }

    debug!(worker = id, "worker stopped");
}
