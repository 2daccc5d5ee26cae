pub mod adapters;
pub mod args;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod queue;
pub mod tracker;
pub mod worker;

use skylift_common::JobKind;
use tracing::info;

use crate::error::Result;
use crate::persistence::Persistence;
use crate::queue::JobQueue;

/// Re-enqueues every deployment that was mid-pipeline when the process last
/// stopped. Enqueues coalesce, so jobs that already survived in the durable
/// queue are not duplicated.
pub async fn recover_interrupted(persistence: &Persistence, queue: &JobQueue) -> Result<usize> {
    let interrupted = persistence.non_terminal_deployments().await?;
    let count = interrupted.len();

    for deployment in interrupted {
        info!(deployment_id = %deployment.id, status = %deployment.status, "re-enqueueing interrupted deployment");
        queue.enqueue(deployment.id, JobKind::Deploy).await?;
    }

    Ok(count)
}
