use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use tracing::trace;
use uuid::Uuid;

use skylift_common::{Job, JobKind};

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    /// The lease behind an ack or nack was already spent or has expired
    #[error("lease is spent or expired")]
    StaleLease,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueueError {
    pub fn kind(&self) -> crate::error::ErrorKind {
        use crate::error::ErrorKind;

        match self {
            QueueError::StaleLease => ErrorKind::Conflict,
            QueueError::Database(_) => ErrorKind::Transient,
        }
    }
}

type Result<T> = std::result::Result<T, QueueError>;

/// Proof of a reservation. Spent exactly once, by the ack or nack that ends
/// the hand-off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseToken(Uuid);

#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued {
    Created(Uuid),
    /// An undelivered job for the same deployment and kind already existed;
    /// the request was folded into it
    Coalesced(Uuid),
}

impl Enqueued {
    pub fn job_id(&self) -> Uuid {
        match self {
            Enqueued::Created(id) | Enqueued::Coalesced(id) => *id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    deployment_id: Uuid,
    kind: JobKind,
    enqueued_at: i64,
    attempt: i64,
}

/// Durable FIFO of deployment jobs with reservation semantics: a worker
/// reserves a job and must ack within the visibility timeout or the job
/// becomes deliverable again. At most one job per deployment is ever
/// reserved at a time.
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
}

impl JobQueue {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,  -- Unix seconds of the original enqueue
                attempt INTEGER NOT NULL DEFAULT 0,
                available_at INTEGER NOT NULL, -- Deliverable no earlier than this
                lease_token TEXT,
                lease_expires_at INTEGER       -- Reservation visibility deadline
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_deployment ON jobs (deployment_id);
            ",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Cheap connectivity probe, used at boot before workers start.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;

        Ok(())
    }

    /// Adds a job for the deployment. An undelivered job of the same kind for
    /// the same deployment absorbs the request; a job that is currently
    /// reserved does not, so the new one queues behind the reservation.
    pub async fn enqueue(&self, deployment_id: Uuid, kind: JobKind) -> Result<Enqueued> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM jobs
             WHERE deployment_id = ? AND kind = ?
               AND (lease_expires_at IS NULL OR lease_expires_at <= ?)
             LIMIT 1",
        )
        .bind(deployment_id)
        .bind(kind)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((id,)) = existing {
            tx.commit().await?;
            trace!(%deployment_id, %kind, "enqueue coalesced into {id}");

            return Ok(Enqueued::Coalesced(id));
        }

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO jobs (id, deployment_id, kind, enqueued_at, available_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(deployment_id)
        .bind(kind)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Enqueued::Created(id))
    }

    /// Hands out the oldest deliverable job whose deployment has no live
    /// reservation, together with a lease that lasts `visibility`. Returns
    /// `None` when nothing is deliverable right now.
    pub async fn reserve(&self, visibility: Duration) -> Result<Option<(Job, LeaseToken)>> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let row: Option<JobRow> = sqlx::query_as(
            "SELECT j.id, j.deployment_id, j.kind, j.enqueued_at, j.attempt FROM jobs j
             WHERE j.available_at <= ?1
               AND (j.lease_expires_at IS NULL OR j.lease_expires_at <= ?1)
               AND NOT EXISTS (
                   SELECT 1 FROM jobs r
                   WHERE r.deployment_id = j.deployment_id AND r.lease_expires_at > ?1
               )
             ORDER BY j.enqueued_at, j.rowid
             LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let token = Uuid::new_v4();
        let claimed = sqlx::query(
            "UPDATE jobs SET lease_token = ?, lease_expires_at = ?, attempt = attempt + 1
             WHERE id = ? AND (lease_expires_at IS NULL OR lease_expires_at <= ?)",
        )
        .bind(token)
        .bind(now + visibility.as_secs() as i64)
        .bind(row.id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            // Another worker slipped in between the candidate select and the
            // claim; the caller simply polls again
            return Ok(None);
        }

        tx.commit().await?;

        let job = Job {
            deployment_id: row.deployment_id,
            kind: row.kind,
            enqueued_at: row.enqueued_at,
            attempt: (row.attempt + 1) as u32,
        };

        Ok(Some((job, LeaseToken(token))))
    }

    /// Removes the job behind a live lease. Each lease acks or nacks exactly
    /// once; anything else is [`QueueError::StaleLease`].
    pub async fn ack(&self, token: LeaseToken) -> Result<()> {
        let rows = sqlx::query("DELETE FROM jobs WHERE lease_token = ? AND lease_expires_at > ?")
            .bind(token.0)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows == 0 {
            Err(QueueError::StaleLease)
        } else {
            Ok(())
        }
    }

    /// Returns the job behind a live lease to the queue, deliverable again
    /// after `delay`.
    pub async fn nack(&self, token: LeaseToken, delay: Duration) -> Result<()> {
        let now = Utc::now().timestamp();
        let rows = sqlx::query(
            "UPDATE jobs SET available_at = ?, lease_token = NULL, lease_expires_at = NULL
             WHERE lease_token = ? AND lease_expires_at > ?",
        )
        .bind(now + delay.as_secs() as i64)
        .bind(token.0)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            Err(QueueError::StaleLease)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn queue() -> JobQueue {
        // An in-memory database exists per connection; keep the pool at one
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        JobQueue::new(pool).await.unwrap()
    }

    const VISIBILITY: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn enqueue_coalesces_undelivered_jobs() {
        let q = queue().await;
        let deployment = Uuid::new_v4();

        let first = q.enqueue(deployment, JobKind::Deploy).await.unwrap();
        let second = q.enqueue(deployment, JobKind::Deploy).await.unwrap();

        assert!(matches!(first, Enqueued::Created(_)));
        assert_eq!(second, Enqueued::Coalesced(first.job_id()));

        // A different kind is its own job
        assert!(matches!(
            q.enqueue(deployment, JobKind::Destroy).await.unwrap(),
            Enqueued::Created(_)
        ));
    }

    #[tokio::test]
    async fn fifo_and_at_most_once_ack() {
        let q = queue().await;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        q.enqueue(first, JobKind::Deploy).await.unwrap();
        q.enqueue(second, JobKind::Deploy).await.unwrap();

        let (job, lease) = q.reserve(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(job.deployment_id, first);
        assert_eq!(job.attempt, 1);

        q.ack(lease).await.unwrap();
        assert!(matches!(
            q.ack(lease).await.unwrap_err(),
            QueueError::StaleLease
        ));

        let (job, _lease) = q.reserve(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(job.deployment_id, second);
    }

    #[tokio::test]
    async fn one_reservation_per_deployment() {
        let q = queue().await;
        let deployment = Uuid::new_v4();

        q.enqueue(deployment, JobKind::Deploy).await.unwrap();
        let (_, lease) = q.reserve(VISIBILITY).await.unwrap().unwrap();

        // The first job is reserved, so a fresh enqueue queues behind it
        assert!(matches!(
            q.enqueue(deployment, JobKind::Deploy).await.unwrap(),
            Enqueued::Created(_)
        ));

        // ...and is not deliverable while the reservation lives
        assert!(q.reserve(VISIBILITY).await.unwrap().is_none());

        q.ack(lease).await.unwrap();
        let (job, _) = q.reserve(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(job.deployment_id, deployment);
    }

    #[tokio::test]
    async fn nack_redelivers_with_attempt_count() {
        let q = queue().await;
        let deployment = Uuid::new_v4();

        q.enqueue(deployment, JobKind::Deploy).await.unwrap();

        let (job, lease) = q.reserve(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(job.attempt, 1);
        q.nack(lease, Duration::ZERO).await.unwrap();

        // The lease is spent by the nack
        assert!(matches!(
            q.nack(lease, Duration::ZERO).await.unwrap_err(),
            QueueError::StaleLease
        ));

        let (job, _) = q.reserve(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(job.attempt, 2);
    }

    #[tokio::test]
    async fn delayed_nack_is_not_deliverable_yet() {
        let q = queue().await;
        let deployment = Uuid::new_v4();

        q.enqueue(deployment, JobKind::Deploy).await.unwrap();
        let (_, lease) = q.reserve(VISIBILITY).await.unwrap().unwrap();
        q.nack(lease, Duration::from_secs(3600)).await.unwrap();

        assert!(q.reserve(VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let q = queue().await;
        let deployment = Uuid::new_v4();

        q.enqueue(deployment, JobKind::Deploy).await.unwrap();
        let (_, abandoned) = q.reserve(Duration::ZERO).await.unwrap().unwrap();

        // The zero-length lease expired on the spot: the job is deliverable
        // to another worker and the old lease is dead
        let (job, _) = q.reserve(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(job.deployment_id, deployment);
        assert_eq!(job.attempt, 2);
        assert!(matches!(
            q.ack(abandoned).await.unwrap_err(),
            QueueError::StaleLease
        ));
    }
}
