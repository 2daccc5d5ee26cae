mod build;
mod deployment;
mod infrastructure;

pub use build::{Build, BuildStatus};
pub use deployment::{Deployment, DeploymentRequest};
pub use infrastructure::{Infrastructure, InfrastructureStatus};

use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use tracing::info;
use uuid::Uuid;

use skylift_common::{LogItem, Status};

use crate::adapters::{AnalysisResult, InfrastructureOutputs};

/// Upper bound on the log text kept on a single Build or Infrastructure row.
/// Chunks past the bound are dropped after a single truncation marker.
const MAX_CHILD_LOG_BYTES: i64 = 262_144;
const TRUNCATION_MARKER: &str = "\n[log truncated]\n";

#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error("record not found")]
    NotFound,
    #[error("status guard failed: stored status is no longer {expected}")]
    Conflict { expected: Status },
    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PersistenceError {
    pub fn kind(&self) -> crate::error::ErrorKind {
        use crate::error::ErrorKind;

        match self {
            PersistenceError::NotFound => ErrorKind::NotFound,
            PersistenceError::Conflict { .. } => ErrorKind::Conflict,
            PersistenceError::InvalidTransition { .. } => ErrorKind::Permanent,
            PersistenceError::Database(_) => ErrorKind::Transient,
        }
    }
}

type Result<T> = std::result::Result<T, PersistenceError>;

/// The single source of truth for deployments and their child records. New
/// connections should be made by cloning [`Persistence`] rather than calling
/// a constructor again.
#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
}

impl Persistence {
    /// Opens (creating if needed) the state database at `path` and prepares
    /// the schema.
    pub async fn new(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            Sqlite::create_database(path).await?;
        }

        info!("state db: {path}");

        let options = SqliteConnectOptions::from_str(path)
            .map_err(PersistenceError::Database)?
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;

        Self::from_pool(pool).await
    }

    /// A single-connection pool: an in-memory database exists per connection,
    /// so the pool must never open a second one.
    pub async fn new_in_memory() -> Self {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("to connect to an in-memory database");

        Self::from_pool(pool)
            .await
            .expect("to prepare an in-memory schema")
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,       -- Uuid of the deployment
                name TEXT NOT NULL,        -- Human name given at creation
                app_name TEXT NOT NULL,    -- Application the image and workload are named after
                version TEXT NOT NULL,     -- Version tag baked into the image tag
                provider TEXT NOT NULL,    -- Cloud provider tag
                region TEXT NOT NULL,
                app_port INTEGER NOT NULL, -- Port the application listens on
                source_url TEXT NOT NULL,  -- Source repository reference handed to the analyzer
                status TEXT NOT NULL,      -- Current pipeline status
                external_ip TEXT,          -- Populated once the workload is exposed
                url TEXT,
                error TEXT,                -- Most recent failure message
                timeout_phase TEXT,        -- Phase holding one timeout strike
                analysis TEXT,             -- Analyzer output as JSON
                infrastructure_id TEXT,    -- Current live infrastructure
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deployed_at TEXT,
                deleted_at TEXT            -- Soft-delete marker
            );

            CREATE TABLE IF NOT EXISTS builds (
                id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL,
                image_tag TEXT,            -- Registry form, set on push
                digest TEXT,
                status TEXT NOT NULL,
                log TEXT NOT NULL DEFAULT '',
                error TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS infrastructures (
                id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL,
                cluster_name TEXT NOT NULL,
                namespace TEXT NOT NULL,
                service_name TEXT NOT NULL,
                provider TEXT NOT NULL,
                stack_name TEXT NOT NULL,  -- Deterministic name keying idempotent provision/destroy
                endpoint TEXT,
                ca_cert TEXT,
                kubeconfig TEXT,
                location TEXT,
                external_ip TEXT,
                status TEXT NOT NULL,
                error TEXT,
                log TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS deployment_logs (
                deployment_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                phase TEXT NOT NULL,       -- Pipeline status at the time of the event
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                correlation_id TEXT        -- Queue delivery that produced the event
            );
            ",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// The queue persists its jobs table on the same database.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_deployment(&self, request: DeploymentRequest) -> Result<Deployment> {
        let deployment = Deployment::from_request(request);

        sqlx::query(
            "INSERT INTO deployments (
                id, name, app_name, version, provider, region, app_port, source_url,
                status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(deployment.id)
        .bind(&deployment.name)
        .bind(&deployment.app_name)
        .bind(&deployment.version)
        .bind(&deployment.provider)
        .bind(&deployment.region)
        .bind(deployment.app_port)
        .bind(&deployment.source_url)
        .bind(deployment.status)
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(deployment)
    }

    pub async fn get_deployment(&self, id: &Uuid) -> Result<Deployment> {
        sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(PersistenceError::NotFound)
    }

    pub async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        sqlx::query_as("SELECT * FROM deployments WHERE deleted_at IS NULL ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    /// Deployments that were mid-pipeline when the process last stopped.
    /// Re-enqueued once at boot so interrupted work resumes.
    pub async fn non_terminal_deployments(&self) -> Result<Vec<Deployment>> {
        sqlx::query_as(
            "SELECT * FROM deployments
             WHERE status NOT IN (?, ?) AND deleted_at IS NULL
             ORDER BY created_at",
        )
        .bind(Status::Exposed)
        .bind(Status::Failed)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// The optimistic status move every engine transition goes through. Fails
    /// with [`PersistenceError::Conflict`] when the stored status is no
    /// longer `expected`, meaning another actor owns the deployment.
    pub async fn update_status(&self, id: &Uuid, expected: Status, next: Status) -> Result<()> {
        if !expected.can_transition_to(next) {
            return Err(PersistenceError::InvalidTransition {
                from: expected,
                to: next,
            });
        }

        let rows = sqlx::query(
            "UPDATE deployments SET status = ?, updated_at = ?
             WHERE id = ? AND status = ? AND deleted_at IS NULL",
        )
        .bind(next)
        .bind(Utc::now())
        .bind(id)
        .bind(expected)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            let exists: i64 = sqlx::query_scalar("SELECT count(*) FROM deployments WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;

            if exists == 0 {
                Err(PersistenceError::NotFound)
            } else {
                Err(PersistenceError::Conflict { expected })
            }
        } else {
            Ok(())
        }
    }

    pub async fn set_error(&self, id: &Uuid, message: &str) -> Result<()> {
        sqlx::query("UPDATE deployments SET error = ?, updated_at = ? WHERE id = ?")
            .bind(message)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    pub async fn record_timeout_strike(&self, id: &Uuid, phase: Status) -> Result<()> {
        sqlx::query("UPDATE deployments SET timeout_phase = ?, updated_at = ? WHERE id = ?")
            .bind(phase)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    pub async fn clear_timeout_strike(&self, id: &Uuid) -> Result<()> {
        sqlx::query("UPDATE deployments SET timeout_phase = NULL, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    pub async fn set_analysis(&self, id: &Uuid, analysis: &AnalysisResult) -> Result<()> {
        sqlx::query("UPDATE deployments SET analysis = ?, updated_at = ? WHERE id = ?")
            .bind(Json(analysis))
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    pub async fn set_exposed(&self, id: &Uuid, external_ip: &str, url: &str) -> Result<()> {
        let now = Utc::now();

        sqlx::query(
            "UPDATE deployments SET external_ip = ?, url = ?, deployed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(external_ip)
        .bind(url)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Into::into)
    }

    /// Marks the aggregate deleted and cascade-marks its children, in one
    /// transaction. Rows stay behind for audit.
    pub async fn soft_delete_deployment(&self, id: &Uuid) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "UPDATE deployments SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(PersistenceError::NotFound);
        }

        sqlx::query("UPDATE builds SET deleted_at = ? WHERE deployment_id = ? AND deleted_at IS NULL")
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE infrastructures SET deleted_at = ? WHERE deployment_id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    pub async fn insert_log(&self, item: &LogItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO deployment_logs (deployment_id, timestamp, phase, level, message, correlation_id)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(item.deployment_id)
        .bind(item.timestamp)
        .bind(item.phase)
        .bind(item.level)
        .bind(&item.message)
        .bind(item.correlation_id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Into::into)
    }

    pub async fn get_logs(&self, deployment_id: &Uuid) -> Result<Vec<LogItem>> {
        sqlx::query_as(
            "SELECT * FROM deployment_logs WHERE deployment_id = ? ORDER BY timestamp, rowid",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn insert_build(&self, build: &Build) -> Result<()> {
        sqlx::query(
            "INSERT INTO builds (id, deployment_id, image_tag, digest, status, log, error, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(build.id)
        .bind(build.deployment_id)
        .bind(&build.image_tag)
        .bind(&build.digest)
        .bind(build.status)
        .bind(&build.log)
        .bind(&build.error)
        .bind(build.started_at)
        .bind(build.completed_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Into::into)
    }

    pub async fn get_build(&self, id: &Uuid) -> Result<Build> {
        sqlx::query_as("SELECT * FROM builds WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(PersistenceError::NotFound)
    }

    pub async fn get_builds(&self, deployment_id: &Uuid) -> Result<Vec<Build>> {
        sqlx::query_as("SELECT * FROM builds WHERE deployment_id = ? ORDER BY started_at, rowid")
            .bind(deployment_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    /// The unfinished build attempt a resumed execution picks back up, if any.
    pub async fn active_build(&self, deployment_id: &Uuid) -> Result<Option<Build>> {
        sqlx::query_as(
            "SELECT * FROM builds
             WHERE deployment_id = ? AND status IN (?, ?) AND deleted_at IS NULL
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(deployment_id)
        .bind(BuildStatus::Pending)
        .bind(BuildStatus::Building)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn latest_successful_build(&self, deployment_id: &Uuid) -> Result<Option<Build>> {
        sqlx::query_as(
            "SELECT * FROM builds
             WHERE deployment_id = ? AND status = ? AND deleted_at IS NULL
             ORDER BY completed_at DESC LIMIT 1",
        )
        .bind(deployment_id)
        .bind(BuildStatus::Success)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn mark_build_building(&self, id: &Uuid) -> Result<()> {
        sqlx::query("UPDATE builds SET status = ? WHERE id = ?")
            .bind(BuildStatus::Building)
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    pub async fn complete_build(&self, id: &Uuid, image_tag: &str, digest: &str) -> Result<()> {
        sqlx::query(
            "UPDATE builds SET status = ?, image_tag = ?, digest = ?, completed_at = ? WHERE id = ?",
        )
        .bind(BuildStatus::Success)
        .bind(image_tag)
        .bind(digest)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Into::into)
    }

    pub async fn fail_build(&self, id: &Uuid, error: &str) -> Result<()> {
        sqlx::query("UPDATE builds SET status = ?, error = ?, completed_at = ? WHERE id = ?")
            .bind(BuildStatus::Failed)
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    pub async fn append_build_log(&self, id: &Uuid, chunk: &str) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE builds SET log = log || ?1 WHERE id = ?2 AND length(log) + length(?1) <= ?3",
        )
        .bind(chunk)
        .bind(id)
        .bind(MAX_CHILD_LOG_BYTES)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            // Over budget or missing; leave a single truncation marker behind
            sqlx::query("UPDATE builds SET log = log || ?1 WHERE id = ?2 AND instr(log, ?1) = 0")
                .bind(TRUNCATION_MARKER)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    /// Inserts the infrastructure row and points the deployment at it, in one
    /// transaction.
    pub async fn insert_infrastructure(&self, infrastructure: &Infrastructure) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO infrastructures (
                id, deployment_id, cluster_name, namespace, service_name, provider, stack_name,
                status, log, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(infrastructure.id)
        .bind(infrastructure.deployment_id)
        .bind(&infrastructure.cluster_name)
        .bind(&infrastructure.namespace)
        .bind(&infrastructure.service_name)
        .bind(&infrastructure.provider)
        .bind(&infrastructure.stack_name)
        .bind(infrastructure.status)
        .bind(&infrastructure.log)
        .bind(infrastructure.created_at)
        .bind(infrastructure.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE deployments SET infrastructure_id = ?, updated_at = ? WHERE id = ?")
            .bind(infrastructure.id)
            .bind(Utc::now())
            .bind(infrastructure.deployment_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    pub async fn get_infrastructure(&self, id: &Uuid) -> Result<Infrastructure> {
        sqlx::query_as("SELECT * FROM infrastructures WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(PersistenceError::NotFound)
    }

    /// The live infrastructure the deployment currently points at, if any.
    pub async fn current_infrastructure(&self, deployment_id: &Uuid) -> Result<Option<Infrastructure>> {
        sqlx::query_as(
            "SELECT i.* FROM infrastructures i
             JOIN deployments d ON d.infrastructure_id = i.id
             WHERE d.id = ?",
        )
        .bind(deployment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    pub async fn set_infrastructure_status(
        &self,
        id: &Uuid,
        status: InfrastructureStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE infrastructures SET status = ?, error = coalesce(?, error), updated_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Into::into)
    }

    pub async fn set_infrastructure_outputs(
        &self,
        id: &Uuid,
        outputs: &InfrastructureOutputs,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE infrastructures
             SET endpoint = ?, ca_cert = ?, kubeconfig = ?, location = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&outputs.endpoint)
        .bind(&outputs.ca_cert)
        .bind(&outputs.kubeconfig)
        .bind(&outputs.location)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Into::into)
    }

    pub async fn set_infrastructure_external_ip(&self, id: &Uuid, external_ip: &str) -> Result<()> {
        sqlx::query("UPDATE infrastructures SET external_ip = ?, updated_at = ? WHERE id = ?")
            .bind(external_ip)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }

    pub async fn append_infrastructure_log(&self, id: &Uuid, chunk: &str) -> Result<()> {
        let rows = sqlx::query(
            "UPDATE infrastructures SET log = log || ?1 WHERE id = ?2 AND length(log) + length(?1) <= ?3",
        )
        .bind(chunk)
        .bind(id)
        .bind(MAX_CHILD_LOG_BYTES)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            sqlx::query(
                "UPDATE infrastructures SET log = log || ?1 WHERE id = ?2 AND instr(log, ?1) = 0",
            )
            .bind(TRUNCATION_MARKER)
            .bind(id)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }
}
