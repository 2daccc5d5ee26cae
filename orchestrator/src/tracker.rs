use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use skylift_common::log::Level;
use skylift_common::{LogItem, Status};

use crate::adapters::{BuildOutput, InfrastructureOutputs, ProgressSink};
use crate::persistence::{Build, Infrastructure, InfrastructureStatus, Persistence, PersistenceError};

type Result<T> = std::result::Result<T, PersistenceError>;

/// Per-execution progress writer, bound to one deployment. Adapters report
/// through it; the engine never buffers logs in memory. All operations are
/// idempotent given the stable child record id.
pub struct Tracker {
    persistence: Persistence,
    deployment_id: Uuid,
    /// Stamped on every log item so a trail can be tied back to the queue
    /// delivery that produced it
    correlation_id: Uuid,
}

impl Tracker {
    pub fn new(persistence: Persistence, deployment_id: Uuid, correlation_id: Uuid) -> Self {
        Self {
            persistence,
            deployment_id,
            correlation_id,
        }
    }

    pub fn deployment_id(&self) -> Uuid {
        self.deployment_id
    }

    /// Appends one user-facing progress event. Best effort: a failed write
    /// must not fail the phase that reported it.
    pub async fn log(&self, phase: Status, level: Level, message: impl Into<String>) {
        let item = LogItem {
            deployment_id: self.deployment_id,
            timestamp: Utc::now(),
            phase,
            level,
            message: message.into(),
            correlation_id: Some(self.correlation_id),
        };

        if let Err(error) = self.persistence.insert_log(&item).await {
            warn!(%error, "could not record deployment log");
        }
    }

    /// Creates the build attempt, or picks the existing one back up when the
    /// execution is a resume.
    pub async fn start_build(&self, build_id: Uuid) -> Result<Build> {
        let build = match self.persistence.get_build(&build_id).await {
            Ok(existing) => existing,
            Err(PersistenceError::NotFound) => {
                let build = Build::started(build_id, self.deployment_id);
                self.persistence.insert_build(&build).await?;

                build
            }
            Err(error) => return Err(error),
        };

        self.persistence.mark_build_building(&build_id).await?;

        Ok(build)
    }

    pub async fn complete_build(&self, build_id: &Uuid, output: &BuildOutput) -> Result<()> {
        self.persistence
            .complete_build(build_id, &output.image_tag, &output.digest)
            .await
    }

    pub async fn fail_build(&self, build_id: &Uuid, error: &str) -> Result<()> {
        self.persistence.fail_build(build_id, error).await
    }

    /// Creates the infrastructure record, or returns the existing one on
    /// resume so the same stack identifier is reused.
    pub async fn start_infrastructure(&self, infrastructure: Infrastructure) -> Result<Infrastructure> {
        match self.persistence.get_infrastructure(&infrastructure.id).await {
            Ok(existing) => Ok(existing),
            Err(PersistenceError::NotFound) => {
                self.persistence.insert_infrastructure(&infrastructure).await?;

                Ok(infrastructure)
            }
            Err(error) => Err(error),
        }
    }

    pub async fn complete_infrastructure(
        &self,
        infrastructure_id: &Uuid,
        outputs: &InfrastructureOutputs,
    ) -> Result<()> {
        self.persistence
            .set_infrastructure_outputs(infrastructure_id, outputs)
            .await?;
        self.persistence
            .set_infrastructure_status(infrastructure_id, InfrastructureStatus::Ready, None)
            .await
    }

    pub async fn fail_infrastructure(&self, infrastructure_id: &Uuid, error: &str) -> Result<()> {
        self.persistence
            .set_infrastructure_status(infrastructure_id, InfrastructureStatus::Failed, Some(error))
            .await
    }

    pub async fn mark_destroying(&self, infrastructure_id: &Uuid) -> Result<()> {
        self.persistence
            .set_infrastructure_status(infrastructure_id, InfrastructureStatus::Destroying, None)
            .await
    }

    /// Sink for build log chunks, handed to the image builder.
    pub fn build_progress(&self, build_id: Uuid) -> BuildProgress<'_> {
        BuildProgress {
            tracker: self,
            build_id,
        }
    }

    /// Sink for provisioner and deployer log chunks.
    pub fn infrastructure_progress(&self, infrastructure_id: Uuid) -> InfrastructureProgress<'_> {
        InfrastructureProgress {
            tracker: self,
            infrastructure_id,
        }
    }
}

pub struct BuildProgress<'a> {
    tracker: &'a Tracker,
    build_id: Uuid,
}

#[async_trait]
impl ProgressSink for BuildProgress<'_> {
    async fn push(&self, chunk: &str) {
        if let Err(error) = self
            .tracker
            .persistence
            .append_build_log(&self.build_id, chunk)
            .await
        {
            warn!(%error, "could not append build log chunk");
        }
    }
}

pub struct InfrastructureProgress<'a> {
    tracker: &'a Tracker,
    infrastructure_id: Uuid,
}

#[async_trait]
impl ProgressSink for InfrastructureProgress<'_> {
    async fn push(&self, chunk: &str) {
        if let Err(error) = self
            .tracker
            .persistence
            .append_infrastructure_log(&self.infrastructure_id, chunk)
            .await
        {
            warn!(%error, "could not append infrastructure log chunk");
        }
    }
}
