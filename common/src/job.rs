use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// What a queued job asks the orchestrator to do with a deployment.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
pub enum JobKind {
    /// Drive the full pipeline towards an exposed application
    Deploy,
    /// Tear down infrastructure and soft-delete the deployment
    Destroy,
    /// Operator-requested compensation from any non-terminal state
    Rollback,
}

/// The queue payload. This is a wire contract: the API side enqueues exactly
/// this JSON shape and the worker side deserializes it back.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Job {
    pub deployment_id: Uuid,
    #[serde(rename = "type")]
    pub kind: JobKind,
    /// Unix seconds at the time of the original enqueue
    pub enqueued_at: i64,
    /// Delivery count, starting at 1 for the first reservation
    pub attempt: u32,
}

impl Job {
    pub fn deploy(deployment_id: Uuid, enqueued_at: i64) -> Self {
        Self {
            deployment_id,
            kind: JobKind::Deploy,
            enqueued_at,
            attempt: 1,
        }
    }
}
