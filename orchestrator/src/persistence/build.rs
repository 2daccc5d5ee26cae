use chrono::{DateTime, Utc};
use strum::{Display, EnumString};
use uuid::Uuid;

/// States of a single image build attempt
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, sqlx::Type)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[strum(ascii_case_insensitive)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Pending,
    Building,
    Success,
    Failed,
}

impl BuildStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failed)
    }
}

/// One build attempt for a deployment. A deployment keeps every attempt it
/// ever made; the engine only ever has one unfinished attempt at a time.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Build {
    pub id: Uuid,
    pub deployment_id: Uuid,
    /// Registry form of the tag, set once the image has been pushed
    pub image_tag: Option<String>,
    pub digest: Option<String>,
    pub status: BuildStatus,
    pub log: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn started(id: Uuid, deployment_id: Uuid) -> Self {
        Self {
            id,
            deployment_id,
            image_tag: None,
            digest: None,
            status: BuildStatus::Pending,
            log: String::new(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            deleted_at: None,
        }
    }
}
