use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deployment::Status;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// One user-facing progress event for a deployment. The chronological list of
/// these items is the debugging trail behind a deployment's current status.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Item {
    pub deployment_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// The pipeline phase the deployment was in when the event was produced
    pub phase: Status,
    pub level: Level,
    pub message: String,
    /// Ties the event back to the queue delivery that produced it
    pub correlation_id: Option<Uuid>,
}
