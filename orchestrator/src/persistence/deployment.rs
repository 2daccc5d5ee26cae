use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use skylift_common::Status;

use crate::adapters::AnalysisResult;

/// The root aggregate. Mutated exclusively by the engine while a job for it
/// is reserved; never hard-deleted.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Deployment {
    pub id: Uuid,
    pub name: String,
    pub app_name: String,
    pub version: String,
    pub provider: String,
    pub region: String,
    pub app_port: u16,
    pub source_url: String,
    pub status: Status,
    pub external_ip: Option<String>,
    pub url: Option<String>,
    pub error: Option<String>,
    /// Phase that has one recorded timeout strike against it. A second
    /// timeout in the same phase is treated as permanent.
    pub timeout_phase: Option<Status>,
    /// Analyzer output, persisted so a resumed execution does not need to
    /// re-run the analyze phase to rebuild or redeploy.
    pub analysis: Option<Json<AnalysisResult>>,
    pub infrastructure_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// What the API hands over when it accepts a deployment.
#[derive(Clone, Debug)]
pub struct DeploymentRequest {
    pub name: String,
    pub app_name: String,
    pub version: String,
    pub provider: String,
    pub region: String,
    pub app_port: u16,
    pub source_url: String,
}

impl Deployment {
    pub fn from_request(request: DeploymentRequest) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            name: request.name,
            app_name: request.app_name,
            version: request.version,
            provider: request.provider,
            region: request.region,
            app_port: request.app_port,
            source_url: request.source_url,
            status: Status::Queued,
            external_ip: None,
            url: None,
            error: None,
            timeout_phase: None,
            analysis: None,
            infrastructure_id: None,
            created_at: now,
            updated_at: now,
            deployed_at: None,
            deleted_at: None,
        }
    }
}
