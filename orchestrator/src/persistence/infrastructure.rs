use chrono::{DateTime, Utc};
use strum::{Display, EnumString};
use uuid::Uuid;

/// States of the cloud infrastructure behind a deployment
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, sqlx::Type)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[strum(ascii_case_insensitive)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InfrastructureStatus {
    Provisioning,
    Ready,
    Failed,
    Destroying,
}

/// The infrastructure instantiated for a deployment. At most one live row per
/// deployment; rows are kept for audit after destruction.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct Infrastructure {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub cluster_name: String,
    pub namespace: String,
    pub service_name: String,
    pub provider: String,
    /// Deterministic stack name derived from the deployment id. Repeated
    /// provision and destroy calls for the same stack converge.
    pub stack_name: String,
    pub endpoint: Option<String>,
    pub ca_cert: Option<String>,
    pub kubeconfig: Option<String>,
    pub location: Option<String>,
    pub external_ip: Option<String>,
    pub status: InfrastructureStatus,
    pub error: Option<String>,
    pub log: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Infrastructure {
    pub fn provisioning(
        id: Uuid,
        deployment_id: Uuid,
        provider: String,
        stack_name: String,
        cluster_name: String,
        namespace: String,
        service_name: String,
    ) -> Self {
        let now = Utc::now();

        Self {
            id,
            deployment_id,
            cluster_name,
            namespace,
            service_name,
            provider,
            stack_name,
            endpoint: None,
            ca_cert: None,
            kubeconfig: None,
            location: None,
            external_ip: None,
            status: InfrastructureStatus::Provisioning,
            error: None,
            log: String::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}
