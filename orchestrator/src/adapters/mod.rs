mod simulated;

pub use simulated::{SimulatedAnalyzer, SimulatedBuilder, SimulatedDeployer, SimulatedProvisioner};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, ErrorKind};

/// Errors an adapter is allowed to return. The engine never inspects adapter
/// failures beyond this classification.
#[derive(thiserror::Error, Debug)]
pub enum AdapterError {
    /// Worth retrying: network blip, dependency overload
    #[error("transient: {0}")]
    Transient(String),
    /// Will not succeed on retry: unsupported input, auth rejected, quota denied
    #[error("permanent: {0}")]
    Permanent(String),
    /// The operation exceeded the budget the engine gave it
    #[error("operation exceeded its {0:?} budget")]
    Timeout(Duration),
    /// The phase context was cancelled; state was left resumable
    #[error("cancelled")]
    Cancelled,
}

impl AdapterError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Transient(_) => ErrorKind::Transient,
            AdapterError::Permanent(_) => ErrorKind::Permanent,
            AdapterError::Timeout(_) => ErrorKind::Timeout,
            AdapterError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Cancellation scope an adapter call runs under. Derived per phase from the
/// execution context; adapters must return promptly once it is cancelled.
#[derive(Clone)]
pub struct PhaseContext {
    cancellation: CancellationToken,
}

impl PhaseContext {
    pub fn new(cancellation: CancellationToken) -> Self {
        Self { cancellation }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Bail-out point for adapters working in steps.
    pub fn checkpoint(&self) -> Result<(), AdapterError> {
        if self.is_cancelled() {
            Err(AdapterError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Receives log chunks from an adapter while a phase runs. Bound to one child
/// record; appends preserve the order the adapter emits.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn push(&self, chunk: &str);
}

/// What the analyzer learned about a source tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub language: String,
    pub framework: Option<String>,
    pub build_tool: Option<String>,
    /// Port the application listens on, as detected or defaulted
    pub port: u16,
    pub has_dockerfile: bool,
    pub dependencies: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct BuildSpec {
    pub deployment_id: Uuid,
    pub build_id: Uuid,
    pub app_name: String,
    pub version: String,
    pub source_url: String,
    pub analysis: AnalysisResult,
}

#[derive(Clone, Debug)]
pub struct BuildOutput {
    /// Post-push registry form of the tag
    pub image_tag: String,
    pub digest: String,
    pub duration: Duration,
}

#[derive(Clone, Debug)]
pub struct ProvisionRequest {
    /// Deterministic per-deployment name; repeated provision calls for the
    /// same stack converge
    pub stack_name: String,
    pub provider: String,
    pub region: String,
    pub cluster_name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InfrastructureOutputs {
    pub endpoint: String,
    pub ca_cert: String,
    pub kubeconfig: String,
    pub location: String,
}

#[derive(Clone, Debug)]
pub struct DeployTarget {
    pub endpoint: String,
    pub kubeconfig: String,
    pub namespace: String,
    pub service_name: String,
    pub image_tag: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct DeployOutput {
    pub external_ip: String,
}

/// Inspects a source tree for language, framework, and build inputs. Pure
/// over the tree; needs no retries of its own.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        ctx: &PhaseContext,
        source_url: &str,
    ) -> Result<AnalysisResult, AdapterError>;
}

/// Produces a container image and pushes it to the registry. Must converge
/// when retried with the same spec and an existing build record.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build_image(
        &self,
        ctx: &PhaseContext,
        spec: &BuildSpec,
        progress: &dyn ProgressSink,
    ) -> Result<BuildOutput, AdapterError>;
}

/// Instantiates and tears down cloud infrastructure, keyed by the stack name.
/// Both operations are idempotent: repeated calls converge.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        ctx: &PhaseContext,
        request: &ProvisionRequest,
        progress: &dyn ProgressSink,
    ) -> Result<InfrastructureOutputs, AdapterError>;

    async fn destroy(&self, ctx: &PhaseContext, stack_name: &str) -> Result<(), AdapterError>;
}

/// Installs or upgrades the workload in the cluster and waits for it to
/// become ready with an external address.
#[async_trait]
pub trait WorkloadDeployer: Send + Sync {
    async fn deploy(
        &self,
        ctx: &PhaseContext,
        target: &DeployTarget,
        progress: &dyn ProgressSink,
    ) -> Result<DeployOutput, AdapterError>;
}

/// Deterministic stack name for a deployment, keying idempotent provision
/// and destroy.
pub fn stack_name(deployment_id: &Uuid) -> String {
    let hex = deployment_id.simple().to_string();

    format!("skylift-{}", &hex[..8])
}

/// The four collaborators an engine drives. Constructed once at boot and
/// shared by every worker.
#[derive(Clone)]
pub struct AdapterSet {
    pub analyzer: Arc<dyn Analyzer>,
    pub builder: Arc<dyn ImageBuilder>,
    pub provisioner: Arc<dyn Provisioner>,
    pub deployer: Arc<dyn WorkloadDeployer>,
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSet").finish_non_exhaustive()
    }
}

impl AdapterSet {
    /// Construction over the closed set of adapter implementations, keyed by
    /// the configured name.
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "simulated" => Ok(Self::simulated()),
            other => Err(Error::UnknownAdapterSet(other.to_string())),
        }
    }

    /// The in-tree set: deterministic local stand-ins for the cloud, used by
    /// local development.
    pub fn simulated() -> Self {
        Self {
            analyzer: Arc::new(SimulatedAnalyzer),
            builder: Arc::new(SimulatedBuilder),
            provisioner: Arc::new(SimulatedProvisioner),
            deployer: Arc::new(SimulatedDeployer),
        }
    }
}
