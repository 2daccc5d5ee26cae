use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::debug;

use super::{
    AdapterError, AnalysisResult, BuildOutput, BuildSpec, DeployOutput, DeployTarget,
    InfrastructureOutputs, PhaseContext, ProgressSink, Provisioner, ProvisionRequest,
};
use super::{Analyzer, ImageBuilder, WorkloadDeployer};

const STEP: Duration = Duration::from_millis(50);

/// Sleeps one simulated work step, returning early with `Cancelled` when the
/// phase context is cancelled.
async fn pace(ctx: &PhaseContext) -> Result<(), AdapterError> {
    tokio::select! {
        _ = ctx.cancelled() => Err(AdapterError::Cancelled),
        _ = sleep(STEP) => Ok(()),
    }
}

fn digest_of(input: &str) -> String {
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    let a = hasher.finish();
    input.len().hash(&mut hasher);
    let b = hasher.finish();

    format!("sha256:{a:016x}{b:016x}")
}

/// Stand-in analyzer: guesses the toolchain from the repository reference.
pub struct SimulatedAnalyzer;

#[async_trait]
impl Analyzer for SimulatedAnalyzer {
    async fn analyze(
        &self,
        ctx: &PhaseContext,
        source_url: &str,
    ) -> Result<AnalysisResult, AdapterError> {
        pace(ctx).await?;

        let (language, build_tool) = if source_url.contains("rust") || source_url.ends_with("-rs") {
            ("rust", Some("cargo"))
        } else if source_url.contains("node") || source_url.contains("js") {
            ("javascript", Some("npm"))
        } else if source_url.contains("py") {
            ("python", Some("pip"))
        } else {
            ("go", Some("go"))
        };

        debug!(source_url, language, "simulated analysis");

        Ok(AnalysisResult {
            language: language.to_string(),
            framework: None,
            build_tool: build_tool.map(str::to_string),
            port: 8080,
            has_dockerfile: source_url.contains("docker"),
            dependencies: Vec::new(),
        })
    }
}

/// Stand-in builder: "produces" a deterministic image tag and digest.
pub struct SimulatedBuilder;

#[async_trait]
impl ImageBuilder for SimulatedBuilder {
    async fn build_image(
        &self,
        ctx: &PhaseContext,
        spec: &BuildSpec,
        progress: &dyn ProgressSink,
    ) -> Result<BuildOutput, AdapterError> {
        let started = Instant::now();
        let image_tag = format!("registry.skylift.dev/{}:{}", spec.app_name, spec.version);

        progress
            .push(&format!("generating dockerfile for {}\n", spec.analysis.language))
            .await;
        pace(ctx).await?;
        progress.push("building image layers\n").await;
        pace(ctx).await?;
        progress.push(&format!("pushing {image_tag}\n")).await;
        pace(ctx).await?;

        Ok(BuildOutput {
            digest: digest_of(&image_tag),
            image_tag,
            duration: started.elapsed(),
        })
    }
}

/// Stand-in provisioner: converges on deterministic outputs for a stack and
/// forgets it again on destroy.
pub struct SimulatedProvisioner;

#[async_trait]
impl Provisioner for SimulatedProvisioner {
    async fn provision(
        &self,
        ctx: &PhaseContext,
        request: &ProvisionRequest,
        progress: &dyn ProgressSink,
    ) -> Result<InfrastructureOutputs, AdapterError> {
        progress
            .push(&format!("applying stack {}\n", request.stack_name))
            .await;
        pace(ctx).await?;
        progress
            .push(&format!("cluster {} converging\n", request.cluster_name))
            .await;
        pace(ctx).await?;

        Ok(InfrastructureOutputs {
            endpoint: format!("https://{}.cluster.local", request.stack_name),
            ca_cert: format!("-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----", request.stack_name),
            kubeconfig: format!(
                "apiVersion: v1\nclusters:\n- name: {}\n  cluster:\n    server: https://{}.cluster.local",
                request.cluster_name, request.stack_name
            ),
            location: request.region.clone(),
        })
    }

    async fn destroy(&self, ctx: &PhaseContext, stack_name: &str) -> Result<(), AdapterError> {
        debug!(stack_name, "simulated destroy");
        pace(ctx).await?;

        Ok(())
    }
}

/// Stand-in deployer: reports a deterministic external address once the
/// workload "settles".
pub struct SimulatedDeployer;

#[async_trait]
impl WorkloadDeployer for SimulatedDeployer {
    async fn deploy(
        &self,
        ctx: &PhaseContext,
        target: &DeployTarget,
        progress: &dyn ProgressSink,
    ) -> Result<DeployOutput, AdapterError> {
        progress
            .push(&format!("installing {} into {}\n", target.image_tag, target.namespace))
            .await;
        pace(ctx).await?;
        progress.push("waiting for workload to become ready\n").await;
        pace(ctx).await?;

        let mut hasher = DefaultHasher::new();
        target.service_name.hash(&mut hasher);
        let octets = hasher.finish().to_be_bytes();

        Ok(DeployOutput {
            external_ip: format!("34.{}.{}.{}", octets[0], octets[1], octets[2]),
        })
    }
}
