use std::cmp::min;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use skylift_common::log::Level;
use skylift_common::{Job, JobKind, Status};

use crate::adapters::{
    stack_name, AdapterError, AdapterSet, DeployTarget, PhaseContext, ProvisionRequest,
};
use crate::persistence::{Deployment, Infrastructure, Persistence, PersistenceError};
use crate::tracker::Tracker;

/// In-place retries of a phase before the job is handed back to the queue
const MAX_PHASE_TRIES: u32 = 3;
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Base for the requeue delay, doubled per delivery attempt
const REQUEUE_DELAY: Duration = Duration::from_secs(10);
const MAX_REQUEUE_DELAY: Duration = Duration::from_secs(300);
/// Short requeue delay after a shutdown interruption so another worker
/// resumes quickly
pub const INTERRUPT_DELAY: Duration = Duration::from_secs(5);
/// Destroy attempts stop being retried past this delivery count; the error is
/// recorded and the teardown proceeds
const MAX_DESTROY_ATTEMPTS: u32 = 5;

#[derive(Clone, Copy, Debug)]
pub struct PhaseTimeouts {
    pub analyze: Duration,
    pub build: Duration,
    pub provision: Duration,
    pub deploy: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            analyze: Duration::from_secs(60),
            build: Duration::from_secs(30 * 60),
            provision: Duration::from_secs(30 * 60),
            deploy: Duration::from_secs(15 * 60),
        }
    }
}

/// What the worker should do with its reservation once the engine returns.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Terminal success, or a terminal failure already persisted; ack
    Complete,
    /// Transient failure; hand the job back with a delay
    Retry { delay: Duration },
    /// Another actor owns the deployment; ack without writing
    Abandon,
    /// Shutdown arrived mid-flight; state is intact, hand back shortly
    Interrupted,
}

/// Drives a single reserved job through the phase pipeline. One engine runs
/// one deployment at a time; concurrency lives in the worker pool.
#[derive(Clone)]
pub struct Engine {
    persistence: Persistence,
    adapters: AdapterSet,
    timeouts: PhaseTimeouts,
}

impl Engine {
    pub fn new(persistence: Persistence, adapters: AdapterSet, timeouts: PhaseTimeouts) -> Self {
        Self {
            persistence,
            adapters,
            timeouts,
        }
    }

    #[instrument(skip(self, cancellation), fields(deployment_id = %job.deployment_id, kind = %job.kind, attempt = job.attempt))]
    pub async fn execute(&self, job: &Job, cancellation: CancellationToken) -> Outcome {
        let deployment = match self.persistence.get_deployment(&job.deployment_id).await {
            Ok(deployment) => deployment,
            Err(PersistenceError::NotFound) => {
                warn!("job for an unknown deployment, dropping it");
                return Outcome::Complete;
            }
            Err(error) => {
                warn!(%error, "could not load deployment");
                return Outcome::Retry {
                    delay: REQUEUE_DELAY,
                };
            }
        };

        let tracker = Tracker::new(self.persistence.clone(), deployment.id, Uuid::new_v4());

        match job.kind {
            JobKind::Deploy => self.deploy(deployment, job.attempt, &tracker, &cancellation).await,
            JobKind::Destroy => {
                self.destroy(deployment, job.attempt, &tracker, &cancellation)
                    .await
            }
            JobKind::Rollback => {
                if deployment.status.is_terminal() || deployment.deleted_at.is_some() {
                    return Outcome::Complete;
                }

                self.fail(
                    deployment,
                    "rollback requested",
                    job.attempt,
                    &tracker,
                    &cancellation,
                )
                .await
            }
        }
    }

    /// The pipeline walk. Re-enters at whatever phase the persisted status
    /// says, so a job redelivered after a crash or requeue picks up where
    /// the last worker left off.
    async fn deploy(
        &self,
        mut deployment: Deployment,
        attempt: u32,
        tracker: &Tracker,
        cancellation: &CancellationToken,
    ) -> Outcome {
        if deployment.deleted_at.is_some() {
            return Outcome::Complete;
        }

        loop {
            match deployment.status {
                Status::Exposed | Status::Failed => return Outcome::Complete,
                Status::RollingBack => {
                    // A previous worker was interrupted mid-compensation
                    let message = deployment
                        .error
                        .clone()
                        .unwrap_or_else(|| "resuming interrupted compensation".to_string());

                    return self
                        .fail(deployment, &message, attempt, tracker, cancellation)
                        .await;
                }
                Status::Queued => {
                    if let Err(outcome) =
                        self.transition(&mut deployment, Status::Analyzing, tracker).await
                    {
                        return outcome;
                    }
                }
                Status::Analyzing => {
                    if let Err(outcome) =
                        self.analyze(&mut deployment, attempt, tracker, cancellation).await
                    {
                        return outcome;
                    }
                }
                Status::Building => {
                    if let Err(outcome) =
                        self.build(&mut deployment, attempt, tracker, cancellation).await
                    {
                        return outcome;
                    }
                }
                Status::Provisioning => {
                    if let Err(outcome) =
                        self.provision(&mut deployment, attempt, tracker, cancellation).await
                    {
                        return outcome;
                    }
                }
                Status::Deploying => {
                    match self.expose(&mut deployment, attempt, tracker, cancellation).await {
                        Ok(()) => return Outcome::Complete,
                        Err(outcome) => return outcome,
                    }
                }
            }
        }
    }

    async fn analyze(
        &self,
        deployment: &mut Deployment,
        attempt: u32,
        tracker: &Tracker,
        cancellation: &CancellationToken,
    ) -> Result<(), Outcome> {
        let result = {
            let analyzer = self.adapters.analyzer.clone();
            let source_url = deployment.source_url.clone();

            self.run_phase(self.timeouts.analyze, cancellation, move |ctx| {
                let analyzer = analyzer.clone();
                let source_url = source_url.clone();
                async move { analyzer.analyze(&ctx, &source_url).await }
            })
            .await
        };

        match result {
            Ok(analysis) => {
                if let Err(error) = self.persistence.set_analysis(&deployment.id, &analysis).await {
                    return Err(db_outcome(error));
                }
                deployment.analysis = Some(sqlx::types::Json(analysis.clone()));
                tracker
                    .log(
                        Status::Analyzing,
                        Level::Info,
                        format!("detected {} application", analysis.language),
                    )
                    .await;
                self.phase_succeeded(deployment).await;

                self.transition(deployment, Status::Building, tracker).await
            }
            Err(error) => Err(self
                .phase_failed(deployment, error, attempt, tracker, cancellation)
                .await),
        }
    }

    async fn build(
        &self,
        deployment: &mut Deployment,
        attempt: u32,
        tracker: &Tracker,
        cancellation: &CancellationToken,
    ) -> Result<(), Outcome> {
        let analysis = match deployment.analysis.as_ref() {
            Some(analysis) => analysis.0.clone(),
            None => {
                // Status says building, so analysis must have been persisted
                return Err(self
                    .phase_failed(
                        deployment,
                        AdapterError::permanent("analysis result is missing"),
                        attempt,
                        tracker,
                        cancellation,
                    )
                    .await);
            }
        };

        // Pick the unfinished attempt back up on resume, otherwise start a
        // fresh one
        let build_id = match self.persistence.active_build(&deployment.id).await {
            Ok(Some(build)) => build.id,
            Ok(None) => Uuid::new_v4(),
            Err(error) => return Err(db_outcome(error)),
        };
        let build = match tracker.start_build(build_id).await {
            Ok(build) => build,
            Err(error) => return Err(db_outcome(error)),
        };

        let spec = crate::adapters::BuildSpec {
            deployment_id: deployment.id,
            build_id: build.id,
            app_name: deployment.app_name.clone(),
            version: deployment.version.clone(),
            source_url: deployment.source_url.clone(),
            analysis,
        };
        let sink = tracker.build_progress(build.id);

        let result = {
            let builder = self.adapters.builder.clone();
            let spec = &spec;
            let sink = &sink;

            self.run_phase(self.timeouts.build, cancellation, move |ctx| {
                let builder = builder.clone();
                async move { builder.build_image(&ctx, spec, sink).await }
            })
            .await
        };

        match result {
            Ok(output) => {
                if let Err(error) = tracker.complete_build(&build.id, &output).await {
                    return Err(db_outcome(error));
                }
                tracker
                    .log(
                        Status::Building,
                        Level::Info,
                        format!("image {} pushed", output.image_tag),
                    )
                    .await;
                self.phase_succeeded(deployment).await;

                self.transition(deployment, Status::Provisioning, tracker).await
            }
            Err(error) => {
                // An interrupted build stays reusable; anything else finishes
                // this attempt
                if !matches!(error, AdapterError::Cancelled) {
                    if let Err(db) = tracker.fail_build(&build.id, &error.to_string()).await {
                        warn!(error = %db, "could not mark build failed");
                    }
                }

                Err(self
                    .phase_failed(deployment, error, attempt, tracker, cancellation)
                    .await)
            }
        }
    }

    async fn provision(
        &self,
        deployment: &mut Deployment,
        attempt: u32,
        tracker: &Tracker,
        cancellation: &CancellationToken,
    ) -> Result<(), Outcome> {
        let infrastructure = match self.persistence.current_infrastructure(&deployment.id).await {
            Ok(Some(existing)) => existing,
            Ok(None) => Infrastructure::provisioning(
                Uuid::new_v4(),
                deployment.id,
                deployment.provider.clone(),
                stack_name(&deployment.id),
                format!("skylift-{}", deployment.region),
                deployment.app_name.clone(),
                deployment.app_name.clone(),
            ),
            Err(error) => return Err(db_outcome(error)),
        };
        let infrastructure = match tracker.start_infrastructure(infrastructure).await {
            Ok(infrastructure) => infrastructure,
            Err(error) => return Err(db_outcome(error)),
        };

        let request = ProvisionRequest {
            stack_name: infrastructure.stack_name.clone(),
            provider: deployment.provider.clone(),
            region: deployment.region.clone(),
            cluster_name: infrastructure.cluster_name.clone(),
            namespace: infrastructure.namespace.clone(),
        };
        let sink = tracker.infrastructure_progress(infrastructure.id);

        let result = {
            let provisioner = self.adapters.provisioner.clone();
            let request = &request;
            let sink = &sink;

            self.run_phase(self.timeouts.provision, cancellation, move |ctx| {
                let provisioner = provisioner.clone();
                async move { provisioner.provision(&ctx, request, sink).await }
            })
            .await
        };

        match result {
            Ok(outputs) => {
                if let Err(error) = tracker
                    .complete_infrastructure(&infrastructure.id, &outputs)
                    .await
                {
                    return Err(db_outcome(error));
                }
                tracker
                    .log(
                        Status::Provisioning,
                        Level::Info,
                        format!("cluster ready at {}", outputs.endpoint),
                    )
                    .await;
                self.phase_succeeded(deployment).await;

                self.transition(deployment, Status::Deploying, tracker).await
            }
            Err(error) => Err(self
                .phase_failed(deployment, error, attempt, tracker, cancellation)
                .await),
        }
    }

    async fn expose(
        &self,
        deployment: &mut Deployment,
        attempt: u32,
        tracker: &Tracker,
        cancellation: &CancellationToken,
    ) -> Result<(), Outcome> {
        let infrastructure = match self.persistence.current_infrastructure(&deployment.id).await {
            Ok(Some(infrastructure)) => infrastructure,
            Ok(None) => {
                return Err(self
                    .phase_failed(
                        deployment,
                        AdapterError::permanent("no infrastructure to deploy into"),
                        attempt,
                        tracker,
                        cancellation,
                    )
                    .await);
            }
            Err(error) => return Err(db_outcome(error)),
        };
        let image_tag = match self.persistence.latest_successful_build(&deployment.id).await {
            Ok(Some(build)) => build.image_tag.unwrap_or_default(),
            Ok(None) => {
                return Err(self
                    .phase_failed(
                        deployment,
                        AdapterError::permanent("no successful build to deploy"),
                        attempt,
                        tracker,
                        cancellation,
                    )
                    .await);
            }
            Err(error) => return Err(db_outcome(error)),
        };

        let port = deployment
            .analysis
            .as_ref()
            .map(|analysis| analysis.0.port)
            .filter(|port| *port != 0)
            .unwrap_or(deployment.app_port);
        let target = DeployTarget {
            endpoint: infrastructure.endpoint.clone().unwrap_or_default(),
            kubeconfig: infrastructure.kubeconfig.clone().unwrap_or_default(),
            namespace: infrastructure.namespace.clone(),
            service_name: infrastructure.service_name.clone(),
            image_tag,
            port,
        };
        let sink = tracker.infrastructure_progress(infrastructure.id);

        let result = {
            let deployer = self.adapters.deployer.clone();
            let target = &target;
            let sink = &sink;

            self.run_phase(self.timeouts.deploy, cancellation, move |ctx| {
                let deployer = deployer.clone();
                async move { deployer.deploy(&ctx, target, sink).await }
            })
            .await
        };

        match result {
            Ok(output) => {
                let url = format!("http://{}:{}", output.external_ip, target.port);

                if let Err(error) = self
                    .persistence
                    .set_infrastructure_external_ip(&infrastructure.id, &output.external_ip)
                    .await
                {
                    return Err(db_outcome(error));
                }
                if let Err(error) = self
                    .persistence
                    .set_exposed(&deployment.id, &output.external_ip, &url)
                    .await
                {
                    return Err(db_outcome(error));
                }
                self.phase_succeeded(deployment).await;
                self.transition(deployment, Status::Exposed, tracker).await?;
                tracker
                    .log(
                        Status::Exposed,
                        Level::Info,
                        format!("application exposed at {url}"),
                    )
                    .await;
                info!(deployment_id = %deployment.id, %url, "deployment exposed");

                Ok(())
            }
            Err(error) => Err(self
                .phase_failed(deployment, error, attempt, tracker, cancellation)
                .await),
        }
    }

    /// Tears the stack down and soft-deletes the aggregate.
    async fn destroy(
        &self,
        deployment: Deployment,
        attempt: u32,
        tracker: &Tracker,
        cancellation: &CancellationToken,
    ) -> Outcome {
        if deployment.deleted_at.is_some() {
            // Redelivered after the teardown already landed
            return Outcome::Complete;
        }

        if let Ok(Some(infrastructure)) =
            self.persistence.current_infrastructure(&deployment.id).await
        {
            match self
                .destroy_stack(&infrastructure, tracker, cancellation)
                .await
            {
                Ok(()) => {}
                Err(AdapterError::Cancelled) => return Outcome::Interrupted,
                Err(error) if error.kind() == crate::error::ErrorKind::Transient
                    && attempt < MAX_DESTROY_ATTEMPTS =>
                {
                    return Outcome::Retry {
                        delay: requeue_delay(attempt),
                    };
                }
                Err(error) => {
                    // Teardown is best effort past this point; record and move on
                    if let Err(db) = self
                        .persistence
                        .set_error(&deployment.id, &format!("destroy failed: {error}"))
                        .await
                    {
                        warn!(error = %db, "could not record destroy failure");
                    }
                }
            }
        }

        match self.persistence.soft_delete_deployment(&deployment.id).await {
            Ok(()) | Err(PersistenceError::NotFound) => Outcome::Complete,
            Err(error) => db_outcome(error),
        }
    }

    /// The compensation path: records the failure, destroys partially created
    /// infrastructure when any exists, and lands the deployment in `Failed`.
    async fn fail(
        &self,
        mut deployment: Deployment,
        message: &str,
        attempt: u32,
        tracker: &Tracker,
        cancellation: &CancellationToken,
    ) -> Outcome {
        if let Err(error) = self.persistence.set_error(&deployment.id, message).await {
            return db_outcome(error);
        }

        let infrastructure = match self.persistence.current_infrastructure(&deployment.id).await {
            Ok(infrastructure) => infrastructure,
            Err(error) => return db_outcome(error),
        };

        let Some(infrastructure) = infrastructure else {
            // Provisioning never began; straight to Failed
            if let Err(outcome) = self.transition(&mut deployment, Status::Failed, tracker).await {
                return outcome;
            }
            tracker.log(deployment.status, Level::Error, message.to_string()).await;

            return Outcome::Complete;
        };

        if deployment.status != Status::RollingBack {
            if let Err(outcome) = self
                .transition(&mut deployment, Status::RollingBack, tracker)
                .await
            {
                return outcome;
            }
        }
        tracker
            .log(
                Status::RollingBack,
                Level::Warn,
                format!("destroying stack {}", infrastructure.stack_name),
            )
            .await;

        match self
            .destroy_stack(&infrastructure, tracker, cancellation)
            .await
        {
            Ok(()) => {
                tracker
                    .log(
                        Status::RollingBack,
                        Level::Info,
                        format!("stack {} destroyed", infrastructure.stack_name),
                    )
                    .await;
            }
            Err(AdapterError::Cancelled) => {
                // Still RollingBack; the next delivery resumes the teardown
                return Outcome::Interrupted;
            }
            Err(destroy_error) if destroy_error.kind() == crate::error::ErrorKind::Transient
                && attempt < MAX_DESTROY_ATTEMPTS =>
            {
                return Outcome::Retry {
                    delay: requeue_delay(attempt),
                };
            }
            Err(destroy_error) => {
                // Compensation failures are recorded but never re-looped;
                // both errors stay visible
                let combined = format!("{message}; compensation failed: {destroy_error}");

                if let Err(db) = tracker
                    .fail_infrastructure(&infrastructure.id, &destroy_error.to_string())
                    .await
                {
                    warn!(error = %db, "could not mark infrastructure failed");
                }
                if let Err(db) = self.persistence.set_error(&deployment.id, &combined).await {
                    warn!(error = %db, "could not record compensation failure");
                }
                tracker.log(Status::RollingBack, Level::Error, combined).await;
            }
        }

        if let Err(outcome) = self.transition(&mut deployment, Status::Failed, tracker).await {
            return outcome;
        }
        tracker.log(Status::Failed, Level::Error, message.to_string()).await;

        Outcome::Complete
    }

    /// One destroy invocation against the provisioner, keyed by the stored
    /// stack name, with the infrastructure marked on success.
    async fn destroy_stack(
        &self,
        infrastructure: &Infrastructure,
        tracker: &Tracker,
        cancellation: &CancellationToken,
    ) -> Result<(), AdapterError> {
        let result = {
            let provisioner = self.adapters.provisioner.clone();
            let stack_name = infrastructure.stack_name.clone();

            self.run_phase(self.timeouts.provision, cancellation, move |ctx| {
                let provisioner = provisioner.clone();
                let stack_name = stack_name.clone();
                async move { provisioner.destroy(&ctx, &stack_name).await }
            })
            .await
        };

        if result.is_ok() {
            if let Err(error) = tracker.mark_destroying(&infrastructure.id).await {
                warn!(%error, "could not mark infrastructure destroying");
            }
        }

        result
    }

    /// Runs one adapter call under the phase budget, retrying transient
    /// failures in place a bounded number of times.
    async fn run_phase<T, F, Fut>(
        &self,
        budget: Duration,
        cancellation: &CancellationToken,
        mut op: F,
    ) -> Result<T, AdapterError>
    where
        F: FnMut(PhaseContext) -> Fut,
        Fut: std::future::Future<Output = Result<T, AdapterError>>,
    {
        let mut tries = 0;

        loop {
            let ctx = PhaseContext::new(cancellation.child_token());
            let result = match timeout(budget, op(ctx)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(AdapterError::Timeout(budget)),
            };

            match result {
                Err(AdapterError::Transient(message)) if tries + 1 < MAX_PHASE_TRIES => {
                    tries += 1;
                    warn!(%message, tries, "transient phase failure, retrying in place");

                    tokio::select! {
                        _ = cancellation.cancelled() => return Err(AdapterError::Cancelled),
                        _ = sleep(backoff(tries)) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// Classifies a phase failure and decides the job's fate.
    async fn phase_failed(
        &self,
        deployment: &mut Deployment,
        error: AdapterError,
        attempt: u32,
        tracker: &Tracker,
        cancellation: &CancellationToken,
    ) -> Outcome {
        use crate::error::ErrorKind;

        let phase = deployment.status;

        match error.kind() {
            ErrorKind::Cancelled => {
                // Shutdown-driven: no status write, quick hand-off
                info!(status = %phase, "interrupted by shutdown, leaving state for another worker");
                Outcome::Interrupted
            }
            ErrorKind::Transient => {
                tracker
                    .log(phase, Level::Warn, format!("{phase} phase failed: {error}"))
                    .await;
                if let Err(db) = self.persistence.set_error(&deployment.id, &error.to_string()).await
                {
                    warn!(error = %db, "could not record phase failure");
                }

                Outcome::Retry {
                    delay: requeue_delay(attempt),
                }
            }
            ErrorKind::Timeout => {
                if deployment.timeout_phase == Some(phase) {
                    // Second strike in the same phase
                    tracker
                        .log(phase, Level::Error, format!("{phase} phase timed out twice"))
                        .await;

                    self.fail(
                        deployment.clone(),
                        &format!("{phase} phase timed out twice"),
                        attempt,
                        tracker,
                        cancellation,
                    )
                    .await
                } else {
                    tracker
                        .log(
                            phase,
                            Level::Warn,
                            format!("{phase} phase timed out, will retry once"),
                        )
                        .await;
                    if let Err(db) = self
                        .persistence
                        .record_timeout_strike(&deployment.id, phase)
                        .await
                    {
                        warn!(error = %db, "could not record timeout strike");
                    }
                    if let Err(db) = self.persistence.set_error(&deployment.id, &error.to_string()).await
                    {
                        warn!(error = %db, "could not record phase failure");
                    }

                    Outcome::Retry {
                        delay: requeue_delay(attempt),
                    }
                }
            }
            _ => {
                tracker
                    .log(phase, Level::Error, format!("{phase} phase failed: {error}"))
                    .await;

                self.fail(
                    deployment.clone(),
                    &format!("{phase} phase failed: {error}"),
                    attempt,
                    tracker,
                    cancellation,
                )
                .await
            }
        }
    }

    /// Book-keeping after any phase lands: a pending timeout strike for it is
    /// spent.
    async fn phase_succeeded(&self, deployment: &mut Deployment) {
        if deployment.timeout_phase.is_some() {
            if let Err(error) = self.persistence.clear_timeout_strike(&deployment.id).await {
                warn!(%error, "could not clear timeout strike");
            }
            deployment.timeout_phase = None;
        }
    }

    /// The guarded status move. A conflict means another actor took over the
    /// deployment and this worker must abandon the job without writing.
    async fn transition(
        &self,
        deployment: &mut Deployment,
        next: Status,
        tracker: &Tracker,
    ) -> Result<(), Outcome> {
        match self
            .persistence
            .update_status(&deployment.id, deployment.status, next)
            .await
        {
            Ok(()) => {
                deployment.status = next;
                tracker
                    .log(next, Level::Info, format!("entering {next} state"))
                    .await;

                Ok(())
            }
            Err(PersistenceError::Conflict { .. }) => {
                warn!(%next, "deployment status moved under us, abandoning the job");

                Err(Outcome::Abandon)
            }
            Err(PersistenceError::NotFound) => Err(Outcome::Complete),
            Err(error) => {
                warn!(%error, "could not transition deployment status");

                Err(Outcome::Retry {
                    delay: REQUEUE_DELAY,
                })
            }
        }
    }
}

fn backoff(tries: u32) -> Duration {
    min(Duration::from_secs(3u64.pow(tries)), MAX_BACKOFF)
}

fn requeue_delay(attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(5);

    min(REQUEUE_DELAY * 2u32.pow(doublings), MAX_REQUEUE_DELAY)
}

/// Maps a repository error seen mid-phase onto the job's fate.
fn db_outcome(error: PersistenceError) -> Outcome {
    use crate::error::ErrorKind;

    match error.kind() {
        ErrorKind::Conflict => Outcome::Abandon,
        ErrorKind::NotFound => Outcome::Complete,
        _ => Outcome::Retry {
            delay: REQUEUE_DELAY,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;

    use crate::adapters::{
        AdapterSet, AnalysisResult, Analyzer, BuildOutput, BuildSpec, DeployOutput, DeployTarget,
        ImageBuilder, InfrastructureOutputs, ProgressSink, Provisioner, ProvisionRequest,
        WorkloadDeployer,
    };
    use crate::persistence::{BuildStatus, DeploymentRequest, InfrastructureStatus};

    use super::*;

    struct OkAnalyzer;

    #[async_trait]
    impl Analyzer for OkAnalyzer {
        async fn analyze(
            &self,
            ctx: &PhaseContext,
            _source_url: &str,
        ) -> Result<AnalysisResult, AdapterError> {
            ctx.checkpoint()?;

            Ok(AnalysisResult {
                language: "go".to_string(),
                framework: None,
                build_tool: Some("go".to_string()),
                port: 8080,
                has_dockerfile: false,
                dependencies: Vec::new(),
            })
        }
    }

    /// Builder that plays a script of failures before succeeding.
    struct ScriptedBuilder {
        failures: Mutex<Vec<AdapterError>>,
    }

    impl ScriptedBuilder {
        fn ok() -> Self {
            Self {
                failures: Mutex::new(Vec::new()),
            }
        }

        fn failing_with(failures: Vec<AdapterError>) -> Self {
            Self {
                failures: Mutex::new(failures),
            }
        }
    }

    #[async_trait]
    impl ImageBuilder for ScriptedBuilder {
        async fn build_image(
            &self,
            ctx: &PhaseContext,
            spec: &BuildSpec,
            progress: &dyn ProgressSink,
        ) -> Result<BuildOutput, AdapterError> {
            ctx.checkpoint()?;

            if let Some(failure) = self.failures.lock().await.pop() {
                return Err(failure);
            }

            progress.push("pushed\n").await;

            Ok(BuildOutput {
                image_tag: format!("registry.local/{}:{}", spec.app_name, spec.version),
                digest: "sha256:feed".to_string(),
                duration: Duration::from_millis(1),
            })
        }
    }

    struct ScriptedProvisioner {
        failures: Mutex<Vec<AdapterError>>,
        destroyed: Mutex<Vec<String>>,
        destroy_failures: Mutex<Vec<AdapterError>>,
    }

    impl ScriptedProvisioner {
        fn ok() -> Self {
            Self {
                failures: Mutex::new(Vec::new()),
                destroyed: Mutex::new(Vec::new()),
                destroy_failures: Mutex::new(Vec::new()),
            }
        }

        fn failing_with(failures: Vec<AdapterError>) -> Self {
            Self {
                failures: Mutex::new(failures),
                ..Self::ok()
            }
        }
    }

    #[async_trait]
    impl Provisioner for ScriptedProvisioner {
        async fn provision(
            &self,
            ctx: &PhaseContext,
            request: &ProvisionRequest,
            _progress: &dyn ProgressSink,
        ) -> Result<InfrastructureOutputs, AdapterError> {
            ctx.checkpoint()?;

            if let Some(failure) = self.failures.lock().await.pop() {
                return Err(failure);
            }

            Ok(InfrastructureOutputs {
                endpoint: format!("https://{}.local", request.stack_name),
                ca_cert: "ca".to_string(),
                kubeconfig: "kubeconfig".to_string(),
                location: request.region.clone(),
            })
        }

        async fn destroy(&self, ctx: &PhaseContext, stack_name: &str) -> Result<(), AdapterError> {
            ctx.checkpoint()?;

            if let Some(failure) = self.destroy_failures.lock().await.pop() {
                return Err(failure);
            }

            self.destroyed.lock().await.push(stack_name.to_string());

            Ok(())
        }
    }

    struct ScriptedDeployer {
        failures: Mutex<Vec<AdapterError>>,
        calls: AtomicU32,
    }

    impl ScriptedDeployer {
        fn ok() -> Self {
            Self {
                failures: Mutex::new(Vec::new()),
                calls: AtomicU32::new(0),
            }
        }

        fn failing_with(failures: Vec<AdapterError>) -> Self {
            Self {
                failures: Mutex::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl WorkloadDeployer for ScriptedDeployer {
        async fn deploy(
            &self,
            ctx: &PhaseContext,
            _target: &DeployTarget,
            _progress: &dyn ProgressSink,
        ) -> Result<DeployOutput, AdapterError> {
            ctx.checkpoint()?;
            self.calls.fetch_add(1, Ordering::SeqCst);

            if let Some(failure) = self.failures.lock().await.pop() {
                return Err(failure);
            }

            Ok(DeployOutput {
                external_ip: "34.10.0.5".to_string(),
            })
        }
    }

    fn adapters(
        builder: ScriptedBuilder,
        provisioner: ScriptedProvisioner,
        deployer: ScriptedDeployer,
    ) -> (AdapterSet, Arc<ScriptedProvisioner>, Arc<ScriptedDeployer>) {
        let provisioner = Arc::new(provisioner);
        let deployer = Arc::new(deployer);
        let set = AdapterSet {
            analyzer: Arc::new(OkAnalyzer),
            builder: Arc::new(builder),
            provisioner: provisioner.clone(),
            deployer: deployer.clone(),
        };

        (set, provisioner, deployer)
    }

    async fn deployment(persistence: &Persistence) -> Deployment {
        persistence
            .create_deployment(DeploymentRequest {
                name: "orders-prod".to_string(),
                app_name: "orders".to_string(),
                version: "1.0.0".to_string(),
                provider: "gcp".to_string(),
                region: "europe-west1".to_string(),
                app_port: 8080,
                source_url: "https://github.com/acme/orders".to_string(),
            })
            .await
            .unwrap()
    }

    fn job(deployment_id: Uuid, attempt: u32) -> Job {
        Job {
            deployment_id,
            kind: JobKind::Deploy,
            enqueued_at: 0,
            attempt,
        }
    }

    #[tokio::test]
    async fn happy_path_reaches_exposed() {
        let persistence = Persistence::new_in_memory().await;
        let d = deployment(&persistence).await;
        let (set, _, _) = adapters(
            ScriptedBuilder::ok(),
            ScriptedProvisioner::ok(),
            ScriptedDeployer::ok(),
        );
        let engine = Engine::new(persistence.clone(), set, PhaseTimeouts::default());

        let outcome = engine
            .execute(&job(d.id, 1), CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Complete);

        let finished = persistence.get_deployment(&d.id).await.unwrap();
        assert_eq!(finished.status, Status::Exposed);
        assert_eq!(finished.external_ip.as_deref(), Some("34.10.0.5"));
        assert!(finished.deployed_at.is_some());

        let builds = persistence.get_builds(&d.id).await.unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].status, BuildStatus::Success);

        let infra = persistence.current_infrastructure(&d.id).await.unwrap().unwrap();
        assert_eq!(infra.status, InfrastructureStatus::Ready);
        assert_eq!(infra.external_ip.as_deref(), Some("34.10.0.5"));
    }

    #[tokio::test]
    async fn permanent_provision_failure_compensates() {
        let persistence = Persistence::new_in_memory().await;
        let d = deployment(&persistence).await;
        let (set, provisioner, _) = adapters(
            ScriptedBuilder::ok(),
            ScriptedProvisioner::failing_with(vec![AdapterError::permanent("quota exceeded")]),
            ScriptedDeployer::ok(),
        );
        let engine = Engine::new(persistence.clone(), set, PhaseTimeouts::default());

        let outcome = engine
            .execute(&job(d.id, 1), CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Complete);

        let failed = persistence.get_deployment(&d.id).await.unwrap();
        assert_eq!(failed.status, Status::Failed);
        assert!(failed.error.unwrap().contains("quota exceeded"));

        // Destroy ran against the stack that was being provisioned
        let infra = persistence.current_infrastructure(&d.id).await.unwrap().unwrap();
        assert_eq!(infra.status, InfrastructureStatus::Destroying);
        assert_eq!(*provisioner.destroyed.lock().await, vec![infra.stack_name]);
    }

    #[tokio::test]
    async fn transient_failure_requeues_in_current_phase() {
        let persistence = Persistence::new_in_memory().await;
        let d = deployment(&persistence).await;
        // Enough transient failures to exhaust the in-place retries
        let failures = (0..MAX_PHASE_TRIES)
            .map(|_| AdapterError::transient("registry unavailable"))
            .collect();
        let (set, _, _) = adapters(
            ScriptedBuilder::failing_with(failures),
            ScriptedProvisioner::ok(),
            ScriptedDeployer::ok(),
        );
        let engine = Engine::new(persistence.clone(), set.clone(), PhaseTimeouts::default());

        let outcome = engine
            .execute(&job(d.id, 1), CancellationToken::new())
            .await;

        assert!(matches!(outcome, Outcome::Retry { .. }));
        let stalled = persistence.get_deployment(&d.id).await.unwrap();
        assert_eq!(stalled.status, Status::Building);

        // The failed attempt is on the books, and a redelivery finishes the job
        let builds = persistence.get_builds(&d.id).await.unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].status, BuildStatus::Failed);

        let outcome = engine
            .execute(&job(d.id, 2), CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::Complete);
        assert_eq!(
            persistence.get_deployment(&d.id).await.unwrap().status,
            Status::Exposed
        );

        let builds = persistence.get_builds(&d.id).await.unwrap();
        assert_eq!(builds.len(), 2);
        assert_eq!(
            builds.iter().filter(|b| b.status == BuildStatus::Success).count(),
            1
        );
    }

    #[tokio::test]
    async fn failed_compensation_preserves_both_errors() {
        let persistence = Persistence::new_in_memory().await;
        let d = deployment(&persistence).await;
        let provisioner = ScriptedProvisioner {
            failures: Mutex::new(vec![AdapterError::permanent("quota exceeded")]),
            destroy_failures: Mutex::new(vec![AdapterError::permanent("stack is locked")]),
            destroyed: Mutex::new(Vec::new()),
        };
        let (set, _, _) = adapters(ScriptedBuilder::ok(), provisioner, ScriptedDeployer::ok());
        let engine = Engine::new(persistence.clone(), set, PhaseTimeouts::default());

        let outcome = engine
            .execute(&job(d.id, 1), CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Complete);

        // The compensation failure does not re-loop; both causes stay visible
        let failed = persistence.get_deployment(&d.id).await.unwrap();
        assert_eq!(failed.status, Status::Failed);
        let error = failed.error.unwrap();
        assert!(error.contains("quota exceeded"));
        assert!(error.contains("stack is locked"));

        let infra = persistence.current_infrastructure(&d.id).await.unwrap().unwrap();
        assert_eq!(infra.status, InfrastructureStatus::Failed);
    }

    #[tokio::test]
    async fn second_timeout_in_a_phase_is_permanent() {
        let persistence = Persistence::new_in_memory().await;
        let d = deployment(&persistence).await;
        let (set, provisioner, deployer) = adapters(
            ScriptedBuilder::ok(),
            ScriptedProvisioner::ok(),
            ScriptedDeployer::failing_with(vec![
                AdapterError::Timeout(Duration::from_secs(1)),
                AdapterError::Timeout(Duration::from_secs(1)),
            ]),
        );
        let engine = Engine::new(persistence.clone(), set, PhaseTimeouts::default());

        let outcome = engine
            .execute(&job(d.id, 1), CancellationToken::new())
            .await;
        assert!(matches!(outcome, Outcome::Retry { .. }));
        assert_eq!(
            persistence.get_deployment(&d.id).await.unwrap().status,
            Status::Deploying
        );

        let outcome = engine
            .execute(&job(d.id, 2), CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::Complete);

        let failed = persistence.get_deployment(&d.id).await.unwrap();
        assert_eq!(failed.status, Status::Failed);
        assert_eq!(deployer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(provisioner.destroyed.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_leaves_status_untouched() {
        let persistence = Persistence::new_in_memory().await;
        let d = deployment(&persistence).await;
        let (set, _, _) = adapters(
            ScriptedBuilder::ok(),
            ScriptedProvisioner::ok(),
            ScriptedDeployer::ok(),
        );
        let engine = Engine::new(persistence.clone(), set, PhaseTimeouts::default());

        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let outcome = engine.execute(&job(d.id, 1), cancellation).await;

        assert_eq!(outcome, Outcome::Interrupted);
        // The reservation-time transition happened, nothing beyond it
        assert_eq!(
            persistence.get_deployment(&d.id).await.unwrap().status,
            Status::Analyzing
        );
    }

    #[tokio::test]
    async fn conflicting_actor_abandons_the_job() {
        let persistence = Persistence::new_in_memory().await;
        let d = deployment(&persistence).await;
        let (set, _, _) = adapters(
            ScriptedBuilder::ok(),
            ScriptedProvisioner::ok(),
            ScriptedDeployer::ok(),
        );
        let engine = Engine::new(persistence.clone(), set, PhaseTimeouts::default());

        // Another actor already moved the deployment along
        persistence
            .update_status(&d.id, Status::Queued, Status::Analyzing)
            .await
            .unwrap();
        let stale = Deployment {
            status: Status::Queued,
            ..d
        };
        let tracker = Tracker::new(persistence.clone(), stale.id, Uuid::new_v4());

        let outcome = engine
            .deploy(stale, 1, &tracker, &CancellationToken::new())
            .await;

        assert_eq!(outcome, Outcome::Abandon);
    }

    #[tokio::test]
    async fn destroy_job_tears_down_and_soft_deletes() {
        let persistence = Persistence::new_in_memory().await;
        let d = deployment(&persistence).await;
        let (set, provisioner, _) = adapters(
            ScriptedBuilder::ok(),
            ScriptedProvisioner::ok(),
            ScriptedDeployer::ok(),
        );
        let engine = Engine::new(persistence.clone(), set, PhaseTimeouts::default());

        // Deploy fully, then destroy
        engine
            .execute(&job(d.id, 1), CancellationToken::new())
            .await;
        let destroy = Job {
            deployment_id: d.id,
            kind: JobKind::Destroy,
            enqueued_at: 0,
            attempt: 1,
        };
        let outcome = engine.execute(&destroy, CancellationToken::new()).await;

        assert_eq!(outcome, Outcome::Complete);
        assert_eq!(provisioner.destroyed.lock().await.len(), 1);

        let deleted = persistence.get_deployment(&d.id).await.unwrap();
        assert!(deleted.deleted_at.is_some());

        // Redelivery of the same destroy is a no-op
        let outcome = engine.execute(&destroy, CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Complete);
        assert_eq!(provisioner.destroyed.lock().await.len(), 1);
    }

    #[test]
    fn requeue_delay_grows_and_caps() {
        assert_eq!(requeue_delay(1), Duration::from_secs(10));
        assert_eq!(requeue_delay(2), Duration::from_secs(20));
        assert!(requeue_delay(12) <= MAX_REQUEUE_DELAY);
    }
}
