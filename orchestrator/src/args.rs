use std::time::Duration;

use clap::Parser;

use crate::engine::PhaseTimeouts;
use crate::worker::WorkerConfig;

/// Control plane driving deployments through analyze, build, provision,
/// deploy, and expose
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// Path of the state database backing the repository and the job queue
    #[clap(long = "state-db", default_value = "skylift.sqlite")]
    pub state: String,

    /// Number of parallel engines consuming the job queue
    #[clap(long, default_value_t = 3)]
    pub workers: usize,

    /// Seconds an idle worker waits between reservation polls
    #[clap(long, default_value_t = 5)]
    pub poll_interval: u64,

    /// Build phase budget in seconds
    #[clap(long, default_value_t = 30 * 60)]
    pub build_timeout: u64,

    /// Provision phase budget in seconds
    #[clap(long, default_value_t = 30 * 60)]
    pub provision_timeout: u64,

    /// Deploy phase budget in seconds
    #[clap(long, default_value_t = 15 * 60)]
    pub deploy_timeout: u64,

    /// Seconds a reserved job stays invisible to other workers
    #[clap(long, default_value_t = 45 * 60)]
    pub visibility_timeout: u64,

    /// Seconds shutdown waits for in-flight work before abandoning it
    #[clap(long, default_value_t = 15)]
    pub shutdown_grace: u64,

    /// Which adapter implementations to construct
    #[clap(long = "adapter-set", default_value = "simulated")]
    pub adapters: String,
}

impl Args {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.workers,
            poll_interval: Duration::from_secs(self.poll_interval),
            visibility_timeout: Duration::from_secs(self.visibility_timeout),
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
        }
    }

    pub fn phase_timeouts(&self) -> PhaseTimeouts {
        PhaseTimeouts {
            build: Duration::from_secs(self.build_timeout),
            provision: Duration::from_secs(self.provision_timeout),
            deploy: Duration::from_secs(self.deploy_timeout),
            ..PhaseTimeouts::default()
        }
    }
}
