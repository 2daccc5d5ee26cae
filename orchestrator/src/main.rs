use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use skylift_orchestrator::adapters::AdapterSet;
use skylift_orchestrator::args::Args;
use skylift_orchestrator::engine::Engine;
use skylift_orchestrator::error::Error;
use skylift_orchestrator::persistence::Persistence;
use skylift_orchestrator::queue::JobQueue;
use skylift_orchestrator::recover_interrupted;
use skylift_orchestrator::worker::WorkerPool;

const EXIT_INIT_FAILURE: i32 = 1;
const EXIT_RUNTIME_PANIC: i32 = 2;

enum RunError {
    Init(anyhow::Error),
    Panic,
}

fn init(error: impl Into<anyhow::Error>) -> RunError {
    RunError::Init(error.into())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let fmt_layer = fmt::layer();
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    let code = match run(args).await {
        Ok(()) => {
            info!("graceful shutdown");
            0
        }
        Err(RunError::Init(error)) => {
            error!(%error, "fatal init failure");
            EXIT_INIT_FAILURE
        }
        Err(RunError::Panic) => {
            error!("runtime panic in the worker pool");
            EXIT_RUNTIME_PANIC
        }
    };

    std::process::exit(code);
}

async fn run(args: Args) -> Result<(), RunError> {
    let persistence = Persistence::new(&args.state).await.map_err(init)?;
    let queue = JobQueue::new(persistence.pool().clone())
        .await
        .map_err(init)?;
    queue.ping().await.map_err(init)?;

    let adapters = AdapterSet::from_name(&args.adapters).map_err(init)?;

    let recovered = recover_interrupted(&persistence, &queue)
        .await
        .map_err(init)?;
    if recovered > 0 {
        info!(recovered, "re-enqueued interrupted deployments");
    }

    let engine = Engine::new(persistence, adapters, args.phase_timeouts());
    let pool = WorkerPool::new(queue, engine, args.worker_config());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    match pool.run(shutdown).await {
        Ok(()) => Ok(()),
        Err(Error::WorkerPanic) => Err(RunError::Panic),
        Err(error) => Err(init(error)),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("to install the SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
