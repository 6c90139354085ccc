use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use task_agent::{
    api::api_router,
    config::Config,
    engine::{EngineSettings, TaskEngine},
    logging::init_logging,
    notify::StatusNotifier,
    runner::{run_job, JobSpec},
    status::Task,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg)?;

    let (command, args) = cfg.job_command()?;
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, cfg.port)))
        .await
        .with_context(|| format!("failed to bind control port {}", cfg.port))?;
    let port = listener.local_addr()?.port();

    let task = Task::new(cfg.task_id(), cfg.user_id, cfg.display_name(), port);
    let notifier = StatusNotifier::new(cfg.server_port, cfg.notify_timeout());
    let settings = EngineSettings::new(task, cfg.log_dir(), notifier);
    let (engine, interpreter, mut ingestion) =
        TaskEngine::start(settings).context("failed to start task")?;

    tracing::info!(
        target = "task_agent::main",
        task_id = engine.task_id(),
        port,
        command = %command,
        "task agent listening"
    );

    let router = api_router(engine.clone(), cfg.viewer_options());
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router).await {
            tracing::error!(target = "task_agent::main", error = %error, "control server stopped");
        }
    });

    let job = JobSpec {
        command,
        args,
        rows: cfg.rows,
        cols: cfg.cols,
    };
    let drain_grace = cfg.drain_grace();
    let job_engine = engine.clone();
    tokio::spawn(async move {
        let exit = run_job(job, interpreter).await;
        if tokio::time::timeout(drain_grace, &mut ingestion).await.is_err() {
            tracing::warn!(
                target = "task_agent::main",
                "job output still open after exit, archiving what was captured"
            );
        }
        if let Some((status, message)) = exit.final_status() {
            job_engine.finish(status, &message).await;
        }
    });

    let exit_code = tokio::select! {
        code = engine.wait_exit() => code,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target = "task_agent::main", "interrupted, terminating task");
            engine.terminate().await;
            engine.wait_exit().await
        }
    };

    std::process::exit(exit_code);
}
