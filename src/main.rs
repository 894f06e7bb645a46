use std::panic;
use std::sync::Arc;

use clap::Parser;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use stress_runner::{
    config::Config,
    core::{
        domain::RunEvent, pipeline::scheduler::Scheduler, snapshot::build_snapshot,
        traits::sink::persist,
    },
    native::executor::NativeExecutor,
    sinks::json::JsonFileSink,
};

#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let config = Config::parse();
    let limits = config.limits()?;
    let commands = config.commands()?;
    let snapshot = build_snapshot(&config.workspace, config.kind)?;

    let executor = Arc::new(NativeExecutor::new());
    let mut scheduler = Scheduler::new(executor, commands).with_matcher(config.matcher());
    if let Some(root) = &config.scratch_root {
        scheduler = scheduler.with_scratch_root(root.clone());
    }
    let scheduler = Arc::new(scheduler);

    let mut handle = scheduler.start(config.tests, config.kind, limits)?;

    let stopper = scheduler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping run");
            stopper.stop().await;
        }
    });

    while let Some(event) = handle.events.next().await {
        match event {
            RunEvent::CaseStarted { case_number, total } => {
                tracing::debug!("Case {}/{} started", case_number, total);
            }
            RunEvent::CaseCompleted(result) if result.passed => {
                tracing::info!(
                    "Case {} passed in {:.3}s, {:.1} MB",
                    result.case_number,
                    result.elapsed_seconds,
                    result.peak_memory_mb
                );
            }
            RunEvent::CaseCompleted(result) => {
                tracing::warn!("Case {} failed: {:?}", result.case_number, result.status);
            }
        }
    }

    let outcome = handle.outcome().await?;
    println!("{}", outcome.health());

    if let Some(path) = &config.output {
        let record = persist(&JsonFileSink::new(path), outcome.clone(), snapshot)?;
        tracing::info!("Run {} saved", record.id);
    }

    if !outcome.all_passed {
        std::process::exit(1);
    }
    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
