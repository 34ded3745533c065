//! Foreground service: ticks the scheduler until a shutdown signal arrives.

use anyhow::Result;
use cronpilot_engine::executor::AgentCli;
use cronpilot_engine::scheduler::Scheduler;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::commands::open_db;
use crate::config::AppConfig;
use crate::notifier::ConsoleNotifier;
use crate::output::{print_banner, print_jobs_table};

pub async fn run_service(config: &AppConfig) -> Result<()> {
    print_banner();

    let db = Arc::new(open_db(config).await?);
    print_config_summary(config);

    let runner = Arc::new(AgentCli::new(config.agent_cli_config()));
    let scheduler = Scheduler::builder(db.clone(), runner)
        .tick_interval(config.service.tick_interval)
        .notifier(Arc::new(ConsoleNotifier))
        .build();
    let mut changes = scheduler.subscribe();

    scheduler.start().await;

    match db.list_jobs().await {
        Ok(jobs) => {
            println!("\x1b[1mJobs ({}):\x1b[0m", jobs.len());
            print_jobs_table(&jobs);
        }
        Err(e) => warn!(error = %e, "Failed to list jobs"),
    }
    println!();
    println!("\x1b[32mScheduler running.\x1b[0m Press \x1b[1mCtrl+C\x1b[0m to stop.");
    println!();
    println!("\x1b[2m--- Event Log ---\x1b[0m");
    println!();

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            change = changes.recv() => match change {
                Ok(change) => debug!(event = change.name(), "Jobs changed"),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Change listener lagged");
                }
                Err(RecvError::Closed) => {
                    warn!("Change channel closed unexpectedly");
                    break;
                }
            },
        }
    }

    println!();
    println!("\x1b[33mShutdown signal received, stopping scheduler...\x1b[0m");
    info!("Shutdown signal received, stopping scheduler");

    scheduler.stop().await;

    println!("\x1b[32mScheduler stopped.\x1b[0m");
    Ok(())
}

fn print_config_summary(config: &AppConfig) {
    println!("\x1b[1mConfiguration:\x1b[0m");
    println!("  PID:        {}", std::process::id());
    println!("  Database:   {}", config.service.db_path.display());
    println!("  Log dir:    {}", config.service.log_dir.display());
    println!("  Agent:      {}", config.agent.program);
    println!(
        "  Tick:       {}",
        humantime::format_duration(config.service.tick_interval)
    );
    if let Some(debug_dir) = &config.agent.debug_dir {
        println!("  Debug dir:  {}", debug_dir.display());
    }
    println!();
}

/// Wait for SIGTERM, SIGINT, or SIGHUP signal.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let hangup = async {
        match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGHUP handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = hangup => {},
    }
}
