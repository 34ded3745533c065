use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;
mod logging;
mod notifier;
mod output;

use commands::jobs::JobsCommands;
use commands::mcp::McpCommands;
use config::{AppConfig, CliFlags};

#[derive(Parser, Debug, PartialEq)]
#[command(name = "cronpilot", version, about = "Run an agent CLI on a schedule")]
struct Cli {
    /// Config file (default: ~/.cronpilot/config.toml)
    #[arg(long, global = true, env = "CRONPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Agent program to run
    #[arg(long, global = true)]
    agent_bin: Option<String>,

    /// Directory receiving the raw agent output of every run
    #[arg(long, global = true)]
    debug_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Run the scheduler in the foreground until interrupted
    Run,
    /// Manage jobs and their runs
    #[command(subcommand)]
    Jobs(JobsCommands),
    /// Manage MCP servers
    #[command(subcommand)]
    Mcp(McpCommands),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("\x1b[31mError:\x1b[0m {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .as_deref()
        .map(config::expand_tilde_path)
        .unwrap_or_else(AppConfig::default_path);
    let flags = CliFlags {
        db_path: cli.db_path,
        agent_bin: cli.agent_bin,
        debug_dir: cli.debug_dir,
    };
    let config = AppConfig::load(&config_path, &flags)?;
    let _log_guard = logging::init(&config.service.log_dir)?;

    match cli.command {
        Commands::Run => commands::run::run_service(&config).await,
        Commands::Jobs(command) => command.run(&config).await,
        Commands::Mcp(command) => command.run(&config).await,
    }
}
