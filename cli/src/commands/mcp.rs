use anyhow::{Result, anyhow};
use clap::Subcommand;
use cronpilot_engine::models::{McpServer, McpServerKind};
use std::collections::BTreeMap;

use crate::commands::{open_db, resolve_job, resolve_mcp_server};
use crate::config::AppConfig;
use crate::output::print_mcp_servers_table;

#[derive(Subcommand, Debug, PartialEq)]
pub enum McpCommands {
    /// List MCP servers
    List,
    /// Register an MCP server
    Add {
        /// Unique name; tools are exposed as mcp__<name>__*
        name: String,
        /// Transport: http or stdio (default: stdio when --command is given)
        #[arg(long = "type")]
        kind: Option<String>,
        /// Endpoint for http servers
        #[arg(long)]
        url: Option<String>,
        /// Executable for stdio servers
        #[arg(long)]
        command: Option<String>,
        /// Argument for the stdio command; repeatable
        #[arg(long = "arg", action = clap::ArgAction::Append, allow_hyphen_values = true)]
        args: Vec<String>,
        /// KEY=VALUE environment for stdio servers; repeatable
        #[arg(long = "env", action = clap::ArgAction::Append)]
        env: Vec<String>,
        /// KEY=VALUE header for http servers; repeatable
        #[arg(long = "header", action = clap::ArgAction::Append)]
        headers: Vec<String>,
    },
    /// Delete an MCP server and detach it from every job
    Rm {
        /// Server id or name
        server: String,
    },
    /// Replace the MCP servers attached to a job
    Attach {
        /// Job id or name
        job: String,
        /// Server ids or names; none detaches everything
        servers: Vec<String>,
    },
}

impl McpCommands {
    pub async fn run(self, config: &AppConfig) -> Result<()> {
        let db = open_db(config).await?;

        match self {
            McpCommands::List => {
                print_mcp_servers_table(&db.list_mcp_servers().await?);
            }
            McpCommands::Add {
                name,
                kind,
                url,
                command,
                args,
                env,
                headers,
            } => {
                let kind = match kind {
                    Some(kind) => kind.parse::<McpServerKind>()?,
                    None if command.is_some() => McpServerKind::Stdio,
                    None => McpServerKind::Http,
                };
                let server = db
                    .create_mcp_server(McpServer {
                        name,
                        kind,
                        url: url.unwrap_or_default(),
                        command: command.unwrap_or_default(),
                        args,
                        env: parse_pairs(&env)?,
                        headers: parse_pairs(&headers)?,
                        ..Default::default()
                    })
                    .await?;
                println!("Created MCP server {} ({})", server.name, server.id);
            }
            McpCommands::Rm { server } => {
                let server = resolve_mcp_server(&db, &server).await?;
                db.delete_mcp_server(&server.id).await?;
                println!("Deleted MCP server {} ({})", server.name, server.id);
            }
            McpCommands::Attach { job, servers } => {
                let job = resolve_job(&db, &job).await?;
                let mut ids = Vec::with_capacity(servers.len());
                for key in &servers {
                    ids.push(resolve_mcp_server(&db, key).await?.id);
                }
                db.set_job_mcp_servers(&job.id, &ids).await?;

                let attached = db.get_mcp_servers_for_job(&job.id).await?;
                if attached.is_empty() {
                    println!("{} has no MCP servers attached", job.name);
                } else {
                    let names: Vec<&str> = attached.iter().map(|s| s.name.as_str()).collect();
                    println!("{} now uses: {}", job.name, names.join(", "));
                }
            }
        }
        Ok(())
    }
}

fn parse_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("expected KEY=VALUE, got {pair:?}"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow!("empty key in {pair:?}"));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}
