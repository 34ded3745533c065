use anyhow::{Result, anyhow};
use cronpilot_engine::executor::{
    AgentCliConfig, DEFAULT_MAX_LINE_BYTES, DEFAULT_SYSTEM_PROMPT, DEFAULT_TOOLS,
};
use cronpilot_engine::scheduler::DEFAULT_TICK_INTERVAL;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DB_PATH: &str = "CRONPILOT_DB_PATH";
pub const ENV_AGENT_BIN: &str = "CRONPILOT_AGENT_BIN";
pub const ENV_DEBUG_DIR: &str = "CRONPILOT_DEBUG_DIR";

/// Overrides taken from the command line; they win over file and env.
#[derive(Debug, Clone, Default)]
pub struct CliFlags {
    pub db_path: Option<PathBuf>,
    pub agent_bin: Option<String>,
    pub debug_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: home_path("cronpilot.db"),
            log_dir: home_path("logs"),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub program: String,
    pub extra_args: Vec<String>,
    pub default_tools: Vec<String>,
    pub system_prompt: String,
    pub debug_dir: Option<PathBuf>,
    pub max_line_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let defaults = AgentCliConfig::default();
        Self {
            program: defaults.program,
            extra_args: Vec::new(),
            default_tools: DEFAULT_TOOLS.iter().map(|tool| tool.to_string()).collect(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            debug_dir: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        home_path("config.toml")
    }

    /// Read `config_path` (defaults when absent) and layer env and CLI
    /// overrides on top.
    pub fn load(config_path: &Path, cli: &CliFlags) -> Result<Self> {
        let mut config = if config_path.exists() {
            let text = std::fs::read_to_string(config_path).map_err(|error| {
                anyhow!("failed to read config {}: {error}", config_path.display())
            })?;
            toml::from_str(&text).map_err(|error| {
                anyhow!("failed to parse config {}: {error}", config_path.display())
            })?
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.apply_cli_overrides(cli);
        config.normalize_paths();
        Ok(config)
    }

    pub fn agent_cli_config(&self) -> AgentCliConfig {
        AgentCliConfig {
            program: self.agent.program.clone(),
            extra_args: self.agent.extra_args.clone(),
            default_tools: self.agent.default_tools.clone(),
            system_prompt: self.agent.system_prompt.clone(),
            debug_dir: self.agent.debug_dir.clone(),
            max_line_bytes: self.agent.max_line_bytes,
        }
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(ENV_DB_PATH).filter(|v| !v.trim().is_empty()) {
            self.service.db_path = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_AGENT_BIN).filter(|v| !v.trim().is_empty()) {
            self.agent.program = value;
        }
        if let Some(value) = lookup(ENV_DEBUG_DIR).filter(|v| !v.trim().is_empty()) {
            self.agent.debug_dir = Some(PathBuf::from(value));
        }
    }

    fn apply_cli_overrides(&mut self, cli: &CliFlags) {
        if let Some(db_path) = &cli.db_path {
            self.service.db_path = db_path.clone();
        }
        if let Some(agent_bin) = &cli.agent_bin {
            self.agent.program = agent_bin.clone();
        }
        if let Some(debug_dir) = &cli.debug_dir {
            self.agent.debug_dir = Some(debug_dir.clone());
        }
    }

    fn normalize_paths(&mut self) {
        self.service.db_path = expand_tilde_path(&self.service.db_path);
        self.service.log_dir = expand_tilde_path(&self.service.log_dir);
        self.agent.debug_dir = self.agent.debug_dir.as_deref().map(expand_tilde_path);
    }
}

fn home_path(name: &str) -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        return home.join(".cronpilot").join(name);
    }
    PathBuf::from(".cronpilot").join(name)
}

pub fn expand_tilde_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }

    if path_str == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }

    path.to_path_buf()
}
