use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HutchConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub orchestrator: OrchestratorConfig,
    pub container: ContainerRuntimeConfig,
    pub ipc: IpcConfig,
    pub scheduler: SchedulerConfig,
    pub oauth: OauthConfig,
    /// Pre-approved commands the main group may run via `run_host_command`.
    pub host_commands: BTreeMap<String, HostCommandSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Channel adapter endpoint that receives outbound messages.
    /// When unset, outbound traffic is only logged.
    pub channel_callback_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7340".to_string(),
            channel_callback_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_db: String,
    pub groups_dir: String,
    pub data_dir: String,
    /// Optional JSON allowlist imported into the store at startup.
    pub allowlist_seed: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_db: "store/hutch.db".to_string(),
            groups_dir: "groups".to_string(),
            data_dir: "data".to_string(),
            allowlist_seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum concurrent containers across all groups.
    pub max_concurrent_containers: usize,
    /// Folder name for the main group.
    pub main_group_folder: String,
    pub assistant_name: String,
    /// Delay before each retry; its length is the retry budget.
    pub retry_backoff_ms: Vec<u64>,
    /// Upper bound on a single processing attempt; expiry counts as failure.
    /// Must exceed `container.timeout_ms + container.stop_grace_ms`.
    pub max_invocation_ms: u64,
    /// Chat messages buffered per group; the oldest context is dropped first.
    pub max_buffered_messages: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_containers: 3,
            main_group_folder: "main".to_string(),
            assistant_name: "Andy".to_string(),
            retry_backoff_ms: vec![5_000, 10_000, 20_000, 40_000, 80_000],
            max_invocation_ms: 1_920_000,
            max_buffered_messages: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRuntimeConfig {
    pub runtime_bin: String,
    pub image: String,
    pub timezone: String,
    /// Hard per-run timeout; groups may override via their container config.
    pub timeout_ms: u64,
    /// Wait after `<runtime> stop` before the client is killed.
    pub stop_grace_ms: u64,
    /// Keys read from `.env` and passed to the container on stdin.
    pub secret_keys: Vec<String>,
}

impl Default for ContainerRuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_bin: "docker".to_string(),
            image: "hutch-agent:latest".to_string(),
            timezone: "UTC".to_string(),
            timeout_ms: 1_800_000,
            stop_grace_ms: 10_000,
            secret_keys: vec![
                "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
                "ANTHROPIC_API_KEY".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub poll_interval_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// IANA timezone for cron expressions.
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 60_000,
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OauthConfig {
    /// Program and arguments that refresh agent credentials out of band.
    pub refresh_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct HostCommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub description: Option<String>,
    pub timeout_ms: Option<u64>,
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<HutchConfig> {
    let path = path.as_ref();
    let parsed = if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str::<HutchConfig>(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?
    } else {
        HutchConfig::default()
    };

    let config = parsed.with_env_overrides();
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(config)
}

impl HutchConfig {
    /// The queue's attempt bound has to outlast the runner's own timeout and
    /// stop grace, otherwise the queue abandons runs the runner would still
    /// stop cleanly.
    pub fn validate(&self) -> anyhow::Result<()> {
        let runner_bound = self
            .container
            .timeout_ms
            .saturating_add(self.container.stop_grace_ms);
        if self.orchestrator.max_invocation_ms <= runner_bound {
            anyhow::bail!(
                "orchestrator.max_invocation_ms ({}) must exceed container.timeout_ms + container.stop_grace_ms ({})",
                self.orchestrator.max_invocation_ms,
                runner_bound
            );
        }
        Ok(())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(bind) = non_empty_env("HUTCHD_BIND") {
            self.server.bind = bind;
        }

        if let Some(url) = non_empty_env("HUTCH_CHANNEL_CALLBACK_URL") {
            self.server.channel_callback_url = Some(url);
        }

        if let Some(path) = non_empty_env("HUTCH_STATE_DB") {
            self.storage.state_db = path;
        }

        if let Some(max) = non_empty_env("HUTCH_MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
            self.orchestrator.max_concurrent_containers = max;
        }

        self
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
