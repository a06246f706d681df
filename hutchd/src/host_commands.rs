//! Pre-approved host command table.
//!
//! Agents may ask the host to run a command by name only. The table comes
//! from `[host_commands]` in the config; nothing outside it is executed and
//! no argument from the request reaches the command line.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use hutch_core::HostCommandSpec;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_OUTPUT: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommandListing {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HostCommandTable {
    commands: BTreeMap<String, HostCommandSpec>,
}

impl HostCommandTable {
    pub fn new(commands: BTreeMap<String, HostCommandSpec>) -> Self {
        Self { commands }
    }

    pub fn get(&self, name: &str) -> Option<&HostCommandSpec> {
        self.commands.get(name)
    }

    pub fn listing(&self) -> Vec<CommandListing> {
        self.commands
            .iter()
            .map(|(name, spec)| CommandListing {
                name: name.clone(),
                description: spec.description.clone(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn to_json(&self) -> Value {
        json!(self)
    }
}

fn truncate(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_OUTPUT {
        return text.into_owned();
    }
    let mut end = MAX_OUTPUT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated]", &text[..end])
}

/// Run `program args..` with a hard timeout. Spawn failures are reported as
/// an outcome with no exit code and the error in `stderr`.
pub async fn run_program(program: &str, args: &[String], timeout: Duration) -> CommandOutcome {
    let start = Instant::now();
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            warn!(program, error = %e, "failed to spawn host command");
            return CommandOutcome {
                exit_code: None,
                stdout: String::new(),
                stderr: format!("failed to spawn {program}: {e}"),
                timed_out: false,
                duration_ms: start.elapsed().as_millis() as u64,
            };
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => CommandOutcome {
            exit_code: output.status.code(),
            stdout: truncate(&output.stdout),
            stderr: truncate(&output.stderr),
            timed_out: false,
            duration_ms: start.elapsed().as_millis() as u64,
        },
        Ok(Err(e)) => CommandOutcome {
            exit_code: None,
            stdout: String::new(),
            stderr: format!("failed to wait for {program}: {e}"),
            timed_out: false,
            duration_ms: start.elapsed().as_millis() as u64,
        },
        Err(_) => {
            warn!(program, timeout_ms = timeout.as_millis() as u64, "host command timed out");
            CommandOutcome {
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
                duration_ms: start.elapsed().as_millis() as u64,
            }
        }
    }
}

/// Run a table entry. `None` when the name is not in the table.
pub async fn run_named(table: &HostCommandTable, name: &str) -> Option<CommandOutcome> {
    let spec = table.get(name)?;
    let timeout = spec
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TIMEOUT);
    let outcome = run_program(&spec.program, &spec.args, timeout).await;
    info!(
        name,
        exit_code = ?outcome.exit_code,
        timed_out = outcome.timed_out,
        duration_ms = outcome.duration_ms,
        "host command finished"
    );
    Some(outcome)
}

/// Run the configured credential refresh command, if any.
pub async fn refresh_oauth(refresh_command: &[String]) {
    let Some((program, args)) = refresh_command.split_first() else {
        info!("oauth refresh requested but no refresh command configured");
        return;
    };
    let outcome = run_program(program, args, DEFAULT_TIMEOUT).await;
    if outcome.succeeded() {
        info!(duration_ms = outcome.duration_ms, "oauth credentials refreshed");
    } else {
        warn!(
            exit_code = ?outcome.exit_code,
            timed_out = outcome.timed_out,
            stderr = %outcome.stderr,
            "oauth refresh command failed"
        );
    }
}
