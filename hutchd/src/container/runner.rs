//! Async container runner: one agent turn in one sandboxed process.
//!
//! The runner spawns `<runtime> run ...`, writes the invocation payload to
//! stdin once, streams stdout through the sentinel scanner and resolves to a
//! `ContainerOutput`. Every failure mode maps to `status: error`; nothing is
//! returned as `Err`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hutch_core::model::{RegisteredGroup, ScheduledTask};
use hutch_core::{ContainerInput, ContainerOutput, HutchConfig, OutputScanner, ScannedLine, VolumeMount};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::mounts::{MountRoots, build_volume_mounts, container_name};
use super::secrets::{build_container_args, read_secrets};
use super::security::MountAllowlist;

/// Cap on stdout/stderr kept for the run log.
const MAX_LOG_CAPTURE: usize = 1_048_576;

/// Diagnostic stdout lines, forwarded as they arrive.
pub type ProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub runtime_bin: String,
    pub image: String,
    pub timezone: String,
    pub timeout: Duration,
    /// How long to wait after `<runtime> stop` before killing the client.
    pub stop_grace: Duration,
    pub secret_keys: Vec<String>,
    pub project_root: PathBuf,
    pub groups_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl RunnerSettings {
    pub fn from_config(config: &HutchConfig, project_root: PathBuf) -> Self {
        Self {
            runtime_bin: config.container.runtime_bin.clone(),
            image: config.container.image.clone(),
            timezone: config.container.timezone.clone(),
            timeout: Duration::from_millis(config.container.timeout_ms),
            stop_grace: Duration::from_millis(config.container.stop_grace_ms),
            secret_keys: config.container.secret_keys.clone(),
            groups_dir: project_root.join(&config.storage.groups_dir),
            data_dir: project_root.join(&config.storage.data_dir),
            project_root,
        }
    }
}

/// Outcome of one container run.
#[derive(Debug)]
pub struct RunResult {
    pub output: ContainerOutput,
    pub container_name: String,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct Capture {
    text: String,
    truncated: bool,
}

impl Capture {
    fn push(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.text.len() + line.len() + 1 > MAX_LOG_CAPTURE {
            self.truncated = true;
            return;
        }
        self.text.push_str(line);
        self.text.push('\n');
    }
}

#[derive(Clone)]
pub struct ContainerRunner {
    settings: Arc<RunnerSettings>,
}

impl ContainerRunner {
    pub fn new(settings: RunnerSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Run one agent turn for `group`.
    pub async fn run(
        &self,
        group: &RegisteredGroup,
        input: &ContainerInput,
        allowlist: &MountAllowlist,
        on_progress: Option<ProgressCallback>,
    ) -> RunResult {
        let settings = &*self.settings;
        let start = Instant::now();
        let is_main = input.is_main;

        let roots = MountRoots {
            project_root: &settings.project_root,
            groups_dir: &settings.groups_dir,
            data_dir: &settings.data_dir,
        };
        let mounts = build_volume_mounts(group, is_main, &roots, allowlist);
        let name = container_name(&group.folder);
        let args = build_container_args(&mounts, &name, &settings.image, &settings.timezone);
        let timeout = group
            .container_config
            .as_ref()
            .and_then(|c| c.timeout)
            .map(Duration::from_millis)
            .unwrap_or(settings.timeout);

        info!(
            group = %group.folder,
            container_name = %name,
            mount_count = mounts.len(),
            is_main,
            "spawning container agent"
        );

        let finish = |output: ContainerOutput| RunResult {
            output,
            container_name: name.clone(),
            duration: start.elapsed(),
        };

        let mut child = match Command::new(&settings.runtime_bin)
            .args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(group = %group.folder, error = %e, "failed to spawn container runtime");
                return finish(ContainerOutput::error(format!(
                    "failed to spawn container runtime: {e}"
                )));
            }
        };

        let mut stop_guard = StopOnDrop {
            runtime_bin: settings.runtime_bin.clone(),
            container_name: name.clone(),
            armed: true,
        };

        if let Err(message) = write_input(&mut child, input, settings).await {
            warn!(group = %group.folder, container_name = %name, %message, "stdin delivery failed");
        }

        let mut scanner = OutputScanner::new();
        let mut stdout_log = Capture::default();
        let mut stderr_log = Capture::default();

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            child.start_kill().ok();
            return finish(ContainerOutput::error("container stdio was not captured"));
        };
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let stream = async {
            let mut stdout_open = true;
            let mut stderr_open = true;
            while stdout_open || stderr_open {
                tokio::select! {
                    line = stdout_lines.next_line(), if stdout_open => match line {
                        Ok(Some(line)) => {
                            stdout_log.push(&line);
                            if let ScannedLine::Diagnostic(text) = scanner.push_line(&line) {
                                if !text.trim().is_empty() {
                                    debug!(container = %group.folder, "{}", text);
                                    if let Some(cb) = &on_progress {
                                        cb(text.to_string());
                                    }
                                }
                            }
                        }
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            warn!(group = %group.folder, error = %e, "error reading container stdout");
                            stdout_open = false;
                        }
                    },
                    line = stderr_lines.next_line(), if stderr_open => match line {
                        Ok(Some(line)) => {
                            if !line.trim().is_empty() {
                                debug!(container = %group.folder, "{}", line);
                            }
                            stderr_log.push(&line);
                        }
                        Ok(None) | Err(_) => stderr_open = false,
                    },
                }
            }
        };

        let timed_out = tokio::time::timeout(timeout, stream).await.is_err();
        if timed_out {
            error!(
                group = %group.folder,
                container_name = %name,
                timeout_ms = timeout.as_millis() as u64,
                "container timed out, stopping"
            );
            stop_container(&settings.runtime_bin, &name).await;
        }

        let exit_code = wait_for_exit(&mut child, timed_out, settings.stop_grace).await;
        stop_guard.armed = false;
        let duration = start.elapsed();

        write_container_log(
            &settings.groups_dir.join(&group.folder).join("logs"),
            &group.folder,
            &name,
            duration,
            exit_code,
            timed_out,
            &mounts,
            &stdout_log,
            &stderr_log,
        )
        .await;

        if timed_out {
            return finish(ContainerOutput::error(format!(
                "container timed out after {}ms",
                timeout.as_millis()
            )));
        }

        let output = match scanner.finish() {
            Some(block) => match serde_json::from_str::<ContainerOutput>(&block) {
                Ok(output) => output,
                Err(e) => {
                    error!(group = %group.folder, error = %e, "failed to parse container output");
                    ContainerOutput::error(format!("failed to parse container output: {e}"))
                }
            },
            None if exit_code != Some(0) => {
                let tail = tail_chars(&stderr_log.text, 200);
                error!(group = %group.folder, exit_code = ?exit_code, "container exited with error");
                ContainerOutput::error(format!(
                    "container exited with code {}: {}",
                    exit_code.unwrap_or(-1),
                    tail
                ))
            }
            None => ContainerOutput::error("container produced no output block"),
        };

        info!(
            group = %group.folder,
            container_name = %name,
            duration_ms = duration.as_millis() as u64,
            exit_code = ?exit_code,
            success = output.is_success(),
            "container finished"
        );
        finish(output)
    }
}

/// Stops the named container if a run is dropped before its client exits.
/// `kill_on_drop` only ends the runtime client, not the container behind it.
struct StopOnDrop {
    runtime_bin: String,
    container_name: String,
    armed: bool,
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_name = %self.container_name, "run abandoned outside a runtime, container not stopped");
            return;
        };
        warn!(container_name = %self.container_name, "run abandoned, stopping container");
        let runtime_bin = std::mem::take(&mut self.runtime_bin);
        let container_name = std::mem::take(&mut self.container_name);
        handle.spawn(async move {
            stop_container(&runtime_bin, &container_name).await;
        });
    }
}

/// Deliver the invocation payload with secrets attached, then close stdin.
async fn write_input(
    child: &mut Child,
    input: &ContainerInput,
    settings: &RunnerSettings,
) -> Result<(), String> {
    let mut payload = input.clone();
    payload.secrets = Some(read_secrets(&settings.project_root, &settings.secret_keys));
    let json = serde_json::to_vec(&payload).map_err(|e| e.to_string())?;
    drop(payload);

    let Some(mut stdin) = child.stdin.take() else {
        return Err("stdin was not captured".to_string());
    };
    stdin.write_all(&json).await.map_err(|e| e.to_string())?;
    stdin.shutdown().await.map_err(|e| e.to_string())?;
    Ok(())
}

async fn wait_for_exit(child: &mut Child, stopping: bool, grace: Duration) -> Option<i32> {
    if stopping {
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            return status.code();
        }
        warn!("container client did not exit after stop, killing");
        child.kill().await.ok();
    }
    match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(error = %e, "failed to wait for container process");
            None
        }
    }
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = text
        .char_indices()
        .nth(count - max)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &text[skip..]
}

#[allow(clippy::too_many_arguments)]
async fn write_container_log(
    logs_dir: &Path,
    group_folder: &str,
    container_name: &str,
    duration: Duration,
    exit_code: Option<i32>,
    timed_out: bool,
    mounts: &[VolumeMount],
    stdout: &Capture,
    stderr: &Capture,
) {
    if let Err(e) = tokio::fs::create_dir_all(logs_dir).await {
        warn!(logs_dir = %logs_dir.display(), error = %e, "failed to create logs dir");
        return;
    }
    let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
    let log_file = logs_dir.join(format!("container-{timestamp}.log"));
    let failed = timed_out || exit_code != Some(0);

    let mut lines = vec![
        format!(
            "=== Container Run Log{} ===",
            if timed_out { " (TIMEOUT)" } else { "" }
        ),
        format!("Timestamp: {timestamp}"),
        format!("Group: {group_folder}"),
        format!("Container: {container_name}"),
        format!("Duration: {}ms", duration.as_millis()),
        format!("Exit Code: {exit_code:?}"),
        String::new(),
        "=== Mounts ===".to_string(),
    ];
    for m in mounts {
        let ro = if m.readonly { " (ro)" } else { "" };
        if failed {
            lines.push(format!("{} -> {}{ro}", m.host_path, m.container_path));
        } else {
            lines.push(format!("{}{ro}", m.container_path));
        }
    }

    if failed {
        for (label, capture) in [("Stderr", stderr), ("Stdout", stdout)] {
            lines.push(String::new());
            lines.push(format!(
                "=== {label}{} ===",
                if capture.truncated { " (TRUNCATED)" } else { "" }
            ));
            lines.push(capture.text.clone());
        }
    }

    match tokio::fs::write(&log_file, lines.join("\n")).await {
        Ok(()) => debug!(log_file = %log_file.display(), "container log written"),
        Err(e) => warn!(log_file = %log_file.display(), error = %e, "failed to write container log"),
    }
}

/// Groups listing visible to `group_folder`: main sees every group, others
/// see only themselves.
pub async fn write_groups_snapshot(
    data_dir: &Path,
    group_folder: &str,
    is_main: bool,
    groups: &[RegisteredGroup],
) {
    let visible: Vec<&RegisteredGroup> = groups
        .iter()
        .filter(|g| is_main || g.folder == group_folder)
        .collect();
    write_snapshot(
        data_dir,
        group_folder,
        "available_groups.json",
        &SnapshotFile {
            generated_at: Utc::now().to_rfc3339(),
            items: visible,
        },
    )
    .await;
}

/// Task listing visible to `group_folder`: main sees every task.
pub async fn write_tasks_snapshot(
    data_dir: &Path,
    group_folder: &str,
    is_main: bool,
    tasks: &[ScheduledTask],
) {
    let visible: Vec<&ScheduledTask> = tasks
        .iter()
        .filter(|t| is_main || t.group_folder == group_folder)
        .collect();
    write_snapshot(
        data_dir,
        group_folder,
        "current_tasks.json",
        &SnapshotFile {
            generated_at: Utc::now().to_rfc3339(),
            items: visible,
        },
    )
    .await;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotFile<T: Serialize> {
    generated_at: String,
    items: Vec<T>,
}

async fn write_snapshot<T: Serialize>(data_dir: &Path, group_folder: &str, file: &str, body: &T) {
    let dir = data_dir.join("ipc").join(group_folder).join("snapshots");
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!(dir = %dir.display(), error = %e, "failed to create snapshot dir");
        return;
    }
    let json = match serde_json::to_vec_pretty(body) {
        Ok(json) => json,
        Err(e) => {
            warn!(file, error = %e, "failed to serialize snapshot");
            return;
        }
    };
    let tmp = dir.join(format!("{file}.tmp"));
    let target = dir.join(file);
    let result = async {
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &target).await
    }
    .await;
    if let Err(e) = result {
        warn!(file = %target.display(), error = %e, "failed to write snapshot");
    }
}

/// Stop a container by name.
pub async fn stop_container(runtime_bin: &str, container_name: &str) -> bool {
    match Command::new(runtime_bin)
        .args(["stop", container_name])
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            info!(container_name, "container stopped");
            true
        }
        Ok(output) => {
            warn!(
                container_name,
                stderr = String::from_utf8_lossy(&output.stderr).as_ref(),
                "failed to stop container"
            );
            false
        }
        Err(e) => {
            warn!(container_name, error = %e, "failed to execute runtime stop");
            false
        }
    }
}

pub async fn ensure_runtime_available(runtime_bin: &str) -> anyhow::Result<()> {
    let output = Command::new(runtime_bin)
        .arg("info")
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("container runtime `{runtime_bin}` not found: {e}"))?;

    if !output.status.success() {
        anyhow::bail!("container runtime `{runtime_bin}` is not running");
    }

    debug!(runtime_bin, "container runtime available");
    Ok(())
}

/// Stop `hutch-*` containers left over from a previous host run.
pub async fn cleanup_orphans(runtime_bin: &str) {
    let output = match Command::new(runtime_bin)
        .args(["ps", "--filter", "name=hutch-", "--format", "{{.Names}}"])
        .output()
        .await
    {
        Ok(o) => o,
        Err(e) => {
            warn!(error = %e, "failed to list orphaned containers");
            return;
        }
    };

    let listing = String::from_utf8_lossy(&output.stdout);
    let names: Vec<&str> = listing
        .lines()
        .map(str::trim)
        .filter(|s| s.starts_with("hutch-"))
        .collect();

    for name in &names {
        stop_container(runtime_bin, name).await;
    }

    if !names.is_empty() {
        info!(count = names.len(), "stopped orphaned containers");
    }
}
