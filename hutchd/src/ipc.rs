//! Filesystem IPC broker.
//!
//! Polls `{data_dir}/ipc/{group}/tasks/*.json` and handles each request on
//! behalf of the group that owns the directory. Files are handled in name
//! order: parse, authorize, persist, write `responses/{same name}` (tmp then
//! rename), then remove the request. The container deletes the response
//! after reading it.
//!
//! Authorization:
//! - any group may act on its own group (tasks, canvas, snapshots)
//! - cross-group targets, allowlist changes, host commands and registering
//!   a group the requester does not already own require the main group
//!
//! Unparseable or unknown requests are moved to `ipc/errors/{group}-{file}`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use hutch_core::model::{
    ContainerConfig, ContextMode, MountAllowlistEntry, RegisteredGroup, ScheduleKind,
    ScheduledTask, TaskStatus,
};
use hutch_core::{CanvasPatch, IpcGroupContext, IpcRequest, IpcResponse};
use hutch_store::{StateStore, StoreError, now_timestamp, timestamp};
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::canvas::apply_patches;
use crate::container::runner::{write_groups_snapshot, write_tasks_snapshot};
use crate::host_commands::{self, HostCommandTable};
use crate::scheduler::first_run;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<IpcError> for IpcResponse {
    fn from(e: IpcError) -> Self {
        IpcResponse::error(e.to_string())
    }
}

type HandlerResult = Result<IpcResponse, IpcError>;

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub data_dir: PathBuf,
    pub poll_interval: Duration,
    pub main_group_folder: String,
    /// Timezone for validating cron descriptors.
    pub timezone: String,
    pub oauth_refresh_command: Vec<String>,
}

#[derive(Clone)]
pub struct IpcBroker {
    settings: BrokerSettings,
    store: StateStore,
    commands: HostCommandTable,
}

/// Folder names double as directory names on the host.
pub fn is_valid_folder(folder: &str) -> bool {
    !folder.is_empty()
        && folder.len() <= 64
        && folder
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !matches!(folder, "global" | "errors")
}

impl IpcBroker {
    pub fn new(settings: BrokerSettings, store: StateStore, commands: HostCommandTable) -> Self {
        Self {
            settings,
            store,
            commands,
        }
    }

    fn ipc_base(&self) -> PathBuf {
        self.settings.data_dir.join("ipc")
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let base = self.ipc_base();
        if let Err(e) = fs::create_dir_all(&base) {
            error!(dir = %base.display(), error = %e, "failed to create IPC directory");
        }
        info!(dir = %base.display(), "IPC broker started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {
                    self.poll_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("IPC broker shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One pass over every group's `tasks/` directory. Returns how many
    /// request files were consumed.
    pub async fn poll_once(&self) -> usize {
        let base = self.ipc_base();
        let mut folders = match fs::read_dir(&base) {
            Ok(entries) => entries
                .flatten()
                .filter(|entry| {
                    entry.file_type().is_ok_and(|ft| ft.is_dir()) && entry.file_name() != "errors"
                })
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            Err(e) => {
                debug!(error = %e, "IPC base directory not readable");
                return 0;
            }
        };
        folders.sort();

        let mut consumed = 0;
        for folder in folders {
            let ctx = IpcGroupContext::new(&folder, &self.settings.main_group_folder);
            let tasks_dir = base.join(&folder).join("tasks");
            let Some(files) = read_json_files(&tasks_dir) else {
                continue;
            };
            for file in files {
                if self.process_file(&ctx, &file).await {
                    consumed += 1;
                }
            }
        }
        consumed
    }

    async fn process_file(&self, ctx: &IpcGroupContext, path: &Path) -> bool {
        let request: IpcRequest = match read_and_parse(path) {
            Ok(request) => request,
            Err(e) => {
                warn!(group = %ctx.group_folder, path = %path.display(), error = %e, "malformed IPC request");
                move_to_errors(&self.ipc_base(), path, &ctx.group_folder);
                return true;
            }
        };

        let request_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = request.kind();
        debug!(group = %ctx.group_folder, kind, request_id, "handling IPC request");

        let expects_response = request.expects_response();
        let response = match self.handle(ctx, &request_id, request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(group = %ctx.group_folder, kind, error = %e, "IPC request rejected");
                e.into()
            }
        };

        if expects_response {
            let responses_dir = self.ipc_base().join(&ctx.group_folder).join("responses");
            if let Err(e) = write_response(&responses_dir, &request_id, &response) {
                // Leave the request in place; handlers are safe to re-run.
                error!(group = %ctx.group_folder, request_id, error = %e, "failed to write IPC response");
                return false;
            }
        }
        remove_file(path);
        true
    }

    /// Dispatch one request.
    pub async fn handle(
        &self,
        ctx: &IpcGroupContext,
        request_id: &str,
        request: IpcRequest,
    ) -> HandlerResult {
        match request {
            IpcRequest::ScheduleTask {
                task_id,
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                target_jid,
            } => {
                // Derived ids carry the requester's folder so equal file names
                // from different groups never collide.
                let id = task_id.unwrap_or_else(|| format!("{}-{request_id}", ctx.group_folder));
                self.schedule_task(
                    ctx,
                    id,
                    prompt,
                    schedule_type,
                    schedule_value,
                    context_mode,
                    target_jid,
                )
                .await
            }
            IpcRequest::PauseTask { task_id } => {
                self.transition_task(ctx, &task_id, TaskStatus::Paused).await
            }
            IpcRequest::ResumeTask { task_id } => {
                self.transition_task(ctx, &task_id, TaskStatus::Active).await
            }
            IpcRequest::CancelTask { task_id } => {
                self.transition_task(ctx, &task_id, TaskStatus::Cancelled)
                    .await
            }
            IpcRequest::RegisterGroup {
                jid,
                name,
                folder,
                trigger,
                requires_trigger,
                container_config,
            } => {
                self.register_group(
                    ctx,
                    jid,
                    name,
                    folder,
                    trigger,
                    requires_trigger,
                    container_config,
                )
                .await
            }
            IpcRequest::UpdateMountAllowlist { entries } => {
                self.update_mount_allowlist(ctx, entries)
            }
            IpcRequest::UpdateCanvas {
                target_jid,
                patches,
            } => self.update_canvas(ctx, request_id, target_jid, &patches),
            IpcRequest::RunHostCommand { name } => self.run_host_command(ctx, &name).await,
            IpcRequest::RefreshOauth {} => {
                let command = self.settings.oauth_refresh_command.clone();
                info!(group = %ctx.group_folder, "oauth refresh requested");
                tokio::spawn(async move {
                    host_commands::refresh_oauth(&command).await;
                });
                Ok(IpcResponse::ok(Value::Null))
            }
            IpcRequest::RefreshGroups {} => {
                self.refresh_snapshots(ctx).await;
                Ok(IpcResponse::ok(json!({ "refreshed": true })))
            }
        }
    }

    /// Resolve the group a request acts on. Omitted target means the
    /// requester's own group; any other group requires main.
    fn resolve_target(
        &self,
        ctx: &IpcGroupContext,
        target_jid: Option<&str>,
    ) -> Result<RegisteredGroup, IpcError> {
        let group = match target_jid {
            Some(jid) => self
                .store
                .get_group(jid)?
                .filter(|g| !g.disbanded)
                .ok_or_else(|| IpcError::NotFound(format!("group {jid}")))?,
            None => self
                .store
                .get_group_by_folder(&ctx.group_folder)?
                .ok_or_else(|| {
                    IpcError::NotFound(format!("no registered group for folder {}", ctx.group_folder))
                })?,
        };
        if group.folder != ctx.group_folder && !ctx.is_main {
            return Err(IpcError::Unauthorized(format!(
                "only the main group may act on group {}",
                group.jid
            )));
        }
        Ok(group)
    }

    #[allow(clippy::too_many_arguments)]
    async fn schedule_task(
        &self,
        ctx: &IpcGroupContext,
        id: String,
        prompt: String,
        schedule_type: ScheduleKind,
        schedule_value: String,
        context_mode: ContextMode,
        target_jid: Option<String>,
    ) -> HandlerResult {
        let target = self.resolve_target(ctx, target_jid.as_deref())?;

        if let Some(existing) = self.store.get_task(&id)? {
            let redelivered = existing.group_folder == target.folder
                && existing.prompt == prompt
                && existing.schedule_type == schedule_type
                && existing.schedule_value == schedule_value
                && existing.context_mode == context_mode;
            if !redelivered {
                return Err(IpcError::Invalid(format!(
                    "task id {id} is already used by a different task"
                )));
            }
            debug!(task_id = %id, "schedule_task redelivered, returning existing task");
            return Ok(IpcResponse::ok(json!({ "taskId": id, "existing": true })));
        }

        if prompt.trim().is_empty() {
            return Err(IpcError::Invalid("prompt must not be empty".to_string()));
        }
        let next_run = first_run(
            schedule_type,
            &schedule_value,
            &self.settings.timezone,
            Utc::now(),
        )
        .map_err(|e| IpcError::Invalid(e.to_string()))?;

        let task = ScheduledTask {
            id: id.clone(),
            group_folder: target.folder.clone(),
            chat_jid: target.jid.clone(),
            prompt,
            schedule_type,
            schedule_value,
            context_mode,
            next_run: next_run.map(timestamp),
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: now_timestamp(),
        };
        self.store.create_task(&task)?;
        info!(
            task_id = %id,
            group = %target.folder,
            schedule_type = schedule_type.as_str(),
            next_run = task.next_run.as_deref().unwrap_or("none"),
            "task scheduled"
        );
        self.refresh_snapshots(ctx).await;
        Ok(IpcResponse::ok(json!({
            "taskId": id,
            "nextRun": task.next_run,
        })))
    }

    async fn transition_task(
        &self,
        ctx: &IpcGroupContext,
        task_id: &str,
        target: TaskStatus,
    ) -> HandlerResult {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| IpcError::NotFound(format!("task {task_id}")))?;
        if task.group_folder != ctx.group_folder && !ctx.is_main {
            return Err(IpcError::Unauthorized(format!(
                "task {task_id} belongs to another group"
            )));
        }

        let changed = match (task.status, target) {
            (current, wanted) if current == wanted => false,
            (TaskStatus::Active, TaskStatus::Paused)
            | (TaskStatus::Paused, TaskStatus::Active)
            | (TaskStatus::Active | TaskStatus::Paused, TaskStatus::Cancelled) => {
                self.store.update_task_status(task_id, target)?
            }
            (current, _) => {
                return Err(IpcError::Invalid(format!(
                    "task {task_id} is {current} and cannot become {target}"
                )));
            }
        };

        if changed {
            info!(task_id, status = %target, "task status changed");
            self.refresh_snapshots(ctx).await;
        }
        Ok(IpcResponse::ok(json!({
            "taskId": task_id,
            "status": target.as_str(),
            "changed": changed,
        })))
    }

    #[allow(clippy::too_many_arguments)]
    async fn register_group(
        &self,
        ctx: &IpcGroupContext,
        jid: String,
        name: Option<String>,
        folder: String,
        trigger: String,
        requires_trigger: Option<bool>,
        container_config: Option<ContainerConfig>,
    ) -> HandlerResult {
        if jid.trim().is_empty() {
            return Err(IpcError::Invalid("jid must not be empty".to_string()));
        }
        if !is_valid_folder(&folder) {
            return Err(IpcError::Invalid(format!("invalid folder name {folder:?}")));
        }

        let existing = self.store.get_group(&jid)?;
        if !ctx.is_main {
            let owns = existing.as_ref().is_some_and(|g| {
                g.folder == ctx.group_folder
                    && folder == g.folder
                    && (container_config.is_none() || container_config == g.container_config)
            });
            if !owns {
                return Err(IpcError::Unauthorized(
                    "only the main group may register other groups".to_string(),
                ));
            }
        }

        if let Some(holder) = self.store.get_group_by_folder(&folder)? {
            if holder.jid != jid {
                return Err(IpcError::Invalid(format!(
                    "folder {folder} already used by {}",
                    holder.jid
                )));
            }
        }

        let name = match name.filter(|n| !n.trim().is_empty()) {
            Some(name) => name,
            None => self
                .store
                .get_chat(&jid)?
                .and_then(|chat| chat.name)
                .unwrap_or_else(|| jid.clone()),
        };

        let group = RegisteredGroup {
            is_main: folder == self.settings.main_group_folder,
            requires_trigger: requires_trigger
                .or(existing.as_ref().map(|g| g.requires_trigger))
                .unwrap_or(true),
            container_config: container_config
                .or_else(|| existing.as_ref().and_then(|g| g.container_config.clone())),
            added_at: existing
                .as_ref()
                .map(|g| g.added_at.clone())
                .unwrap_or_else(now_timestamp),
            jid,
            name,
            folder,
            trigger,
            disbanded: false,
        };
        self.store.upsert_group(&group)?;
        info!(group_jid = %group.jid, group = %group.folder, "group registered");

        self.refresh_snapshots(ctx).await;
        Ok(IpcResponse::ok(json!({
            "jid": group.jid,
            "name": group.name,
            "folder": group.folder,
            "trigger": group.trigger,
            "isMain": group.is_main,
        })))
    }

    fn update_mount_allowlist(
        &self,
        ctx: &IpcGroupContext,
        entries: Vec<MountAllowlistEntry>,
    ) -> HandlerResult {
        if !ctx.is_main {
            return Err(IpcError::Unauthorized(
                "only the main group may change the mount allowlist".to_string(),
            ));
        }
        if let Some(bad) = entries.iter().find(|e| e.path.trim().is_empty()) {
            return Err(IpcError::Invalid(format!(
                "allowlist entry has empty path: {bad:?}"
            )));
        }
        self.store.upsert_allowlist(&entries)?;
        info!(count = entries.len(), "mount allowlist updated");
        Ok(IpcResponse::ok(json!({ "updated": entries.len() })))
    }

    fn update_canvas(
        &self,
        ctx: &IpcGroupContext,
        request_id: &str,
        target_jid: Option<String>,
        patches: &[CanvasPatch],
    ) -> HandlerResult {
        let target = self.resolve_target(ctx, target_jid.as_deref())?;
        let current = self.store.get_canvas(&target.folder)?.unwrap_or(Value::Null);

        // Appends and index removals are not idempotent, so a redelivered
        // request must not be applied a second time.
        let request_key = format!("{}/{request_id}", ctx.group_folder);
        if self.store.canvas_request_applied(&target.folder, &request_key)? {
            debug!(group = %target.folder, request_key, "canvas update redelivered, skipped");
            return Ok(IpcResponse::ok(json!({
                "folder": target.folder,
                "state": current,
                "duplicate": true,
            })));
        }

        let next = apply_patches(&current, patches).map_err(|e| IpcError::Invalid(e.to_string()))?;
        self.store.set_canvas(&target.folder, &request_key, &next)?;
        debug!(group = %target.folder, patches = patches.len(), "canvas updated");
        Ok(IpcResponse::ok(json!({ "folder": target.folder, "state": next })))
    }

    async fn run_host_command(&self, ctx: &IpcGroupContext, name: &str) -> HandlerResult {
        if !ctx.is_main {
            return Err(IpcError::Unauthorized(
                "only the main group may run host commands".to_string(),
            ));
        }
        match host_commands::run_named(&self.commands, name).await {
            Some(outcome) => {
                let succeeded = outcome.succeeded();
                let mut response = IpcResponse::ok(outcome.to_json());
                if !succeeded {
                    response.success = false;
                    response.error = Some(format!("command {name} failed"));
                }
                Ok(response)
            }
            None => {
                let mut data = Map::new();
                data.insert("commands".to_string(), json!(self.commands.listing()));
                Ok(IpcResponse::error_with(format!("unknown command {name:?}"), data))
            }
        }
    }

    async fn refresh_snapshots(&self, ctx: &IpcGroupContext) {
        let data_dir = &self.settings.data_dir;
        match self.store.list_groups() {
            Ok(groups) => {
                write_groups_snapshot(data_dir, &ctx.group_folder, ctx.is_main, &groups).await
            }
            Err(e) => warn!(group = %ctx.group_folder, error = %e, "failed to load groups for snapshot"),
        }
        match self.store.list_tasks() {
            Ok(tasks) => {
                write_tasks_snapshot(data_dir, &ctx.group_folder, ctx.is_main, &tasks).await
            }
            Err(e) => warn!(group = %ctx.group_folder, error = %e, "failed to load tasks for snapshot"),
        }
    }
}

// ── Filesystem helpers ─────────────────────────────────────────────

/// Sorted `.json` files in `dir`. None if the directory is missing.
fn read_json_files(dir: &Path) -> Option<Vec<PathBuf>> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut files: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            files.sort();
            Some(files)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            error!(dir = %dir.display(), error = %e, "failed to read IPC directory");
            None
        }
    }
}

fn read_and_parse<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn write_response(responses_dir: &Path, request_id: &str, response: &IpcResponse) -> anyhow::Result<()> {
    fs::create_dir_all(responses_dir)?;
    let response_path = responses_dir.join(format!("{request_id}.json"));
    let temp_path = responses_dir.join(format!("{request_id}.json.tmp"));
    fs::write(&temp_path, serde_json::to_string_pretty(response)?)?;
    fs::rename(&temp_path, &response_path)?;
    Ok(())
}

fn move_to_errors(ipc_base: &Path, file_path: &Path, group_folder: &str) {
    let error_dir = ipc_base.join("errors");
    if let Err(e) = fs::create_dir_all(&error_dir) {
        error!(dir = %error_dir.display(), error = %e, "failed to create IPC errors directory");
    }
    if let Some(filename) = file_path.file_name() {
        let dest = error_dir.join(format!("{group_folder}-{}", filename.to_string_lossy()));
        if let Err(e) = fs::rename(file_path, &dest) {
            error!(path = %file_path.display(), error = %e, "failed to move IPC file to errors");
            remove_file(file_path);
        }
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!(path = %path.display(), error = %e, "failed to remove processed IPC file");
    }
}
