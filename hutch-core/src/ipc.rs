//! IPC types shared between container agents and the hutchd host.
//!
//! Containers write one JSON request per file into `/workspace/ipc/tasks/`.
//! The host polls the per-group `tasks/` directories, authorizes and executes
//! each request, and for synchronous types writes a response with the same
//! file name into `responses/`. The requester deletes the response after
//! reading it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{ContainerConfig, ContextMode, MountAllowlistEntry, ScheduleKind};

/// Request written by a container into its `tasks/` directory.
///
/// Unknown `type` values fail to deserialize and are treated as malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    ScheduleTask {
        /// Optional caller-chosen id; defaults to one derived from the request file.
        #[serde(default, rename = "taskId")]
        task_id: Option<String>,
        prompt: String,
        schedule_type: ScheduleKind,
        schedule_value: String,
        #[serde(default)]
        context_mode: ContextMode,
        #[serde(default, rename = "targetJid")]
        target_jid: Option<String>,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    RegisterGroup {
        jid: String,
        #[serde(default)]
        name: Option<String>,
        folder: String,
        trigger: String,
        #[serde(default, rename = "requiresTrigger")]
        requires_trigger: Option<bool>,
        #[serde(default, rename = "containerConfig")]
        container_config: Option<ContainerConfig>,
    },
    UpdateMountAllowlist {
        entries: Vec<MountAllowlistEntry>,
    },
    UpdateCanvas {
        #[serde(default, rename = "targetJid")]
        target_jid: Option<String>,
        patches: Vec<CanvasPatch>,
    },
    RunHostCommand {
        name: String,
    },
    RefreshOauth {},
    RefreshGroups {},
}

impl IpcRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            IpcRequest::ScheduleTask { .. } => "schedule_task",
            IpcRequest::PauseTask { .. } => "pause_task",
            IpcRequest::ResumeTask { .. } => "resume_task",
            IpcRequest::CancelTask { .. } => "cancel_task",
            IpcRequest::RegisterGroup { .. } => "register_group",
            IpcRequest::UpdateMountAllowlist { .. } => "update_mount_allowlist",
            IpcRequest::UpdateCanvas { .. } => "update_canvas",
            IpcRequest::RunHostCommand { .. } => "run_host_command",
            IpcRequest::RefreshOauth {} => "refresh_oauth",
            IpcRequest::RefreshGroups {} => "refresh_groups",
        }
    }

    /// Fire-and-forget requests get no response file.
    pub fn expects_response(&self) -> bool {
        !matches!(self, IpcRequest::RefreshOauth {})
    }
}

/// One operation of an ordered canvas patch stream.
///
/// Paths are JSON Pointers (`/board/columns/0`). Every op is idempotent so
/// a redelivered request converges to the same state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CanvasPatch {
    Set { path: String, value: Value },
    Merge { path: String, value: Value },
    Remove { path: String },
}

/// Response written to `responses/{same file name}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl IpcResponse {
    /// Successful response; object payloads are flattened into the response.
    pub fn ok(data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                map
            }
        };
        Self {
            success: true,
            error: None,
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            data: Map::new(),
        }
    }

    /// Failed response carrying extra fields.
    pub fn error_with(message: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            data,
        }
    }
}

/// Context for authorization decisions, derived from the IPC directory path.
#[derive(Debug, Clone)]
pub struct IpcGroupContext {
    /// Group folder name (e.g., "main", "family").
    pub group_folder: String,
    /// Whether this is the main group (has elevated privileges).
    pub is_main: bool,
}

impl IpcGroupContext {
    pub fn new(group_folder: impl Into<String>, main_group_folder: &str) -> Self {
        let group_folder = group_folder.into();
        let is_main = group_folder == main_group_folder;
        Self {
            group_folder,
            is_main,
        }
    }
}
