//! Container protocol types shared between hutchd and the in-container agent runner.
//!
//! Defines the wire format for communication with agent containers:
//! - `ContainerInput`: JSON written once to container stdin
//! - `ContainerOutput`: JSON extracted from stdout between OUTPUT marker lines
//! - `VolumeMount`: one entry of the mount plan handed to the runtime

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sentinel lines delimiting the structured result block.
/// Must match the constants in the container agent-runner code.
pub const OUTPUT_START_MARKER: &str = "---HUTCH_OUTPUT_START---";
pub const OUTPUT_END_MARKER: &str = "---HUTCH_OUTPUT_END---";

/// Input payload written to container stdin as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_scheduled_task: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_name: Option<String>,
    /// Secrets injected via stdin, never written to a mounted file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets: Option<HashMap<String, String>>,
}

/// Result block extracted from container stdout between OUTPUT markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOutput {
    pub status: ContainerStatus,
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContainerOutput {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ContainerStatus::Error,
            result: None,
            new_session_id: None,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ContainerStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Success,
    Error,
}

/// Volume mount specification for container execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

impl VolumeMount {
    pub fn new(host_path: impl Into<String>, container_path: impl Into<String>, readonly: bool) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            readonly,
        }
    }
}

/// Line-oriented scanner for container stdout.
///
/// Lines between a start and end marker line are collected as one JSON body;
/// every other line is diagnostic output. The last complete block wins.
#[derive(Debug, Default)]
pub struct OutputScanner {
    in_block: bool,
    current: String,
    last_block: Option<String>,
}

/// Classification of a single stdout line.
#[derive(Debug, PartialEq, Eq)]
pub enum ScannedLine<'a> {
    /// Marker line or a line inside a block.
    Protocol,
    /// Line outside any block.
    Diagnostic(&'a str),
}

impl OutputScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line<'a>(&mut self, line: &'a str) -> ScannedLine<'a> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.trim() == OUTPUT_START_MARKER {
            // A second start marker discards an unterminated block.
            self.in_block = true;
            self.current.clear();
            return ScannedLine::Protocol;
        }
        if self.in_block {
            if trimmed.trim() == OUTPUT_END_MARKER {
                self.in_block = false;
                self.last_block = Some(std::mem::take(&mut self.current).trim().to_string());
            } else {
                self.current.push_str(trimmed);
                self.current.push('\n');
            }
            return ScannedLine::Protocol;
        }
        ScannedLine::Diagnostic(trimmed)
    }

    /// The body of the last complete block, if any.
    pub fn finish(self) -> Option<String> {
        self.last_block
    }
}
