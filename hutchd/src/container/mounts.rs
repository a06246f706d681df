//! Volume mount plan for one container invocation.

use std::fs;
use std::path::Path;

use hutch_core::VolumeMount;
use hutch_core::model::RegisteredGroup;
use tracing::debug;

use super::security::{MountAllowlist, validate_additional_mounts};

/// Host directories the plan is built from.
#[derive(Debug, Clone)]
pub struct MountRoots<'a> {
    pub project_root: &'a Path,
    pub groups_dir: &'a Path,
    pub data_dir: &'a Path,
}

/// IPC subdirectories and whether the container may write them.
const IPC_LAYOUT: &[(&str, bool)] = &[
    ("tasks", false),
    ("responses", false),
    ("messages", true),
    ("input", true),
    ("snapshots", true),
];

fn mount(host: &Path, container_path: &str, readonly: bool) -> VolumeMount {
    VolumeMount::new(host.to_string_lossy(), container_path, readonly)
}

/// Build the ordered mount list for `group`.
///
/// - main: project root (ro) at `/workspace/project`
/// - all: group folder (rw), global folder (rw for main, ro otherwise),
///   per-group IPC namespace, per-group session directory
/// - extra mounts from the group's container config, only if allowlisted
pub fn build_volume_mounts(
    group: &RegisteredGroup,
    is_main: bool,
    roots: &MountRoots<'_>,
    allowlist: &MountAllowlist,
) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();

    if is_main {
        mounts.push(mount(roots.project_root, "/workspace/project", true));
    }

    let group_dir = roots.groups_dir.join(&group.folder);
    fs::create_dir_all(&group_dir).ok();
    mounts.push(mount(&group_dir, "/workspace/group", false));

    let global_dir = roots.groups_dir.join("global");
    fs::create_dir_all(&global_dir).ok();
    mounts.push(mount(&global_dir, "/workspace/global", !is_main));

    let ipc_dir = roots.data_dir.join("ipc").join(&group.folder);
    for (sub, readonly) in IPC_LAYOUT {
        let host = ipc_dir.join(sub);
        fs::create_dir_all(&host).ok();
        mounts.push(mount(&host, &format!("/workspace/ipc/{sub}"), *readonly));
    }

    let sessions_dir = roots
        .data_dir
        .join("sessions")
        .join(&group.folder)
        .join(".claude");
    fs::create_dir_all(&sessions_dir).ok();
    mounts.push(mount(&sessions_dir, "/home/node/.claude", false));

    if let Some(config) = &group.container_config {
        if !config.additional_mounts.is_empty() {
            let validated =
                validate_additional_mounts(&config.additional_mounts, &group.folder, allowlist);
            debug!(
                group = %group.folder,
                requested = config.additional_mounts.len(),
                accepted = validated.len(),
                "extra mounts validated"
            );
            mounts.extend(
                validated
                    .into_iter()
                    .map(|vm| VolumeMount::new(vm.host_path, vm.container_path, vm.readonly)),
            );
        }
    }

    mounts
}

/// Runtime-safe container name: `hutch-{folder}-{epoch millis}`.
pub fn container_name(group_folder: &str) -> String {
    let safe_name: String = group_folder
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("hutch-{safe_name}-{now}")
}
