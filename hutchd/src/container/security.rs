//! Extra-mount validation against the mount allowlist.
//!
//! The allowlist lives in the state store, outside anything a container can
//! write, and is only extended through an authorized IPC request. Validation
//! always happens host-side before the runtime is started.

use std::fmt;
use std::path::{Path, PathBuf};

use hutch_core::model::{AdditionalMount, MountAllowlistEntry};
use tracing::{info, warn};

/// Path fragments that are never mounted, even under an allowlisted root.
const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".gpg",
    ".aws",
    ".azure",
    ".gcloud",
    ".kube",
    ".docker",
    "credentials",
    ".env",
    ".netrc",
    ".npmrc",
    ".pypirc",
    "id_rsa",
    "id_ed25519",
    "private_key",
    ".secret",
];

/// Allowlist snapshot used for one mount plan.
#[derive(Debug, Clone)]
pub struct MountAllowlist {
    entries: Vec<MountAllowlistEntry>,
    blocked_patterns: Vec<String>,
}

impl MountAllowlist {
    pub fn new(entries: Vec<MountAllowlistEntry>) -> Self {
        Self {
            entries,
            blocked_patterns: DEFAULT_BLOCKED_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A mount that passed validation, ready for the runtime arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

/// Why a requested extra mount was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountRejection {
    InvalidContainerPath(String),
    HostPathMissing(String),
    BlockedPattern { pattern: String, path: String },
    NotAllowlisted(String),
}

impl fmt::Display for MountRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountRejection::InvalidContainerPath(p) => write!(
                f,
                "invalid container path \"{p}\": must be relative, non-empty and free of \"..\""
            ),
            MountRejection::HostPathMissing(p) => write!(f, "host path does not exist: \"{p}\""),
            MountRejection::BlockedPattern { pattern, path } => {
                write!(f, "path \"{path}\" matches blocked pattern \"{pattern}\"")
            }
            MountRejection::NotAllowlisted(p) => {
                write!(f, "path \"{p}\" is not under any allowlisted root")
            }
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/root".to_string()))
}

/// Expand a leading `~` to the home directory.
fn expand_path(p: &str) -> PathBuf {
    if p == "~" {
        home_dir()
    } else if let Some(rest) = p.strip_prefix("~/") {
        home_dir().join(rest)
    } else {
        PathBuf::from(p)
    }
}

fn matches_blocked_pattern(real: &Path, patterns: &[String]) -> Option<String> {
    patterns
        .iter()
        .find(|pattern| {
            real.components()
                .any(|c| c.as_os_str().to_string_lossy().contains(pattern.as_str()))
        })
        .cloned()
}

fn find_allowed_entry<'a>(
    real: &Path,
    entries: &'a [MountAllowlistEntry],
) -> Option<&'a MountAllowlistEntry> {
    entries.iter().find(|entry| {
        std::fs::canonicalize(expand_path(&entry.path))
            .map(|root| real.starts_with(root))
            .unwrap_or(false)
    })
}

/// Container paths are relative to `/workspace/extra/`.
fn is_valid_container_path(p: &str) -> bool {
    !p.is_empty() && !p.contains("..") && !p.starts_with('/')
}

/// Validate a single requested mount.
pub fn validate_mount(
    mount: &AdditionalMount,
    allowlist: &MountAllowlist,
) -> Result<ValidatedMount, MountRejection> {
    let container_path = match mount.container_path.as_deref() {
        Some(p) => p.to_string(),
        None => Path::new(&mount.host_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("mount")
            .to_string(),
    };
    if !is_valid_container_path(&container_path) {
        return Err(MountRejection::InvalidContainerPath(container_path));
    }

    let expanded = expand_path(&mount.host_path);
    let real = std::fs::canonicalize(&expanded)
        .map_err(|_| MountRejection::HostPathMissing(mount.host_path.clone()))?;

    if let Some(pattern) = matches_blocked_pattern(&real, &allowlist.blocked_patterns) {
        return Err(MountRejection::BlockedPattern {
            pattern,
            path: real.display().to_string(),
        });
    }

    let entry = find_allowed_entry(&real, &allowlist.entries)
        .ok_or_else(|| MountRejection::NotAllowlisted(real.display().to_string()))?;

    let readonly = if !mount.readonly && !entry.allow_read_write {
        info!(
            mount = %mount.host_path,
            root = %entry.path,
            "mount downgraded to read-only; allowlist entry is read-only"
        );
        true
    } else {
        mount.readonly
    };

    Ok(ValidatedMount {
        host_path: real.to_string_lossy().to_string(),
        container_path: format!("/workspace/extra/{container_path}"),
        readonly,
    })
}

/// Validate every requested mount; rejected ones are logged and dropped.
pub fn validate_additional_mounts(
    mounts: &[AdditionalMount],
    group_folder: &str,
    allowlist: &MountAllowlist,
) -> Vec<ValidatedMount> {
    if !mounts.is_empty() && allowlist.is_empty() {
        warn!(
            group = group_folder,
            requested = mounts.len(),
            "mount allowlist is empty, all extra mounts rejected"
        );
        return Vec::new();
    }

    let mut validated = Vec::new();
    for mount in mounts {
        match validate_mount(mount, allowlist) {
            Ok(vm) => validated.push(vm),
            Err(reason) => warn!(
                group = group_folder,
                requested_path = %mount.host_path,
                %reason,
                "extra mount rejected"
            ),
        }
    }
    validated
}
