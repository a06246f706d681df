//! Secret loading and runtime argument construction.
//!
//! Secrets are read from the project `.env` on every run and handed to the
//! container through its stdin payload; they are never exported into the
//! host environment or written to a mounted file.

use std::collections::HashMap;
use std::path::Path;

use hutch_core::VolumeMount;
use tracing::debug;

/// Values of `keys` found in a `.env` file. Missing file yields an empty map.
pub fn read_env_file(env_path: &Path, keys: &[String]) -> HashMap<String, String> {
    let content = match std::fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => {
            debug!(path = %env_path.display(), ".env file not found");
            return HashMap::new();
        }
    };

    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| keys.iter().any(|k| k == key.trim()))
        .filter_map(|(key, value)| {
            let value = unquote(value.trim());
            (!value.is_empty()).then(|| (key.trim().to_string(), value.to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

pub fn read_secrets(project_root: &Path, keys: &[String]) -> HashMap<String, String> {
    read_env_file(&project_root.join(".env"), keys)
}

/// Arguments for `<runtime> run`: interactive, auto-removed, named, one `-v`
/// per mount, image last.
pub fn build_container_args(
    mounts: &[VolumeMount],
    container_name: &str,
    image: &str,
    timezone: &str,
) -> Vec<String> {
    let mut args: Vec<String> = ["run", "-i", "--rm", "--name", container_name, "-e"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(format!("TZ={timezone}"));

    // Match the host user so bind-mounted files stay writable; root and the
    // image's default uid need no override.
    #[cfg(unix)]
    {
        let (uid, gid) = host_ids();
        if uid != 0 && uid != 1000 {
            args.push("--user".to_string());
            args.push(format!("{uid}:{gid}"));
            args.push("-e".to_string());
            args.push("HOME=/home/node".to_string());
        }
    }

    for mount in mounts {
        args.push("-v".to_string());
        if mount.readonly {
            args.push(format!("{}:{}:ro", mount.host_path, mount.container_path));
        } else {
            args.push(format!("{}:{}", mount.host_path, mount.container_path));
        }
    }

    args.push(image.to_string());
    args
}

#[cfg(unix)]
fn host_ids() -> (u32, u32) {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    unsafe { (libc::getuid(), libc::getgid()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn read_env_file_picks_requested_keys() {
        let tmp = TempDir::new().unwrap();
        let env_path = tmp.path().join(".env");
        fs::write(
            &env_path,
            "# comment\nANTHROPIC_API_KEY=sk-test-123\nIRRELEVANT=ignored\nEMPTY=\n",
        )
        .unwrap();

        let result = read_env_file(&env_path, &keys(&["ANTHROPIC_API_KEY", "EMPTY"]));
        assert_eq!(result.get("ANTHROPIC_API_KEY").map(String::as_str), Some("sk-test-123"));
        assert!(!result.contains_key("IRRELEVANT"));
        assert!(!result.contains_key("EMPTY"));
    }

    #[test]
    fn read_env_file_strips_quotes() {
        let tmp = TempDir::new().unwrap();
        let env_path = tmp.path().join(".env");
        fs::write(&env_path, "KEY1=\"quoted\"\nKEY2='single'\nKEY3=a=b\n").unwrap();

        let result = read_env_file(&env_path, &keys(&["KEY1", "KEY2", "KEY3"]));
        assert_eq!(result.get("KEY1").map(String::as_str), Some("quoted"));
        assert_eq!(result.get("KEY2").map(String::as_str), Some("single"));
        assert_eq!(result.get("KEY3").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn missing_env_file_yields_no_secrets() {
        let tmp = TempDir::new().unwrap();
        assert!(read_secrets(tmp.path(), &keys(&["KEY"])).is_empty());
    }

    #[test]
    fn container_args_carry_mounts_and_image_last() {
        let mounts = vec![
            VolumeMount::new("/srv/project", "/workspace/project", true),
            VolumeMount::new("/srv/groups/main", "/workspace/group", false),
        ];

        let args = build_container_args(&mounts, "hutch-main-1", "hutch-agent:latest", "UTC");

        assert_eq!(&args[..5], &["run", "-i", "--rm", "--name", "hutch-main-1"]);
        assert!(args.contains(&"TZ=UTC".to_string()));
        assert!(args.contains(&"/srv/project:/workspace/project:ro".to_string()));
        assert!(args.contains(&"/srv/groups/main:/workspace/group".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("hutch-agent:latest"));
    }
}
