//! Smoke tests against the compiled hutchd binary.
//!
//! CLI commands run in a temp project root; the HTTP test starts `serve` on a
//! random port with a runtime binary that does not exist, so no containers
//! are involved.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output};
use std::time::Duration;

fn hutchd() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_hutchd"));
    cmd.env("RUST_LOG", "warn")
        .env_remove("HUTCHD_BIND")
        .env_remove("HUTCH_STATE_DB")
        .env_remove("HUTCH_CHANNEL_CALLBACK_URL")
        .env_remove("HUTCH_MAX_CONCURRENT");
    cmd
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to :0");
    listener.local_addr().unwrap().port()
}

fn write_config(dir: &Path, port: u16) -> PathBuf {
    let path = dir.join("hutch.toml");
    let toml = format!(
        r#"
[server]
bind = "127.0.0.1:{port}"

[storage]
state_db = "store/test.db"

[orchestrator]
assistant_name = "TestBot"
max_concurrent_containers = 2

[container]
runtime_bin = "/nonexistent/hutch-runtime"

[scheduler]
enabled = false

[host_commands.uptime]
program = "uptime"
description = "Host uptime"
"#
    );
    std::fs::write(&path, toml).expect("write test config");
    path
}

fn run(dir: &Path, args: &[&str]) -> Output {
    let output = hutchd()
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run hutchd");
    assert!(
        output.status.success(),
        "hutchd {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

fn stdout_json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn print_config_reflects_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), 7999);

    let output = run(dir.path(), &["print-config", "--config", config.to_str().unwrap()]);
    let body = stdout_json(&output);
    assert_eq!(body["server"]["bind"], "127.0.0.1:7999");
    assert_eq!(body["orchestrator"]["assistant_name"], "TestBot");
    assert_eq!(body["orchestrator"]["max_concurrent_containers"], 2);
    assert_eq!(
        body["orchestrator"]["retry_backoff_ms"],
        serde_json::json!([5000, 10000, 20000, 40000, 80000])
    );
    assert_eq!(body["host_commands"]["uptime"]["program"], "uptime");
}

#[test]
fn register_then_list_groups() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), 7999);
    let config = config.to_str().unwrap();

    run(
        dir.path(),
        &[
            "register-group", "--config", config, "--jid", "tg:1", "--folder", "main",
            "--trigger", "@TestBot", "--name", "Admin", "--no-trigger-required",
        ],
    );
    run(
        dir.path(),
        &[
            "register-group", "--config", config, "--jid", "tg:2", "--folder", "family",
            "--trigger", "@TestBot",
        ],
    );
    assert!(dir.path().join("store/test.db").exists());

    let groups = stdout_json(&run(dir.path(), &["list-groups", "--config", config]));
    let groups = groups.as_array().unwrap();
    assert_eq!(groups.len(), 2);

    let main = groups.iter().find(|g| g["jid"] == "tg:1").unwrap();
    assert_eq!(main["isMain"], true);
    assert_eq!(main["requiresTrigger"], false);
    assert_eq!(main["name"], "Admin");

    let family = groups.iter().find(|g| g["jid"] == "tg:2").unwrap();
    assert_eq!(family["isMain"], false);
    assert_eq!(family["folder"], "family");
    assert_eq!(family["name"], "tg:2");
}

#[test]
fn register_rejects_bad_folder() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), 7999);
    let output = hutchd()
        .args([
            "register-group", "--config", config.to_str().unwrap(), "--jid", "tg:5",
            "--folder", "../escape", "--trigger", "@TestBot",
        ])
        .current_dir(dir.path())
        .output()
        .expect("run hutchd");
    assert!(!output.status.success());
}

struct TestServer {
    child: Child,
    base_url: String,
}

impl TestServer {
    fn start(dir: &Path, config: &Path, port: u16) -> Self {
        let child = hutchd()
            .args(["serve", "--config", config.to_str().unwrap()])
            .current_dir(dir)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .expect("spawn hutchd");
        let server = TestServer {
            child,
            base_url: format!("http://127.0.0.1:{port}"),
        };
        server.wait_ready();
        server
    }

    fn wait_ready(&self) {
        let client = reqwest::blocking::Client::new();
        for _ in 0..50 {
            if client
                .get(format!("{}/healthz", self.base_url))
                .timeout(Duration::from_millis(200))
                .send()
                .is_ok()
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("hutchd did not become ready within 5 seconds");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGINT);
        }
        #[cfg(not(unix))]
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn serve_exposes_health_queue_and_inbound() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_config(dir.path(), port);
    let server = TestServer::start(dir.path(), &config, port);
    let client = reqwest::blocking::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/healthz", server.base_url))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["service"], "hutchd");

    let ready = client.get(format!("{}/readyz", server.base_url)).send().unwrap();
    assert_eq!(ready.status(), 200);
    let ready: serde_json::Value = ready.json().unwrap();
    assert_eq!(ready["registered_groups"], 0);

    let inbound: serde_json::Value = client
        .post(format!("{}/v1/inbound", server.base_url))
        .json(&serde_json::json!({
            "jid": "tg:42",
            "sender": "u1",
            "content": "@TestBot hello",
            "chat_name": "Somebody"
        }))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(inbound["accepted"], false);
    assert_eq!(inbound["reason"], "unregistered");

    let queue: serde_json::Value = client
        .get(format!("{}/v1/queue", server.base_url))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(queue["active_count"], 0);
    assert_eq!(queue["max_concurrent"], 2);
}
