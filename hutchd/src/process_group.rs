//! Processing callbacks handed to the `GroupQueue`.
//!
//! When a group's turn comes, the process callback takes one batch from the
//! inbox, runs it through the container runner and routes the result to the
//! channel. An attempt that fails, errors or is aborted by the queue holds
//! its batch aside so the retry sees the same input. The exhaustion callback
//! drops that batch and tells the chat.

use std::sync::Arc;

use hutch_core::model::{ContextMode, RegisteredGroup};
use hutch_core::{ContainerInput, ContainerOutput};
use hutch_store::StateStore;
use tracing::{debug, error, info, warn};

use crate::channel::SharedSink;
use crate::container::runner::{
    ContainerRunner, ProgressCallback, write_groups_snapshot, write_tasks_snapshot,
};
use crate::container::security::MountAllowlist;
use crate::inbox::{Batch, Inbox, format_messages};
use crate::queue::{ExhaustionFn, GroupQueue, ProcessMessagesFn};

/// Shared handles the callbacks capture.
#[derive(Clone)]
pub struct ProcessContext {
    pub store: StateStore,
    pub queue: GroupQueue,
    pub inbox: Inbox,
    pub runner: ContainerRunner,
    pub channel: SharedSink,
    pub assistant_name: String,
    pub main_group_folder: String,
}

impl ProcessContext {
    pub fn is_main(&self, group: &RegisteredGroup) -> bool {
        group.is_main || group.folder == self.main_group_folder
    }
}

pub fn build_process_messages_fn(ctx: ProcessContext) -> ProcessMessagesFn {
    Arc::new(move |chat_jid: String| {
        let ctx = ctx.clone();
        Box::pin(async move {
            match process_group(&ctx, &chat_jid).await {
                Ok(success) => success,
                Err(e) => {
                    error!(group_jid = %chat_jid, error = %e, "processing attempt failed");
                    false
                }
            }
        })
    })
}

pub fn build_exhaustion_fn(ctx: ProcessContext) -> ExhaustionFn {
    Arc::new(move |chat_jid: String| {
        let ctx = ctx.clone();
        Box::pin(async move {
            let dropped = ctx.inbox.drop_failed(&chat_jid);
            warn!(group_jid = %chat_jid, dropped, "retries exhausted, failed input dropped");
            if let Err(e) = ctx.channel.set_typing(&chat_jid, false).await {
                debug!(group_jid = %chat_jid, error = %e, "failed to clear typing indicator");
            }
            let notice = "Sorry, I couldn't process your last message after several attempts. Please try again.";
            if let Err(e) = ctx.channel.send_message(&chat_jid, notice).await {
                warn!(group_jid = %chat_jid, error = %e, "failed to send exhaustion notice");
            }
        })
    })
}

async fn process_group(ctx: &ProcessContext, chat_jid: &str) -> anyhow::Result<bool> {
    let Some(group) = ctx.store.get_group(chat_jid)? else {
        let dropped = ctx.inbox.clear(chat_jid);
        warn!(group_jid = chat_jid, dropped, "check for unregistered group, input dropped");
        return Ok(true);
    };
    if group.disbanded {
        let dropped = ctx.inbox.clear(chat_jid);
        info!(group_jid = chat_jid, dropped, "group disbanded, input dropped");
        return Ok(true);
    }

    let Some(batch) = ctx.inbox.take_batch(chat_jid) else {
        debug!(group_jid = chat_jid, "nothing actionable");
        return Ok(true);
    };
    let batch = InFlightBatch::new(ctx.inbox.clone(), chat_jid, batch);

    let is_main = ctx.is_main(&group);
    let input = build_input(ctx, &group, chat_jid, is_main, batch.get())?;
    let allowlist = MountAllowlist::new(ctx.store.list_allowlist()?);

    refresh_snapshots(ctx, &group.folder, is_main).await;

    if let Err(e) = ctx.channel.set_typing(chat_jid, true).await {
        debug!(group_jid = chat_jid, error = %e, "failed to set typing indicator");
    }

    let folder = group.folder.clone();
    let progress: ProgressCallback = Arc::new(move |line: String| {
        debug!(group = %folder, "{}", line);
    });
    let run = ctx
        .runner
        .run(&group, &input, &allowlist, Some(progress))
        .await;

    if let Err(e) = ctx.channel.set_typing(chat_jid, false).await {
        debug!(group_jid = chat_jid, error = %e, "failed to clear typing indicator");
    }

    let output = run.output;
    if !output.is_success() {
        warn!(
            group = %group.folder,
            container_name = %run.container_name,
            error = output.error.as_deref().unwrap_or("unknown"),
            "agent run failed, input held for retry"
        );
        return Ok(false);
    }

    info!(
        group = %group.folder,
        container_name = %run.container_name,
        duration_ms = run.duration.as_millis() as u64,
        "agent run succeeded"
    );
    record_success(ctx, &group, chat_jid, batch.get(), &output).await;
    batch.delivered();

    if ctx.inbox.has_actionable(chat_jid) {
        ctx.queue.enqueue_message_check(chat_jid).await;
    }
    Ok(true)
}

/// A batch taken from the inbox for one attempt. Unless marked delivered it
/// goes back to the inbox on drop, which also covers errors and an attempt
/// aborted by the queue's invocation limit.
struct InFlightBatch {
    inbox: Inbox,
    jid: String,
    batch: Batch,
    delivered: bool,
}

impl InFlightBatch {
    fn new(inbox: Inbox, jid: &str, batch: Batch) -> Self {
        Self {
            inbox,
            jid: jid.to_string(),
            batch,
            delivered: false,
        }
    }

    fn get(&self) -> &Batch {
        &self.batch
    }

    fn delivered(mut self) {
        self.delivered = true;
    }
}

impl Drop for InFlightBatch {
    fn drop(&mut self) {
        if self.delivered {
            return;
        }
        let batch = std::mem::replace(&mut self.batch, Batch::Chat(Vec::new()));
        debug!(group_jid = %self.jid, items = batch.item_count(), "attempt did not deliver, batch held");
        self.inbox.hold_failed(&self.jid, batch);
    }
}

fn build_input(
    ctx: &ProcessContext,
    group: &RegisteredGroup,
    chat_jid: &str,
    is_main: bool,
    batch: &Batch,
) -> anyhow::Result<ContainerInput> {
    let (prompt, session_id, is_scheduled_task) = match batch {
        Batch::Chat(messages) => (
            format_messages(messages),
            ctx.store.get_session(&group.folder)?,
            None,
        ),
        Batch::Task(task) => {
            let session_id = match task.context_mode {
                ContextMode::Group => ctx.store.get_session(&group.folder)?,
                ContextMode::Isolated => None,
            };
            (task.prompt.clone(), session_id, Some(true))
        }
    };

    Ok(ContainerInput {
        prompt,
        session_id,
        group_folder: group.folder.clone(),
        chat_jid: chat_jid.to_string(),
        is_main,
        is_scheduled_task,
        assistant_name: Some(ctx.assistant_name.clone()),
        secrets: None,
    })
}

/// Rewrite the group's snapshot files from the store.
pub async fn refresh_snapshots(ctx: &ProcessContext, group_folder: &str, is_main: bool) {
    let data_dir = &ctx.runner.settings().data_dir;
    match ctx.store.list_groups() {
        Ok(groups) => write_groups_snapshot(data_dir, group_folder, is_main, &groups).await,
        Err(e) => warn!(group = group_folder, error = %e, "failed to load groups for snapshot"),
    }
    match ctx.store.list_tasks() {
        Ok(tasks) => write_tasks_snapshot(data_dir, group_folder, is_main, &tasks).await,
        Err(e) => warn!(group = group_folder, error = %e, "failed to load tasks for snapshot"),
    }
}

async fn record_success(
    ctx: &ProcessContext,
    group: &RegisteredGroup,
    chat_jid: &str,
    batch: &Batch,
    output: &ContainerOutput,
) {
    let isolated_task = matches!(batch, Batch::Task(t) if t.context_mode == ContextMode::Isolated);
    if let Some(session_id) = output.new_session_id.as_deref() {
        if !isolated_task {
            if let Err(e) = ctx.store.set_session(&group.folder, session_id) {
                warn!(group = %group.folder, error = %e, "failed to store session id");
            }
        }
    }

    if let Batch::Task(task) = batch {
        let summary = output.result.as_deref().unwrap_or("completed");
        if let Err(e) = ctx.store.update_task_result(&task.task_id, summary) {
            warn!(task_id = %task.task_id, error = %e, "failed to record task result");
        }
    }

    if let Some(text) = output.result.as_deref() {
        if let Err(e) = ctx.channel.send_message(chat_jid, text).await {
            warn!(group_jid = chat_jid, error = %e, "failed to deliver agent result");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::channel::RecordingChannel;
    use crate::container::runner::RunnerSettings;
    use crate::inbox::{ChatMessage, InboundItem, TaskRun};
    use crate::queue::QueueSettings;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    fn fake_runtime(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-runtime.sh");
        std::fs::write(
            &path,
            format!("#!/bin/sh\nif [ \"$1\" = \"stop\" ]; then exit 0; fi\ncat > /dev/null\n{body}\n"),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn context(tmp: &TempDir, runtime: PathBuf, channel: Arc<RecordingChannel>) -> ProcessContext {
        let store = StateStore::open(tmp.path().join("store/hutch.db")).unwrap();
        store
            .upsert_group(&RegisteredGroup {
                jid: "tg:2".to_string(),
                name: "Family".to_string(),
                folder: "family".to_string(),
                trigger: "@Andy".to_string(),
                is_main: false,
                requires_trigger: true,
                container_config: None,
                added_at: "2026-01-01T00:00:00.000Z".to_string(),
                disbanded: false,
            })
            .unwrap();
        let runner = ContainerRunner::new(RunnerSettings {
            runtime_bin: runtime.to_string_lossy().to_string(),
            image: "hutch-agent:test".to_string(),
            timezone: "UTC".to_string(),
            timeout: Duration::from_secs(10),
            stop_grace: Duration::from_millis(100),
            secret_keys: Vec::new(),
            project_root: tmp.path().to_path_buf(),
            groups_dir: tmp.path().join("groups"),
            data_dir: tmp.path().join("data"),
        });
        ProcessContext {
            store,
            queue: GroupQueue::new(QueueSettings::default()),
            inbox: Inbox::new(),
            runner,
            channel,
            assistant_name: "Andy".to_string(),
            main_group_folder: "main".to_string(),
        }
    }

    fn triggered(content: &str) -> InboundItem {
        InboundItem::Chat(ChatMessage {
            sender: "u1".to_string(),
            sender_name: "Alice".to_string(),
            content: content.to_string(),
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
            triggered: true,
        })
    }

    const SUCCESS_BODY: &str = "echo '---HUTCH_OUTPUT_START---'\necho '{\"status\":\"success\",\"result\":\"Hello Alice\",\"newSessionId\":\"sess-1\"}'\necho '---HUTCH_OUTPUT_END---'";

    #[tokio::test]
    async fn success_delivers_result_and_stores_session() {
        let tmp = TempDir::new().unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let ctx = context(&tmp, fake_runtime(tmp.path(), SUCCESS_BODY), channel.clone());
        ctx.inbox.push("tg:2", triggered("@Andy hi"));

        let process = build_process_messages_fn(ctx.clone());
        assert!(process("tg:2".to_string()).await);

        assert_eq!(
            channel.messages.lock().unwrap().as_slice(),
            &[("tg:2".to_string(), "Hello Alice".to_string())]
        );
        assert_eq!(ctx.store.get_session("family").unwrap().as_deref(), Some("sess-1"));
        assert_eq!(ctx.inbox.len("tg:2"), 0);
        let typing = channel.typing.lock().unwrap().clone();
        assert_eq!(typing.first().map(|t| t.1), Some(true));
        assert_eq!(typing.last().map(|t| t.1), Some(false));
        assert!(
            tmp.path()
                .join("data/ipc/family/snapshots/available_groups.json")
                .exists()
        );
    }

    #[tokio::test]
    async fn failure_holds_the_batch_for_retry() {
        let tmp = TempDir::new().unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let ctx = context(&tmp, fake_runtime(tmp.path(), "echo boom >&2\nexit 3"), channel.clone());
        ctx.inbox.push("tg:2", triggered("@Andy hi"));

        let process = build_process_messages_fn(ctx.clone());
        assert!(!process("tg:2".to_string()).await);

        assert!(ctx.inbox.has_actionable("tg:2"));
        assert!(channel.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn isolated_task_keeps_group_session() {
        let tmp = TempDir::new().unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let ctx = context(&tmp, fake_runtime(tmp.path(), SUCCESS_BODY), channel.clone());
        ctx.store.set_session("family", "sess-0").unwrap();
        ctx.inbox.push(
            "tg:2",
            InboundItem::Task(TaskRun {
                task_id: "t1".to_string(),
                prompt: "daily summary".to_string(),
                context_mode: ContextMode::Isolated,
            }),
        );

        let process = build_process_messages_fn(ctx.clone());
        assert!(process("tg:2".to_string()).await);

        assert_eq!(ctx.store.get_session("family").unwrap().as_deref(), Some("sess-0"));
    }

    #[tokio::test]
    async fn unknown_group_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let ctx = context(&tmp, fake_runtime(tmp.path(), SUCCESS_BODY), channel);
        ctx.inbox.push("tg:404", triggered("@Andy hi"));

        let process = build_process_messages_fn(ctx.clone());
        assert!(process("tg:404".to_string()).await);
        assert_eq!(ctx.inbox.len("tg:404"), 0);
    }

    #[tokio::test]
    async fn exhaustion_drops_failed_batch_and_notifies() {
        let tmp = TempDir::new().unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let ctx = context(&tmp, fake_runtime(tmp.path(), SUCCESS_BODY), channel.clone());
        ctx.inbox.push("tg:2", triggered("@Andy hi"));
        let failed = ctx.inbox.take_batch("tg:2").unwrap();
        ctx.inbox.hold_failed("tg:2", failed);
        ctx.inbox.push("tg:2", triggered("@Andy are you there?"));

        let on_exhaustion = build_exhaustion_fn(ctx.clone());
        on_exhaustion("tg:2".to_string()).await;

        assert_eq!(ctx.inbox.len("tg:2"), 1);
        assert_eq!(channel.messages.lock().unwrap().len(), 1);
        assert_eq!(channel.typing.lock().unwrap().as_slice(), &[("tg:2".to_string(), false)]);
    }

    /// Runtime script that does not drain stdin for the caller.
    fn scripted_runtime(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("scripted-runtime.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Context whose queue drives the real process and exhaustion callbacks.
    async fn wired(
        tmp: &TempDir,
        runtime: PathBuf,
        channel: Arc<RecordingChannel>,
        settings: QueueSettings,
    ) -> ProcessContext {
        let mut ctx = context(tmp, runtime, channel);
        ctx.queue = GroupQueue::new(settings);
        ctx.queue
            .set_process_messages_fn(build_process_messages_fn(ctx.clone()))
            .await;
        ctx.queue.set_on_exhaustion_fn(build_exhaustion_fn(ctx.clone())).await;
        ctx
    }

    fn fast_retries(max_invocation: Duration) -> QueueSettings {
        QueueSettings {
            max_concurrent: 2,
            retry_backoff: vec![Duration::from_millis(50); 5],
            max_invocation,
        }
    }

    async fn wait_until(limit: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        cond()
    }

    /// Fails the first `failures` runs, then answers. Every stdin payload
    /// is appended to `stdin.log`, one line per run.
    fn flaky_runtime(dir: &Path, failures: u32) -> PathBuf {
        let counter = dir.join("runs");
        let stdin_log = dir.join("stdin.log");
        scripted_runtime(
            dir,
            &format!(
                "if [ \"$1\" = \"stop\" ]; then exit 0; fi\n\
                 cat >> '{log}'\necho >> '{log}'\n\
                 n=$(cat '{counter}' 2>/dev/null || echo 0)\nn=$((n+1))\necho $n > '{counter}'\n\
                 if [ $n -le {failures} ]; then echo boom >&2; exit 3; fi\n{SUCCESS_BODY}",
                log = stdin_log.display(),
                counter = counter.display(),
            ),
        )
    }

    fn run_count(dir: &Path) -> u32 {
        std::fs::read_to_string(dir.join("runs"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn failed_runs_retry_the_same_batch_until_delivered() {
        let tmp = TempDir::new().unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let runtime = flaky_runtime(tmp.path(), 3);
        let ctx = wired(&tmp, runtime, channel.clone(), fast_retries(Duration::from_secs(10))).await;

        ctx.inbox.push("tg:2", triggered("@Andy hi"));
        ctx.queue.enqueue_message_check("tg:2").await;

        let sent = channel.clone();
        assert!(wait_until(Duration::from_secs(15), move || !sent.messages.lock().unwrap().is_empty()).await);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(
            channel.messages.lock().unwrap().as_slice(),
            &[("tg:2".to_string(), "Hello Alice".to_string())]
        );
        assert_eq!(run_count(tmp.path()), 4);
        let payloads = std::fs::read_to_string(tmp.path().join("stdin.log")).unwrap();
        let prompts: Vec<String> = payloads
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str::<ContainerInput>(l).unwrap().prompt)
            .collect();
        assert_eq!(prompts.len(), 4);
        assert!(prompts.iter().all(|p| p == &prompts[0] && p.contains("@Andy hi")));
        assert_eq!(ctx.inbox.len("tg:2"), 0);
        assert_eq!(ctx.queue.retry_count("tg:2").await, 0);
    }

    #[tokio::test]
    async fn six_failed_runs_exhaust_and_empty_the_inbox() {
        let tmp = TempDir::new().unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let runtime = flaky_runtime(tmp.path(), u32::MAX);
        let ctx = wired(&tmp, runtime, channel.clone(), fast_retries(Duration::from_secs(10))).await;

        ctx.inbox.push("tg:2", triggered("@Andy hi"));
        ctx.queue.enqueue_message_check("tg:2").await;

        let sent = channel.clone();
        assert!(wait_until(Duration::from_secs(15), move || !sent.messages.lock().unwrap().is_empty()).await);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let messages = channel.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("couldn't process"), "{}", messages[0].1);
        assert_eq!(run_count(tmp.path()), 6);
        assert_eq!(ctx.inbox.len("tg:2"), 0);
        assert!(!ctx.queue.is_active("tg:2").await);
    }

    #[tokio::test]
    async fn attempt_cut_off_by_queue_keeps_its_input() {
        let tmp = TempDir::new().unwrap();
        let stopped = tmp.path().join("stopped");
        let runtime = scripted_runtime(
            tmp.path(),
            &format!(
                "if [ \"$1\" = \"stop\" ]; then echo \"$2\" >> '{}'; exit 0; fi\nexec sleep 30",
                stopped.display()
            ),
        );
        let channel = Arc::new(RecordingChannel::default());
        let ctx = wired(&tmp, runtime, channel.clone(), fast_retries(Duration::from_millis(800))).await;

        ctx.inbox.push("tg:2", triggered("@Andy hi"));
        ctx.queue.enqueue_message_check("tg:2").await;

        let sent = channel.clone();
        assert!(wait_until(Duration::from_secs(20), move || !sent.messages.lock().unwrap().is_empty()).await);
        let messages = channel.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("couldn't process"));
        assert_eq!(ctx.inbox.len("tg:2"), 0);

        let stop_file = stopped.clone();
        assert!(wait_until(Duration::from_secs(5), move || stop_file.exists()).await);
        let stops = std::fs::read_to_string(&stopped).unwrap();
        assert!(stops.lines().all(|name| name.starts_with("hutch-family-")));
    }
}
