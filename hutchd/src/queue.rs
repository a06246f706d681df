//! Per-group admission queue with a global concurrency cap.
//!
//! Key semantics:
//! - at most one processing attempt per group at any instant
//! - checks that arrive while a group is busy coalesce into one follow-up
//! - failures retry on a fixed backoff table, then exhaust exactly once
//! - groups waiting for a slot are dispatched first-in, first-out

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use hutch_core::config::OrchestratorConfig;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Processes a group's pending work. Returns true on success.
pub type ProcessMessagesFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Called once when a group runs out of retries.
pub type ExhaustionFn =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_concurrent: usize,
    /// Delay before retry N is `retry_backoff[N - 1]`.
    pub retry_backoff: Vec<Duration>,
    pub max_invocation: Duration,
}

impl QueueSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_containers.max(1),
            retry_backoff: config
                .retry_backoff_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            max_invocation: Duration::from_millis(config.max_invocation_ms),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

#[derive(Default)]
struct GroupState {
    active: bool,
    /// Failed and waiting on a backoff timer; blocks new dispatch.
    retry_pending: bool,
    pending_messages: bool,
    retry_count: u32,
    retry_timer: Option<JoinHandle<()>>,
}

struct Inner {
    groups: HashMap<String, GroupState>,
    active_count: usize,
    waiting_groups: VecDeque<String>,
    settings: QueueSettings,
    process_messages_fn: Option<ProcessMessagesFn>,
    on_exhaustion_fn: Option<ExhaustionFn>,
    shutting_down: bool,
}

impl Inner {
    fn get_or_insert(&mut self, jid: &str) -> &mut GroupState {
        self.groups.entry(jid.to_string()).or_default()
    }

    /// Start an attempt for `jid` or park it until a slot frees up.
    fn dispatch_or_wait(&mut self, queue: &Arc<Mutex<Inner>>, jid: &str) {
        if self.active_count >= self.settings.max_concurrent {
            if !self.waiting_groups.iter().any(|w| w == jid) {
                self.waiting_groups.push_back(jid.to_string());
            }
            debug!(
                group_jid = jid,
                active_count = self.active_count,
                "at concurrency limit, group waiting"
            );
            return;
        }

        let state = self.get_or_insert(jid);
        state.active = true;
        state.pending_messages = false;
        self.active_count += 1;

        let queue = queue.clone();
        let jid = jid.to_string();
        tokio::spawn(async move {
            run_for_group(queue, jid).await;
        });
    }

    /// End the group's attempt, re-dispatch it if work arrived meanwhile and
    /// hand the freed slot to the waiting line.
    fn release(&mut self, queue: &Arc<Mutex<Inner>>, jid: &str) {
        self.active_count = self.active_count.saturating_sub(1);
        let shutting_down = self.shutting_down;
        let state = self.get_or_insert(jid);
        state.active = false;
        let redispatch = state.pending_messages && !state.retry_pending && !shutting_down;

        if redispatch {
            debug!(group_jid = jid, "pending work arrived during attempt, re-dispatching");
            self.dispatch_or_wait(queue, jid);
        }
        if !shutting_down {
            self.drain_waiting(queue);
        }
    }

    /// Fill free slots from the waiting line.
    fn drain_waiting(&mut self, queue: &Arc<Mutex<Inner>>) {
        while self.active_count < self.settings.max_concurrent {
            let Some(jid) = self.waiting_groups.pop_front() else {
                break;
            };
            let runnable = self
                .groups
                .get(&jid)
                .is_some_and(|s| s.pending_messages && !s.active && !s.retry_pending);
            if runnable {
                self.dispatch_or_wait(queue, &jid);
            }
        }
    }
}

/// Point-in-time view of one group's queue state.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub jid: String,
    pub active: bool,
    pub retry_pending: bool,
    pub pending_messages: bool,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub active_count: usize,
    pub max_concurrent: usize,
    pub waiting: Vec<String>,
    pub groups: Vec<GroupSnapshot>,
}

/// Group queue managing per-group serialization and global concurrency.
#[derive(Clone)]
pub struct GroupQueue {
    inner: Arc<Mutex<Inner>>,
}

impl GroupQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                groups: HashMap::new(),
                active_count: 0,
                waiting_groups: VecDeque::new(),
                settings,
                process_messages_fn: None,
                on_exhaustion_fn: None,
                shutting_down: false,
            })),
        }
    }

    pub async fn set_process_messages_fn(&self, f: ProcessMessagesFn) {
        self.inner.lock().await.process_messages_fn = Some(f);
    }

    pub async fn set_on_exhaustion_fn(&self, f: ExhaustionFn) {
        self.inner.lock().await.on_exhaustion_fn = Some(f);
    }

    /// Ask the queue to check `group_jid` for new work.
    pub async fn enqueue_message_check(&self, group_jid: &str) {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return;
        }

        let state = inner.get_or_insert(group_jid);
        state.pending_messages = true;

        if state.active {
            debug!(group_jid, "group active, check coalesced");
            return;
        }
        if state.retry_pending {
            debug!(group_jid, "group waiting on retry, check coalesced");
            return;
        }

        inner.dispatch_or_wait(&self.inner, group_jid);
    }

    #[cfg(test)]
    pub async fn is_active(&self, group_jid: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.groups.get(group_jid).is_some_and(|s| s.active)
    }

    #[cfg(test)]
    pub async fn retry_count(&self, group_jid: &str) -> u32 {
        let inner = self.inner.lock().await;
        inner.groups.get(group_jid).map_or(0, |s| s.retry_count)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active_count
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock().await;
        let mut groups: Vec<GroupSnapshot> = inner
            .groups
            .iter()
            .map(|(jid, s)| GroupSnapshot {
                jid: jid.clone(),
                active: s.active,
                retry_pending: s.retry_pending,
                pending_messages: s.pending_messages,
                retry_count: s.retry_count,
            })
            .collect();
        groups.sort_by(|a, b| a.jid.cmp(&b.jid));
        QueueSnapshot {
            active_count: inner.active_count,
            max_concurrent: inner.settings.max_concurrent,
            waiting: inner.waiting_groups.iter().cloned().collect(),
            groups,
        }
    }

    /// Stop admitting work and cancel pending retry timers. Running attempts
    /// are left to finish.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.shutting_down = true;
        let mut cancelled = 0;
        for state in inner.groups.values_mut() {
            if let Some(timer) = state.retry_timer.take() {
                timer.abort();
                cancelled += 1;
            }
        }
        info!(
            active_count = inner.active_count,
            cancelled_retries = cancelled,
            "group queue shutting down"
        );
    }
}

async fn run_for_group(queue: Arc<Mutex<Inner>>, group_jid: String) {
    debug!(group_jid = group_jid.as_str(), "starting processing attempt");

    let (process_fn, max_invocation) = {
        let inner = queue.lock().await;
        (
            inner.process_messages_fn.clone(),
            inner.settings.max_invocation,
        )
    };

    let success = match process_fn {
        Some(f) => {
            // Own task so a panic surfaces as a JoinError instead of unwinding here.
            let mut attempt = tokio::spawn(f(group_jid.clone()));
            match tokio::time::timeout(max_invocation, &mut attempt).await {
                Ok(Ok(ok)) => ok,
                Ok(Err(e)) => {
                    error!(group_jid = group_jid.as_str(), error = %e, "processing attempt panicked");
                    false
                }
                Err(_) => {
                    attempt.abort();
                    // Wait for the abort so the attempt's drop handlers have run
                    // before the retry is scheduled.
                    let _ = attempt.await;
                    error!(
                        group_jid = group_jid.as_str(),
                        max_invocation_ms = max_invocation.as_millis() as u64,
                        "processing attempt exceeded max invocation time"
                    );
                    false
                }
            }
        }
        None => {
            warn!(group_jid = group_jid.as_str(), "no process_messages_fn set");
            false
        }
    };

    if let Finished::Exhausted(on_exhaustion) = finish_attempt(&queue, &group_jid, success).await {
        // The group still holds its slot here, so checks arriving while the
        // callback runs coalesce instead of racing it.
        if let Some(on_exhaustion) = on_exhaustion {
            on_exhaustion(group_jid.clone()).await;
        }
        release_slot(&queue, &group_jid).await;
    }
}

enum Finished {
    Released,
    /// Retry budget used up. The group stays active until `release_slot`.
    Exhausted(Option<ExhaustionFn>),
}

/// Record the outcome of an attempt.
async fn finish_attempt(queue: &Arc<Mutex<Inner>>, group_jid: &str, success: bool) -> Finished {
    let mut inner = queue.lock().await;
    let shutting_down = inner.shutting_down;
    let backoff = inner.settings.retry_backoff.clone();
    let on_exhaustion = inner.on_exhaustion_fn.clone();

    let state = inner.get_or_insert(group_jid);
    if success {
        state.retry_count = 0;
    } else {
        state.retry_count += 1;
        let retry_count = state.retry_count;

        match backoff.get(retry_count as usize - 1).copied() {
            Some(delay) if !shutting_down => {
                info!(
                    group_jid,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling retry with backoff"
                );
                state.retry_pending = true;
                state.retry_timer = Some(spawn_retry_timer(queue.clone(), group_jid, delay));
            }
            Some(_) => {}
            None => {
                error!(
                    group_jid,
                    retry_count,
                    "retries exhausted, dropping pending work"
                );
                state.pending_messages = false;
                state.retry_count = 0;
                if on_exhaustion.is_none() {
                    warn!(group_jid, "no exhaustion callback set");
                }
                return Finished::Exhausted(on_exhaustion);
            }
        }
    }

    inner.release(queue, group_jid);
    Finished::Released
}

async fn release_slot(queue: &Arc<Mutex<Inner>>, group_jid: &str) {
    queue.lock().await.release(queue, group_jid);
}

fn spawn_retry_timer(queue: Arc<Mutex<Inner>>, group_jid: &str, delay: Duration) -> JoinHandle<()> {
    let jid = group_jid.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut inner = queue.lock().await;
        if inner.shutting_down {
            return;
        }
        let state = inner.get_or_insert(&jid);
        state.retry_timer = None;
        state.retry_pending = false;
        state.pending_messages = true;
        if !state.active {
            debug!(group_jid = jid.as_str(), "retry timer fired");
            inner.dispatch_or_wait(&queue, &jid);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::{Instant, sleep};

    fn settings(max_concurrent: usize) -> QueueSettings {
        QueueSettings {
            max_concurrent,
            ..QueueSettings::default()
        }
    }

    /// Process fn that records call times and returns `succeed`.
    fn recording_fn(
        calls: Arc<StdMutex<Vec<Instant>>>,
        succeed: Arc<AtomicBool>,
    ) -> ProcessMessagesFn {
        Arc::new(move |_jid: String| {
            let calls = calls.clone();
            let succeed = succeed.clone();
            Box::pin(async move {
                calls.lock().unwrap().push(Instant::now());
                succeed.load(Ordering::SeqCst)
            })
        })
    }

    fn counting_exhaustion(count: Arc<AtomicUsize>) -> ExhaustionFn {
        Arc::new(move |_jid: String| {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn new_queue_has_zero_active() {
        let q = GroupQueue::new(settings(3));
        assert_eq!(q.active_count().await, 0);
        assert!(!q.is_active("tg:unknown").await);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_after_six_failures_with_backoff_sequence() {
        let q = GroupQueue::new(settings(3));
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let succeed = Arc::new(AtomicBool::new(false));
        let exhaustions = Arc::new(AtomicUsize::new(0));
        q.set_process_messages_fn(recording_fn(calls.clone(), succeed.clone()))
            .await;
        q.set_on_exhaustion_fn(counting_exhaustion(exhaustions.clone()))
            .await;

        q.enqueue_message_check("tg:1").await;
        sleep(Duration::from_secs(200)).await;

        let times = calls.lock().unwrap().clone();
        assert_eq!(times.len(), 6);
        let gaps: Vec<u64> = times
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![5, 10, 20, 40, 80]);
        assert_eq!(exhaustions.load(Ordering::SeqCst), 1);
        assert_eq!(q.retry_count("tg:1").await, 0);
        assert!(!q.is_active("tg:1").await);

        // No stale timer fires after exhaustion.
        sleep(Duration::from_secs(3600)).await;
        assert_eq!(calls.lock().unwrap().len(), 6);
        assert_eq!(exhaustions.load(Ordering::SeqCst), 1);

        // A fresh check after exhaustion starts from zero and succeeds.
        succeed.store(true, Ordering::SeqCst);
        q.enqueue_message_check("tg:1").await;
        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.lock().unwrap().len(), 7);
        assert_eq!(q.retry_count("tg:1").await, 0);
        assert_eq!(exhaustions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn check_during_exhaustion_callback_waits_for_it() {
        let q = GroupQueue::new(settings(3));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        q.set_process_messages_fn(Arc::new(move |_jid: String| {
            let counter = counter.clone();
            Box::pin(async move { counter.fetch_add(1, Ordering::SeqCst) >= 6 })
        }))
        .await;
        let notified = Arc::new(AtomicBool::new(false));
        let flag = notified.clone();
        q.set_on_exhaustion_fn(Arc::new(move |_jid: String| {
            let flag = flag.clone();
            Box::pin(async move {
                sleep(Duration::from_secs(10)).await;
                flag.store(true, Ordering::SeqCst);
            })
        }))
        .await;

        // Six failures end at t=155s; the callback then runs until t=165s.
        q.enqueue_message_check("tg:1").await;
        sleep(Duration::from_secs(158)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert!(q.is_active("tg:1").await);

        q.enqueue_message_check("tg:1").await;
        sleep(Duration::from_secs(1)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert!(!notified.load(Ordering::SeqCst));

        sleep(Duration::from_secs(10)).await;
        assert!(notified.load(Ordering::SeqCst));
        assert_eq!(attempts.load(Ordering::SeqCst), 7);
        assert!(!q.is_active("tg:1").await);
        assert_eq!(q.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_retry_resets_count() {
        let q = GroupQueue::new(settings(3));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        q.set_process_messages_fn(Arc::new(move |_jid: String| {
            let counter = counter.clone();
            Box::pin(async move { counter.fetch_add(1, Ordering::SeqCst) >= 1 })
        }))
        .await;

        q.enqueue_message_check("tg:1").await;
        sleep(Duration::from_secs(1)).await;
        assert_eq!(q.retry_count("tg:1").await, 1);

        // Checks during the backoff window are held until the timer fires.
        q.enqueue_message_check("tg:1").await;
        sleep(Duration::from_secs(1)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(q.retry_count("tg:1").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn checks_during_active_attempt_coalesce_into_one_follow_up() {
        let q = GroupQueue::new(settings(3));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        q.set_process_messages_fn(Arc::new(move |_jid: String| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_secs(10)).await;
                true
            })
        }))
        .await;

        q.enqueue_message_check("tg:1").await;
        sleep(Duration::from_secs(1)).await;
        assert!(q.is_active("tg:1").await);

        for _ in 0..3 {
            q.enqueue_message_check("tg:1").await;
        }
        sleep(Duration::from_secs(60)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!q.is_active("tg:1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn global_cap_holds_third_group_until_slot_frees() {
        let q = GroupQueue::new(settings(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        q.set_process_messages_fn(Arc::new(move |_jid: String| {
            let (r, p) = (r.clone(), p.clone());
            Box::pin(async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_secs(10)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                true
            })
        }))
        .await;

        q.enqueue_message_check("tg:a").await;
        q.enqueue_message_check("tg:b").await;
        q.enqueue_message_check("tg:c").await;
        sleep(Duration::from_secs(1)).await;

        assert_eq!(q.active_count().await, 2);
        assert!(q.is_active("tg:a").await);
        assert!(q.is_active("tg:b").await);
        assert!(!q.is_active("tg:c").await);
        assert_eq!(q.snapshot().await.waiting, vec!["tg:c".to_string()]);

        sleep(Duration::from_secs(10)).await;
        assert!(q.is_active("tg:c").await);

        sleep(Duration::from_secs(20)).await;
        assert_eq!(q.active_count().await, 0);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_counts_as_failure() {
        let q = GroupQueue::new(QueueSettings {
            max_invocation: Duration::from_secs(30),
            ..settings(3)
        });
        q.set_process_messages_fn(Arc::new(|_jid: String| {
            Box::pin(async move {
                std::future::pending::<()>().await;
                true
            })
        }))
        .await;

        q.enqueue_message_check("tg:1").await;
        sleep(Duration::from_secs(31)).await;

        assert!(!q.is_active("tg:1").await);
        assert_eq!(q.retry_count("tg:1").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_attempt_counts_as_failure() {
        let q = GroupQueue::new(settings(3));
        fn explode() -> bool {
            panic!("processing blew up")
        }
        q.set_process_messages_fn(Arc::new(|_jid: String| Box::pin(async move { explode() })))
            .await;

        q.enqueue_message_check("tg:1").await;
        sleep(Duration::from_secs(1)).await;

        assert!(!q.is_active("tg:1").await);
        assert_eq!(q.retry_count("tg:1").await, 1);
        assert_eq!(q.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_admission_and_retries() {
        let q = GroupQueue::new(settings(3));
        let calls = Arc::new(StdMutex::new(Vec::new()));
        q.set_process_messages_fn(recording_fn(calls.clone(), Arc::new(AtomicBool::new(false))))
            .await;

        q.enqueue_message_check("tg:1").await;
        sleep(Duration::from_secs(1)).await;
        q.shutdown().await;
        sleep(Duration::from_secs(600)).await;
        q.enqueue_message_check("tg:2").await;
        sleep(Duration::from_secs(1)).await;

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(!q.is_active("tg:2").await);
    }
}
