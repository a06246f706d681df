//! Per-group buffer of work waiting for the next processing attempt.
//!
//! Channel messages and fired scheduled tasks land here; the queue only
//! learns that a group has something to do. Tasks are taken one at a time
//! ahead of chat. Chat messages are taken as one batch, but only once at
//! least one of them was addressed to the assistant. A batch whose attempt
//! failed is held aside and handed back unchanged on the next take.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use hutch_core::model::ContextMode;
use regex::Regex;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
    /// Addressed to the assistant (or the group needs no trigger).
    pub triggered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRun {
    pub task_id: String,
    pub prompt: String,
    pub context_mode: ContextMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundItem {
    Chat(ChatMessage),
    Task(TaskRun),
}

/// Work handed to one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch {
    Chat(Vec<ChatMessage>),
    Task(TaskRun),
}

impl Batch {
    pub fn item_count(&self) -> usize {
        match self {
            Batch::Chat(messages) => messages.len(),
            Batch::Task(_) => 1,
        }
    }
}

/// Chat messages kept per group before the oldest context is dropped.
pub const DEFAULT_MESSAGE_LIMIT: usize = 100;

#[derive(Default)]
struct GroupInbox {
    /// Batch from a failed attempt, handed back unchanged on the next take.
    held: Option<Batch>,
    items: VecDeque<InboundItem>,
}

impl GroupInbox {
    fn is_empty(&self) -> bool {
        self.held.is_none() && self.items.is_empty()
    }

    /// Drop the oldest chat message, preferring untriggered context.
    fn drop_oldest_chat(&mut self) -> Option<ChatMessage> {
        let pos = self
            .items
            .iter()
            .position(|item| matches!(item, InboundItem::Chat(m) if !m.triggered))
            .or_else(|| {
                self.items
                    .iter()
                    .position(|item| matches!(item, InboundItem::Chat(_)))
            })?;
        match self.items.remove(pos) {
            Some(InboundItem::Chat(m)) => Some(m),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Inbox {
    groups: Arc<Mutex<HashMap<String, GroupInbox>>>,
    message_limit: usize,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MESSAGE_LIMIT)
    }
}

impl Inbox {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(message_limit: usize) -> Self {
        Self {
            groups: Arc::default(),
            message_limit: message_limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, GroupInbox>> {
        // A poisoned map still holds consistent queues; keep serving it.
        self.groups.lock().unwrap_or_else(|poisoned| {
            warn!("inbox lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn push(&self, jid: &str, item: InboundItem) {
        let mut map = self.lock();
        let group = map.entry(jid.to_string()).or_default();
        group.items.push_back(item);

        let chats = group
            .items
            .iter()
            .filter(|item| matches!(item, InboundItem::Chat(_)))
            .count();
        if chats > self.message_limit {
            if let Some(dropped) = group.drop_oldest_chat() {
                debug!(
                    group_jid = jid,
                    limit = self.message_limit,
                    timestamp = %dropped.timestamp,
                    "message buffer full, oldest message dropped"
                );
            }
        }
    }

    /// Whether a processing attempt would find anything to do.
    pub fn has_actionable(&self, jid: &str) -> bool {
        self.lock().get(jid).is_some_and(|group| {
            group.held.is_some()
                || group.items.iter().any(|item| match item {
                    InboundItem::Task(_) => true,
                    InboundItem::Chat(m) => m.triggered,
                })
        })
    }

    pub fn len(&self, jid: &str) -> usize {
        self.lock().get(jid).map_or(0, |group| {
            group.items.len() + group.held.as_ref().map_or(0, Batch::item_count)
        })
    }

    pub fn take_batch(&self, jid: &str) -> Option<Batch> {
        let mut map = self.lock();
        let group = map.get_mut(jid)?;
        let batch = take_from(group);
        if group.is_empty() {
            map.remove(jid);
        }
        batch
    }

    /// Park the batch of a failed attempt; the next take returns it as is.
    pub fn hold_failed(&self, jid: &str, batch: Batch) {
        let mut map = self.lock();
        let group = map.entry(jid.to_string()).or_default();
        if let Some(previous) = group.held.replace(batch) {
            warn!(group_jid = jid, "failed batch already held, older one returned to the queue");
            match previous {
                Batch::Task(task) => group.items.push_front(InboundItem::Task(task)),
                Batch::Chat(messages) => {
                    for message in messages.into_iter().rev() {
                        group.items.push_front(InboundItem::Chat(message));
                    }
                }
            }
        }
    }

    /// Discard the held failed batch. Returns how many items it carried.
    pub fn drop_failed(&self, jid: &str) -> usize {
        let mut map = self.lock();
        let Some(group) = map.get_mut(jid) else {
            return 0;
        };
        let dropped = group.held.take().map_or(0, |batch| batch.item_count());
        if group.is_empty() {
            map.remove(jid);
        }
        dropped
    }

    /// Drop everything buffered for `jid`. Returns how many items were dropped.
    pub fn clear(&self, jid: &str) -> usize {
        self.lock().remove(jid).map_or(0, |group| {
            group.items.len() + group.held.as_ref().map_or(0, Batch::item_count)
        })
    }
}

fn take_from(group: &mut GroupInbox) -> Option<Batch> {
    if let Some(batch) = group.held.take() {
        return Some(batch);
    }

    let items = &mut group.items;
    if let Some(pos) = items
        .iter()
        .position(|item| matches!(item, InboundItem::Task(_)))
    {
        if let Some(InboundItem::Task(task)) = items.remove(pos) {
            return Some(Batch::Task(task));
        }
    }

    let triggered = items
        .iter()
        .any(|item| matches!(item, InboundItem::Chat(m) if m.triggered));
    if !triggered {
        return None;
    }

    let messages = items
        .drain(..)
        .filter_map(|item| match item {
            InboundItem::Chat(m) => Some(m),
            InboundItem::Task(_) => None,
        })
        .collect();
    Some(Batch::Chat(messages))
}

/// Build the trigger matcher for a group: the configured trigger or
/// `@assistant`, case-insensitive, at the start of the message.
pub fn trigger_regex(trigger: &str, assistant_name: &str) -> Option<Regex> {
    let assistant = regex::escape(assistant_name);
    let trigger = trigger.trim();
    let pattern = if trigger.is_empty() {
        format!(r"(?i)^\s*@{assistant}\b")
    } else {
        format!(r"(?i)^\s*(?:{}|@{assistant})\b", regex::escape(trigger))
    };
    match Regex::new(&pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(trigger, error = %e, "invalid trigger pattern");
            None
        }
    }
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render a chat batch as the agent prompt.
pub fn format_messages(messages: &[ChatMessage]) -> String {
    let body = messages
        .iter()
        .map(|m| {
            format!(
                "<message sender=\"{}\" time=\"{}\">{}</message>",
                escape_xml(&m.sender_name),
                escape_xml(&m.timestamp),
                escape_xml(&m.content)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("<messages>\n{body}\n</messages>")
}
