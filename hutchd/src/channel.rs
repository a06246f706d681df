//! Outbound delivery to channel adapters.
//!
//! hutchd does not speak any chat protocol itself. Agent replies, failure
//! notices and typing indicators are handed to a `ChannelSink`; in production
//! that is an HTTP callback into the adapter process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

pub type SinkFuture<'a> = BoxFuture<'a, anyhow::Result<()>>;

pub trait ChannelSink: Send + Sync {
    fn send_message<'a>(&'a self, jid: &'a str, text: &'a str) -> SinkFuture<'a>;

    fn set_typing<'a>(&'a self, jid: &'a str, typing: bool) -> SinkFuture<'a>;
}

pub type SharedSink = Arc<dyn ChannelSink>;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Message { jid: &'a str, text: &'a str },
    Typing { jid: &'a str, typing: bool },
}

/// Posts JSON events to the adapter's callback URL.
#[derive(Clone)]
pub struct HttpChannel {
    client: Client,
    callback_url: String,
}

impl HttpChannel {
    pub fn new(callback_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build channel HTTP client")?;
        Ok(Self {
            client,
            callback_url: callback_url.into(),
        })
    }

    async fn post(&self, event: Outbound<'_>) -> anyhow::Result<()> {
        self.client
            .post(&self.callback_url)
            .json(&event)
            .send()
            .await
            .context("failed to call channel callback")?
            .error_for_status()
            .context("channel callback rejected event")?;
        Ok(())
    }
}

impl ChannelSink for HttpChannel {
    fn send_message<'a>(&'a self, jid: &'a str, text: &'a str) -> SinkFuture<'a> {
        Box::pin(async move {
            if text.trim().is_empty() {
                debug!(jid, "skipping empty outbound message");
                return Ok(());
            }
            self.post(Outbound::Message { jid, text }).await
        })
    }

    fn set_typing<'a>(&'a self, jid: &'a str, typing: bool) -> SinkFuture<'a> {
        Box::pin(async move { self.post(Outbound::Typing { jid, typing }).await })
    }
}

/// Used when no callback URL is configured.
#[derive(Debug, Clone, Default)]
pub struct LogChannel;

impl ChannelSink for LogChannel {
    fn send_message<'a>(&'a self, jid: &'a str, text: &'a str) -> SinkFuture<'a> {
        Box::pin(async move {
            info!(jid, chars = text.chars().count(), "outbound message (no channel configured)");
            debug!(jid, "{}", text);
            Ok(())
        })
    }

    fn set_typing<'a>(&'a self, jid: &'a str, typing: bool) -> SinkFuture<'a> {
        Box::pin(async move {
            debug!(jid, typing, "typing indicator (no channel configured)");
            Ok(())
        })
    }
}

pub fn sink_from_config(callback_url: Option<&str>) -> anyhow::Result<SharedSink> {
    match callback_url {
        Some(url) => Ok(Arc::new(HttpChannel::new(url)?)),
        None => Ok(Arc::new(LogChannel)),
    }
}

/// Records everything it is asked to send.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingChannel {
    pub messages: std::sync::Mutex<Vec<(String, String)>>,
    pub typing: std::sync::Mutex<Vec<(String, bool)>>,
}

#[cfg(test)]
impl ChannelSink for RecordingChannel {
    fn send_message<'a>(&'a self, jid: &'a str, text: &'a str) -> SinkFuture<'a> {
        self.messages
            .lock()
            .unwrap()
            .push((jid.to_string(), text.to_string()));
        Box::pin(async { Ok(()) })
    }

    fn set_typing<'a>(&'a self, jid: &'a str, typing: bool) -> SinkFuture<'a> {
        self.typing.lock().unwrap().push((jid.to_string(), typing));
        Box::pin(async { Ok(()) })
    }
}
