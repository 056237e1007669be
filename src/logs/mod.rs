pub mod websocket;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tokio::sync::broadcast;
use tracing::{debug, trace};

const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    /// Text produced by the agent
    Response,
    Error,
    Git,
    File,
    Validation,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Response => "response",
            LogLevel::Error => "error",
            LogLevel::Git => "git",
            LogLevel::File => "file",
            LogLevel::Validation => "validation",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of session progress. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(skip)]
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Per-session fan-out of log lines to live subscribers.
///
/// Delivery is at-most-once with no replay: a subscriber only sees events
/// sent after it subscribed, and a subscriber that falls more than the
/// channel capacity behind skips the overflow.
#[derive(Clone, Default)]
pub struct LogBroadcaster {
    channels: Arc<DashMap<String, broadcast::Sender<LogEvent>>>,
}

impl LogBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<LogEvent> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn send(&self, session_id: &str, level: LogLevel, message: impl Into<String>) {
        let event = LogEvent {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        debug!(session_id = %session_id, level = %level, "{}", event.message);

        let Some(sender) = self.channels.get(session_id).map(|s| s.clone()) else {
            return;
        };
        if let Err(e) = sender.send(event) {
            trace!("Log broadcast for session {} had no receivers: {}", session_id, e);
            // Drop the channel only if nobody subscribed in the meantime
            self.channels
                .remove_if(session_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn info(&self, session_id: &str, message: impl Into<String>) {
        self.send(session_id, LogLevel::Info, message);
    }

    pub fn error(&self, session_id: &str, message: impl Into<String>) {
        self.send(session_id, LogLevel::Error, message);
    }

    /// Drop the session's channel once its last subscriber has gone.
    pub fn release(&self, session_id: &str) {
        if self
            .channels
            .remove_if(session_id, |_, sender| sender.receiver_count() == 0)
            .is_some()
        {
            trace!("Released log channel for session {}", session_id);
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels
            .get(session_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}
