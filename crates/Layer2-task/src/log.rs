//! Log events and live event streams
//!
//! Provides:
//! - `LogEvent` - one line from a log destination
//! - `TailEvent` - what a live tail session yields (session start, batches)
//! - `LiveEventStream` - a live tail plus an optional history batch that is
//!   delivered before the first live event

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crun_foundation::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A single log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Provider event id, used to de-duplicate history against the live tail
    pub event_id: Option<String>,

    /// Provider-reported timestamp
    pub timestamp: DateTime<Utc>,

    /// Log content
    pub message: String,

    /// Log stream that produced the event
    pub source: String,
}

impl LogEvent {
    pub fn new(
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_id: None,
            timestamp,
            message: message.into(),
            source: source.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    /// Format for terminal display
    pub fn format_line(&self) -> String {
        format!("{} {}", self.timestamp.format("%H:%M:%S%.3f"), self.message)
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// One item of a live tail session
#[derive(Debug, Clone, PartialEq)]
pub enum TailEvent {
    /// Session registered; carries no log lines
    SessionStart { session_id: String },
    /// A batch of log lines in provider order
    Update(Vec<LogEvent>),
}

impl TailEvent {
    /// Log lines carried by this item (none for a session start)
    pub fn into_events(self) -> Vec<LogEvent> {
        match self {
            TailEvent::SessionStart { .. } => Vec::new(),
            TailEvent::Update(events) => events,
        }
    }
}

/// Releases the provider side of a live tail
#[async_trait]
pub trait StreamCloser: Send + Sync {
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl StreamCloser for CancellationToken {
    async fn close(&self) -> Result<()> {
        self.cancel();
        Ok(())
    }
}

/// A live tail on one log destination
pub struct LiveEventStream {
    source: String,
    backlog: VecDeque<TailEvent>,
    seen: HashSet<String>,
    events: mpsc::Receiver<Result<TailEvent>>,
    closer: Arc<dyn StreamCloser>,
}

impl LiveEventStream {
    pub fn new(
        source: impl Into<String>,
        events: mpsc::Receiver<Result<TailEvent>>,
        closer: Arc<dyn StreamCloser>,
    ) -> Self {
        Self {
            source: source.into(),
            backlog: VecDeque::new(),
            seen: HashSet::new(),
            events,
            closer,
        }
    }

    /// Queue a history batch ahead of every live event.
    ///
    /// Live events whose id appears in the batch are dropped when they arrive.
    pub fn with_backfill(mut self, history: Vec<LogEvent>) -> Self {
        if history.is_empty() {
            return self;
        }
        self.seen
            .extend(history.iter().filter_map(|e| e.event_id.clone()));
        self.backlog.push_front(TailEvent::Update(history));
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn closer(&self) -> Arc<dyn StreamCloser> {
        Arc::clone(&self.closer)
    }

    /// Next item, or `None` once the provider ended the session.
    ///
    /// Cancel safe: nothing is lost if the future is dropped while waiting.
    pub async fn recv(&mut self) -> Option<Result<TailEvent>> {
        if let Some(queued) = self.backlog.pop_front() {
            return Some(Ok(queued));
        }

        loop {
            let item = self.events.recv().await?;
            match item {
                Ok(TailEvent::Update(batch)) if !self.seen.is_empty() => {
                    let fresh: Vec<LogEvent> = batch
                        .into_iter()
                        .filter(|e| match &e.event_id {
                            Some(id) => !self.seen.contains(id),
                            None => true,
                        })
                        .collect();
                    if fresh.is_empty() {
                        continue;
                    }
                    return Some(Ok(TailEvent::Update(fresh)));
                }
                other => return Some(other),
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.closer.close().await
    }
}

impl fmt::Debug for LiveEventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveEventStream")
            .field("source", &self.source)
            .field("backlog", &self.backlog.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, message: &str) -> LogEvent {
        LogEvent::new("crun/main/abc", Utc::now(), message).with_id(id)
    }

    #[tokio::test]
    async fn test_backfill_precedes_live_and_is_deduplicated() {
        let (tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let mut stream = LiveEventStream::new("group", rx, Arc::new(token.clone()))
            .with_backfill(vec![event("1", "one"), event("2", "two")]);

        tx.send(Ok(TailEvent::SessionStart {
            session_id: "s".into(),
        }))
        .await
        .unwrap();
        tx.send(Ok(TailEvent::Update(vec![event("2", "two")])))
            .await
            .unwrap();
        tx.send(Ok(TailEvent::Update(vec![event("2", "two"), event("3", "three")])))
            .await
            .unwrap();
        drop(tx);

        let first = stream.recv().await.unwrap().unwrap().into_events();
        assert_eq!(
            first.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(),
            ["one", "two"]
        );

        assert!(matches!(
            stream.recv().await.unwrap().unwrap(),
            TailEvent::SessionStart { .. }
        ));

        // the duplicate-only batch is skipped entirely
        let third = stream.recv().await.unwrap().unwrap().into_events();
        assert_eq!(
            third.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(),
            ["three"]
        );

        assert!(stream.recv().await.is_none());

        stream.close().await.unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_format_line() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T12:30:45.120Z")
            .unwrap()
            .with_timezone(&Utc);
        let line = LogEvent::new("s", ts, "hello").format_line();
        assert_eq!(line, "12:30:45.120 hello");
    }
}
