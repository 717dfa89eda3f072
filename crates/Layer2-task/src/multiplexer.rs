//! Log stream multiplexer
//!
//! Merges the live tails of several log destinations into one channel. Each
//! destination gets one task that opens it, retries while it does not exist
//! yet and then forwards its events in provider order. Nothing is sent on
//! the output channels after `close` starts, and `close` returns only once
//! every task has exited.

use crate::log::{LogEvent, StreamCloser, TailEvent};
use crate::source::{LogDestination, LogSource};
use chrono::Utc;
use crun_foundation::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Output channel capacity
const EVENT_BUFFER: usize = 256;

/// Lifecycle of one watched destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Waiting for the destination to exist
    Pending,
    /// Forwarding events
    Active,
    /// Shut down or abandoned after an error
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamState::Pending => "pending",
            StreamState::Active => "active",
            StreamState::Closed => "closed",
        })
    }
}

struct SourceEntry {
    destination: LogDestination,
    state: StreamState,
    closer: Option<Arc<dyn StreamCloser>>,
}

/// State shared with the per-destination tasks
struct Shared {
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sources: Mutex<Vec<SourceEntry>>,
    events_tx: Mutex<Option<mpsc::Sender<LogEvent>>>,
    errs_tx: Mutex<Option<mpsc::UnboundedSender<Error>>>,
}

impl Shared {
    fn activate(&self, index: usize, closer: Arc<dyn StreamCloser>) {
        let mut sources = self.sources.lock();
        if let Some(entry) = sources.get_mut(index) {
            entry.closer = Some(closer);
            if entry.state == StreamState::Pending {
                entry.state = StreamState::Active;
            }
        }
    }

    fn abandon(&self, index: usize) {
        if let Some(entry) = self.sources.lock().get_mut(index) {
            entry.state = StreamState::Closed;
        }
    }
}

/// Merges live tails from a `LogSource`
pub struct StreamMultiplexer<L: LogSource + 'static> {
    source: Arc<L>,
    retry_interval: Duration,
    shared: Arc<Shared>,
    events_rx: Mutex<Option<mpsc::Receiver<LogEvent>>>,
    errs_rx: Mutex<Option<mpsc::UnboundedReceiver<Error>>>,
}

impl<L: LogSource + 'static> StreamMultiplexer<L> {
    pub fn new(source: Arc<L>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (errs_tx, errs_rx) = mpsc::unbounded_channel();
        Self {
            source,
            retry_interval: Duration::from_secs(1),
            shared: Arc::new(Shared {
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                sources: Mutex::new(Vec::new()),
                events_tx: Mutex::new(Some(events_tx)),
                errs_tx: Mutex::new(Some(errs_tx)),
            }),
            events_rx: Mutex::new(Some(events_rx)),
            errs_rx: Mutex::new(Some(errs_rx)),
        }
    }

    /// Tick for retrying destinations that do not exist yet
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Merged events; `None` once taken. Closed after `close` returns.
    pub fn take_events(&self) -> Option<mpsc::Receiver<LogEvent>> {
        self.events_rx.lock().take()
    }

    /// Per-destination errors; `None` once taken. Closed after `close` returns.
    pub fn take_errs(&self) -> Option<mpsc::UnboundedReceiver<Error>> {
        self.errs_rx.lock().take()
    }

    /// Current state of every destination, in the order they were added
    pub fn states(&self) -> Vec<(LogDestination, StreamState)> {
        self.shared
            .sources
            .lock()
            .iter()
            .map(|s| (s.destination.clone(), s.state))
            .collect()
    }

    /// Start watching `destination`.
    ///
    /// Fails with `Error::Cancelled` once the multiplexer is closing.
    pub fn add(&self, destination: LogDestination) -> Result<()> {
        // Checked under the task lock so `close` cannot miss this task
        let mut tasks = self.shared.tasks.lock();
        if self.shared.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (events_tx, errs_tx) = match (
            self.shared.events_tx.lock().clone(),
            self.shared.errs_tx.lock().clone(),
        ) {
            (Some(events), Some(errs)) => (events, errs),
            _ => return Err(Error::Cancelled),
        };

        let index = {
            let mut sources = self.shared.sources.lock();
            sources.push(SourceEntry {
                destination: destination.clone(),
                state: StreamState::Pending,
                closer: None,
            });
            sources.len() - 1
        };

        let watcher = Watcher {
            source: Arc::clone(&self.source),
            shared: Arc::clone(&self.shared),
            retry_interval: self.retry_interval,
            index,
            destination,
            events_tx,
            errs_tx,
        };
        tasks.push(tokio::spawn(watcher.run()));
        Ok(())
    }

    /// Stop every task, close the output channels, then close every live tail.
    ///
    /// Close errors of the individual tails are joined into one.
    pub async fn close(&self) -> Result<()> {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.shared.tasks.lock();
            self.shared.cancel.cancel();
            tasks.drain(..).collect()
        };
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("log forwarding task failed: {}", err);
            }
        }

        // Every sender clone died with its task; dropping these closes the channels
        self.shared.events_tx.lock().take();
        self.shared.errs_tx.lock().take();

        let closers: Vec<Arc<dyn StreamCloser>> = {
            let mut sources = self.shared.sources.lock();
            sources
                .iter_mut()
                .filter_map(|entry| {
                    entry.state = StreamState::Closed;
                    entry.closer.take()
                })
                .collect()
        };

        let mut errors = Vec::new();
        for closer in closers {
            if let Err(err) = closer.close().await {
                errors.push(err);
            }
        }
        match Error::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<L: LogSource + 'static> Drop for StreamMultiplexer<L> {
    fn drop(&mut self) {
        // Tasks observe the token and exit; tails not closed explicitly end with their receivers
        self.shared.cancel.cancel();
    }
}

/// One destination: open (retrying while not found), then forward
struct Watcher<L: LogSource> {
    source: Arc<L>,
    shared: Arc<Shared>,
    retry_interval: Duration,
    index: usize,
    destination: LogDestination,
    events_tx: mpsc::Sender<LogEvent>,
    errs_tx: mpsc::UnboundedSender<Error>,
}

impl<L: LogSource> Watcher<L> {
    async fn run(self) {
        let cancel = self.shared.cancel.clone();
        let since = Utc::now();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            opened = self.source.open(&self.destination) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) if err.is_not_found() => {
                debug!("{} not found yet, retrying every {:?}", self.destination, self.retry_interval);
                loop {
                    let retried = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        retried = async {
                            tokio::time::sleep(self.retry_interval).await;
                            self.source.open_since(&self.destination, since).await
                        } => retried,
                    };
                    match retried {
                        Ok(stream) => break stream,
                        Err(err) if err.is_not_found() => continue,
                        Err(err) => return self.fail(err),
                    }
                }
            }
            Err(err) => return self.fail(err),
        };

        self.shared.activate(self.index, stream.closer());
        debug!("tailing {}", self.destination);

        loop {
            // Double select: neither a silent source nor a stalled consumer can block shutdown
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                item = stream.recv() => item,
            };
            match item {
                Some(Ok(TailEvent::SessionStart { session_id })) => {
                    debug!("live tail session {} on {}", session_id, self.destination);
                }
                Some(Ok(TailEvent::Update(batch))) => {
                    for event in batch {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            sent = self.events_tx.send(event) => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
                Some(Err(err)) => return self.fail(err),
                None => {
                    debug!("live tail on {} ended", self.destination);
                    return;
                }
            }
        }
    }

    /// Report once and abandon this destination
    fn fail(&self, err: Error) {
        warn!("abandoning {}: {}", self.destination, err);
        self.shared.abandon(self.index);
        let _ = self.errs_tx.send(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LiveEventStream;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::collections::HashMap;

    /// Fake log source: destinations are "missing" for a number of opens,
    /// then tail a channel fed by the test
    #[derive(Default)]
    struct FakeSource {
        missing: Mutex<HashMap<String, usize>>,
        broken: Mutex<Vec<String>>,
        feeds: Mutex<HashMap<String, mpsc::Receiver<Result<TailEvent>>>>,
        history: Mutex<HashMap<String, Vec<LogEvent>>>,
        tokens: Mutex<Vec<CancellationToken>>,
        since: Mutex<Option<DateTime<Utc>>>,
    }

    impl FakeSource {
        fn feed(&self, group: &str) -> mpsc::Sender<Result<TailEvent>> {
            let (tx, rx) = mpsc::channel(64);
            self.feeds.lock().insert(group.to_string(), rx);
            tx
        }

        fn try_open(&self, destination: &LogDestination) -> Result<LiveEventStream> {
            let group = destination.group_identifier().to_string();
            if self.broken.lock().contains(&group) {
                return Err(Error::api("logs", "AccessDeniedException", "no"));
            }
            if let Some(remaining) = self.missing.lock().get_mut(&group) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::NotFound(group));
                }
            }
            let rx = self
                .feeds
                .lock()
                .remove(&group)
                .ok_or_else(|| Error::Internal("opened twice".into()))?;
            let token = CancellationToken::new();
            self.tokens.lock().push(token.clone());
            Ok(LiveEventStream::new(group, rx, Arc::new(token)))
        }
    }

    #[async_trait]
    impl LogSource for FakeSource {
        async fn open(&self, destination: &LogDestination) -> Result<LiveEventStream> {
            self.try_open(destination)
        }

        async fn open_since(
            &self,
            destination: &LogDestination,
            since: DateTime<Utc>,
        ) -> Result<LiveEventStream> {
            *self.since.lock() = Some(since);
            let stream = self.try_open(destination)?;
            let history = self
                .history
                .lock()
                .remove(destination.group_identifier())
                .unwrap_or_default();
            Ok(stream.with_backfill(history))
        }
    }

    fn event(group: &str, id: usize) -> LogEvent {
        LogEvent::new(group, Utc::now(), format!("{}-{}", group, id)).with_id(format!("{}:{}", group, id))
    }

    fn mux(source: &Arc<FakeSource>) -> StreamMultiplexer<FakeSource> {
        StreamMultiplexer::new(Arc::clone(source)).with_retry_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_per_source_order_is_preserved() {
        let source = Arc::new(FakeSource::default());
        let a = source.feed("a");
        let b = source.feed("b");
        let mux = mux(&source);
        let mut events = mux.take_events().unwrap();
        mux.add(LogDestination::new("a")).unwrap();
        mux.add(LogDestination::new("b")).unwrap();

        for i in 0..20 {
            a.send(Ok(TailEvent::Update(vec![event("a", i)]))).await.unwrap();
            b.send(Ok(TailEvent::Update(vec![event("b", i * 2), event("b", i * 2 + 1)])))
                .await
                .unwrap();
        }

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        while seen_a.len() < 20 || seen_b.len() < 40 {
            let e = events.recv().await.unwrap();
            if e.source == "a" {
                seen_a.push(e.message);
            } else {
                seen_b.push(e.message);
            }
        }
        assert_eq!(seen_a, (0..20).map(|i| format!("a-{}", i)).collect::<Vec<_>>());
        assert_eq!(seen_b, (0..40).map(|i| format!("b-{}", i)).collect::<Vec<_>>());

        mux.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_source_backfills_before_live_events() {
        let source = Arc::new(FakeSource::default());
        source.missing.lock().insert("late".into(), 3);
        source
            .history
            .lock()
            .insert("late".into(), vec![event("late", 0), event("late", 1)]);
        let live = source.feed("late");
        let mux = mux(&source);
        let mut events = mux.take_events().unwrap();

        let before = Utc::now();
        mux.add(LogDestination::new("late")).unwrap();
        assert_eq!(mux.states()[0].1, StreamState::Pending);

        // overlaps the history; the duplicate is dropped
        live.send(Ok(TailEvent::Update(vec![event("late", 1), event("late", 2)])))
            .await
            .unwrap();

        let messages: Vec<String> = [
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|e| e.message)
        .collect();
        assert_eq!(messages, ["late-0", "late-1", "late-2"]);
        assert_eq!(mux.states()[0].1, StreamState::Active);
        assert!(source.since.lock().unwrap() >= before);

        mux.close().await.unwrap();
        assert_eq!(mux.states()[0].1, StreamState::Closed);
    }

    #[tokio::test]
    async fn test_failed_source_is_reported_and_others_continue() {
        let source = Arc::new(FakeSource::default());
        source.broken.lock().push("bad".into());
        let good = source.feed("good");
        let mux = mux(&source);
        let mut events = mux.take_events().unwrap();
        let mut errs = mux.take_errs().unwrap();

        mux.add(LogDestination::new("bad")).unwrap();
        mux.add(LogDestination::new("good")).unwrap();

        let err = errs.recv().await.unwrap();
        assert_eq!(err.code(), Some("AccessDeniedException"));

        good.send(Ok(TailEvent::Update(vec![event("good", 0)]))).await.unwrap();
        assert_eq!(events.recv().await.unwrap().message, "good-0");

        // a read error abandons the source too
        good.send(Err(Error::Stream("connection reset".into()))).await.unwrap();
        assert!(matches!(errs.recv().await.unwrap(), Error::Stream(_)));

        mux.close().await.unwrap();
        let states = mux.states();
        assert!(states.iter().all(|(_, state)| *state == StreamState::Closed));
    }

    #[tokio::test]
    async fn test_close_stops_all_tasks_and_closes_channels() {
        let source = Arc::new(FakeSource::default());
        source.missing.lock().insert("never".into(), usize::MAX);
        let busy = source.feed("busy");
        let mux = mux(&source);
        let mut events = mux.take_events().unwrap();
        let mut errs = mux.take_errs().unwrap();

        mux.add(LogDestination::new("never")).unwrap();
        mux.add(LogDestination::new("busy")).unwrap();

        // More than the output buffer holds, with nobody reading
        let producer = tokio::spawn(async move {
            for i in 0..(EVENT_BUFFER * 2) {
                if busy.send(Ok(TailEvent::Update(vec![event("busy", i)]))).await.is_err() {
                    break;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        mux.close().await.unwrap();
        assert!(mux.shared.tasks.lock().is_empty());

        // buffered events drain, then the channel reports closed
        let mut drained = 0;
        while events.recv().await.is_some() {
            drained += 1;
        }
        assert!(drained <= EVENT_BUFFER);
        assert!(errs.recv().await.is_none());

        for token in source.tokens.lock().iter() {
            assert!(token.is_cancelled());
        }
        assert!(matches!(mux.add(LogDestination::new("x")), Err(Error::Cancelled)));

        producer.abort();
    }
}
