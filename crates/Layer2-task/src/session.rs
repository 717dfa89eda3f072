//! Tail sessions
//!
//! `TailSession` follows one task: it tails the task's log stream through a
//! `StreamMultiplexer`, polls the task status on every tick and returns the
//! terminal outcome once the task stops and buffered lines are drained.

use crate::api::ComputeApi;
use crate::handle::TaskHandle;
use crate::log::LogEvent;
use crate::monitor::TaskStatusMonitor;
use crate::multiplexer::StreamMultiplexer;
use crate::source::{LogDestination, LogSource};
use crate::state::TaskOutcome;
use crun_foundation::{CrunConfig, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives the lines of a tail session
pub trait LogSink: Send {
    fn emit(&mut self, event: &LogEvent);

    /// Called once per status tick while the task is still running
    fn heartbeat(&mut self) {}
}

impl LogSink for mpsc::UnboundedSender<LogEvent> {
    fn emit(&mut self, event: &LogEvent) {
        let _ = self.send(event.clone());
    }
}

impl LogSink for Vec<LogEvent> {
    fn emit(&mut self, event: &LogEvent) {
        self.push(event.clone());
    }
}

/// Naming and timing of a tail session
#[derive(Debug, Clone)]
pub struct TailConfig {
    pub stream_prefix: String,
    pub container_name: String,
    pub status_interval: Duration,
    pub retry_interval: Duration,
    pub drain_timeout: Duration,
}

impl TailConfig {
    pub fn from_config(config: &CrunConfig) -> Self {
        Self {
            stream_prefix: config.logs.stream_prefix.clone(),
            container_name: config.logs.container_name.clone(),
            status_interval: config.timing.status_poll_interval(),
            retry_interval: config.logs.retry_interval(),
            drain_timeout: config.timing.drain_timeout(),
        }
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        Self::from_config(&CrunConfig::default())
    }
}

pub struct TailSession<L: LogSource + 'static, C: ComputeApi + 'static> {
    source: Arc<L>,
    monitor: TaskStatusMonitor<C>,
    config: TailConfig,
    cancel: CancellationToken,
}

impl<L: LogSource + 'static, C: ComputeApi + 'static> TailSession<L, C> {
    pub fn new(source: Arc<L>, monitor: TaskStatusMonitor<C>, config: TailConfig) -> Self {
        Self {
            source,
            monitor,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// End the session with `Error::Cancelled` when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Destination the task's log driver writes to
    pub fn destination(&self, handle: &TaskHandle, log_group: &str) -> LogDestination {
        LogDestination::new(log_group).with_stream(
            handle.log_stream(&self.config.stream_prefix, &self.config.container_name),
        )
    }

    /// Tail `handle` until it stops.
    ///
    /// A failed task is a normal `Ok(TaskOutcome::Failed)`; errors mean the
    /// task could not be observed.
    pub async fn run(
        &self,
        handle: &TaskHandle,
        log_group: &str,
        sink: &mut dyn LogSink,
    ) -> Result<TaskOutcome> {
        let mux = StreamMultiplexer::new(Arc::clone(&self.source))
            .with_retry_interval(self.config.retry_interval);
        let (mut events, mut errs) = match (mux.take_events(), mux.take_errs()) {
            (Some(events), Some(errs)) => (events, errs),
            _ => return Err(Error::Internal("multiplexer channels already taken".into())),
        };

        let destination = self.destination(handle, log_group);
        info!("Tailing {}", destination);
        mux.add(destination)?;

        let mut ticker = tokio::time::interval(self.config.status_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let result = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Err(Error::Cancelled),
                _ = ticker.tick() => {
                    let outcome = self.monitor.poll(handle).await;
                    if outcome.is_terminal() {
                        debug!("task {}: {}", handle.task_id(), outcome);
                        break Ok(outcome);
                    }
                    sink.heartbeat();
                }
                Some(event) = events.recv() => sink.emit(&event),
                Some(err) = errs.recv() => break Err(err),
            }
        };

        if result.is_ok() {
            // Lines still in flight when the task stopped
            let deadline = Instant::now() + self.config.drain_timeout;
            while let Ok(Some(event)) = timeout_at(deadline, events.recv()).await {
                sink.emit(&event);
            }
        }

        if let Err(err) = mux.close().await {
            warn!("closing log streams: {}", err);
        }
        result
    }
}
