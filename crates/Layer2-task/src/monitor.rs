//! Task status monitoring
//!
//! `poll` answers once; `watch` polls on an interval and delivers exactly one
//! terminal outcome, or nothing if cancelled first. Query failures never turn
//! into `Failed`: a task that cannot be described is still starting.

use crate::api::ComputeApi;
use crate::handle::TaskHandle;
use crate::state::TaskOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct TaskStatusMonitor<C: ComputeApi> {
    compute: Arc<C>,
}

impl<C: ComputeApi> Clone for TaskStatusMonitor<C> {
    fn clone(&self) -> Self {
        Self {
            compute: Arc::clone(&self.compute),
        }
    }
}

impl<C: ComputeApi + 'static> TaskStatusMonitor<C> {
    pub fn new(compute: Arc<C>) -> Self {
        Self { compute }
    }

    /// One-shot status query
    pub async fn poll(&self, handle: &TaskHandle) -> TaskOutcome {
        match self
            .compute
            .describe_task(handle.cluster(), handle.task_id())
            .await
        {
            Ok(Some(task)) => TaskOutcome::from_description(&task),
            Ok(None) => {
                debug!("task {} not visible yet", handle.task_id());
                TaskOutcome::Running
            }
            Err(err) if err.is_retryable() || err.is_not_found() => {
                debug!("describe task {}: {}", handle.task_id(), err);
                TaskOutcome::Running
            }
            Err(err) => {
                warn!("describe task {} failed: {}", handle.task_id(), err);
                TaskOutcome::Running
            }
        }
    }

    /// Poll every `interval` until the task stops or the watch is cancelled
    pub fn watch(&self, handle: TaskHandle, interval: Duration) -> StatusWatch {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let monitor = self.clone();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick is immediate; the first poll waits a full interval
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    outcome = monitor.poll(&handle) => outcome,
                };
                if outcome.is_terminal() {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {}
                        _ = tx.send(outcome) => {}
                    }
                    return;
                }
            }
        });

        StatusWatch {
            outcomes: rx,
            cancel,
            task: Some(task),
        }
    }
}

/// A running `watch`
pub struct StatusWatch {
    outcomes: mpsc::Receiver<TaskOutcome>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StatusWatch {
    /// The terminal outcome; `None` if the watch was cancelled first
    pub async fn recv(&mut self) -> Option<TaskOutcome> {
        self.outcomes.recv().await
    }

    /// Stop polling and close the outcome channel
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this watch
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel and wait for the polling task to exit
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StatusWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        ContainerState, RunTaskRequest, RunTaskResponse, Subnet, SubnetQuery, TaskDescription,
    };
    use async_trait::async_trait;
    use crun_foundation::{Error, Result};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays scripted describe results; repeats the last one
    struct Scripted {
        results: Mutex<VecDeque<Result<Option<TaskDescription>>>>,
    }

    fn described(status: &str, exit_code: Option<i32>) -> Result<Option<TaskDescription>> {
        Ok(Some(TaskDescription {
            task_arn: "arn:aws:ecs:us-west-2:1:task/c/t".into(),
            last_status: status.into(),
            desired_status: "STOPPED".into(),
            stop_code: exit_code.map(|_| "EssentialContainerExited".into()),
            stopped_reason: Some("Essential container in task exited".into()),
            containers: vec![ContainerState {
                name: "main".into(),
                exit_code,
                reason: None,
            }],
            public_ip: None,
            started_at: None,
        }))
    }

    #[async_trait]
    impl ComputeApi for Scripted {
        async fn run_task(&self, _: RunTaskRequest) -> Result<RunTaskResponse> {
            unimplemented!()
        }

        async fn describe_task(&self, _: &str, _: &str) -> Result<Option<TaskDescription>> {
            let mut results = self.results.lock();
            if results.len() > 1 {
                results.pop_front().unwrap_or(Ok(None))
            } else {
                match results.front() {
                    Some(Ok(task)) => Ok(task.clone()),
                    _ => Ok(None),
                }
            }
        }

        async fn stop_task(&self, _: &str, _: &str, _: &str) -> Result<()> {
            unimplemented!()
        }

        async fn describe_subnets(&self, _: &SubnetQuery) -> Result<Vec<Subnet>> {
            unimplemented!()
        }
    }

    fn monitor(results: Vec<Result<Option<TaskDescription>>>) -> TaskStatusMonitor<Scripted> {
        TaskStatusMonitor::new(Arc::new(Scripted {
            results: Mutex::new(results.into()),
        }))
    }

    fn handle() -> TaskHandle {
        TaskHandle::parse("arn:aws:ecs:us-west-2:1:task/c/t").unwrap()
    }

    #[tokio::test]
    async fn test_poll_swallows_transient_errors() {
        let monitor = monitor(vec![
            Ok(None),
            Err(Error::api("ecs", "ThrottlingException", "slow down")),
            Err(Error::api("ecs", "AccessDeniedException", "no")),
            described("STOPPED", Some(0)),
        ]);
        assert_eq!(monitor.poll(&handle()).await, TaskOutcome::Running);
        assert_eq!(monitor.poll(&handle()).await, TaskOutcome::Running);
        assert_eq!(monitor.poll(&handle()).await, TaskOutcome::Running);
        assert_eq!(monitor.poll(&handle()).await, TaskOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_watch_yields_one_terminal_outcome() {
        let monitor = monitor(vec![
            described("PENDING", None),
            Ok(None),
            described("RUNNING", None),
            described("STOPPED", Some(137)),
        ]);
        let mut watch = monitor.watch(handle(), Duration::from_millis(5));

        match watch.recv().await {
            Some(TaskOutcome::Failed { reason, exit_code }) => {
                assert!(reason.contains("137"));
                assert_eq!(exit_code, Some(137));
            }
            other => panic!("unexpected {:?}", other),
        }
        // the channel closes after the single terminal outcome
        assert!(watch.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_cancel_closes_channel() {
        let monitor = monitor(vec![described("RUNNING", None)]);
        let mut watch = monitor.watch(handle(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;

        watch.cancel();
        assert!(watch.recv().await.is_none());
        watch.shutdown().await;
    }
}
