//! Driver trait

use crate::container::ContainerSpec;
use crate::handle::TaskHandle;
use crate::session::LogSink;
use crate::state::TaskOutcome;
use async_trait::async_trait;
use crun_foundation::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What `info` reports about a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Last status reported by the backend (e.g. `RUNNING`)
    pub status: String,
    /// Public IP address, when the task has one
    pub ip: Option<String>,
}

/// Driver trait - one implementation per execution backend
#[async_trait]
pub trait Driver: Send + Sync {
    /// Make the backend ready to run `containers`
    async fn set_up(&self, containers: &[ContainerSpec]) -> Result<()>;

    /// Remove what `set_up` created
    async fn tear_down(&self) -> Result<()>;

    /// Start the main container with `env` and `cmd`
    async fn run(&self, env: &BTreeMap<String, String>, cmd: &[String]) -> Result<TaskHandle>;

    /// Stream the task's logs into `sink` until it stops
    async fn tail(&self, handle: &TaskHandle, sink: &mut dyn LogSink) -> Result<TaskOutcome>;

    async fn stop(&self, handle: &TaskHandle) -> Result<()>;

    async fn info(&self, handle: &TaskHandle) -> Result<TaskInfo>;

    /// Handle for a full task ARN or a bare task id
    async fn resolve(&self, task: &str) -> Result<TaskHandle>;

    /// Get driver name
    fn name(&self) -> &'static str;
}
