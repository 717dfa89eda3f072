//! Control-plane capability traits
//!
//! One implementation per provider is chosen at construction time; the engine
//! never inspects which one it got.

use super::types::{
    CreateStackRequest, FilterLogEventsRequest, LiveTailRequest, LogEventsPage, RunTaskRequest,
    RunTaskResponse, StackDescription, Subnet, SubnetQuery, TaskDescription, UpdateStackRequest,
};
use crate::log::LiveEventStream;
use async_trait::async_trait;
use crun_foundation::Result;

/// Stack lifecycle (CloudFormation semantics).
///
/// Errors follow the provider's conventions: a missing stack is a
/// `ValidationError` whose message ends in " does not exist", an update with
/// nothing to change is `ValidationError` "No updates are to be performed.",
/// a duplicate create is `AlreadyExistsException`.
#[async_trait]
pub trait StackApi: Send + Sync {
    async fn describe_stack(&self, stack_name: &str) -> Result<StackDescription>;

    /// Returns the stack id
    async fn create_stack(&self, request: CreateStackRequest) -> Result<String>;

    /// Returns the stack id
    async fn update_stack(&self, request: UpdateStackRequest) -> Result<String>;

    async fn delete_stack(&self, stack_name: &str) -> Result<()>;

    async fn update_termination_protection(&self, stack_name: &str, enabled: bool)
        -> Result<()>;
}

/// Task execution and networking lookups (ECS + EC2 semantics)
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn run_task(&self, request: RunTaskRequest) -> Result<RunTaskResponse>;

    /// `Ok(None)` when the task is not (yet) visible
    async fn describe_task(&self, cluster: &str, task: &str) -> Result<Option<TaskDescription>>;

    async fn stop_task(&self, cluster: &str, task: &str, reason: &str) -> Result<()>;

    async fn describe_subnets(&self, query: &SubnetQuery) -> Result<Vec<Subnet>>;
}

/// Log destinations (CloudWatch Logs semantics).
///
/// A log group or stream that does not exist yet is reported as
/// `Error::NotFound`.
#[async_trait]
pub trait LogApi: Send + Sync {
    async fn start_live_tail(&self, request: LiveTailRequest) -> Result<LiveEventStream>;

    async fn filter_log_events(&self, request: FilterLogEventsRequest) -> Result<LogEventsPage>;
}
