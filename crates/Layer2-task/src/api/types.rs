//! Request and response shapes exchanged with the control plane
//!
//! These mirror the documented CloudFormation / ECS / EC2 / CloudWatch Logs
//! operations closely enough that an SDK binding is a thin mapping layer.

use crate::log::LogEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Stacks
// ============================================================================

/// Stack lifecycle status as reported by describe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    CreateInProgress,
    CreateFailed,
    CreateComplete,
    RollbackInProgress,
    RollbackFailed,
    RollbackComplete,
    DeleteInProgress,
    DeleteFailed,
    DeleteComplete,
    UpdateInProgress,
    UpdateCompleteCleanupInProgress,
    UpdateComplete,
    UpdateFailed,
    UpdateRollbackInProgress,
    UpdateRollbackFailed,
    UpdateRollbackCompleteCleanupInProgress,
    UpdateRollbackComplete,
}

impl StackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackStatus::CreateInProgress => "CREATE_IN_PROGRESS",
            StackStatus::CreateFailed => "CREATE_FAILED",
            StackStatus::CreateComplete => "CREATE_COMPLETE",
            StackStatus::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            StackStatus::RollbackFailed => "ROLLBACK_FAILED",
            StackStatus::RollbackComplete => "ROLLBACK_COMPLETE",
            StackStatus::DeleteInProgress => "DELETE_IN_PROGRESS",
            StackStatus::DeleteFailed => "DELETE_FAILED",
            StackStatus::DeleteComplete => "DELETE_COMPLETE",
            StackStatus::UpdateInProgress => "UPDATE_IN_PROGRESS",
            StackStatus::UpdateCompleteCleanupInProgress => "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
            StackStatus::UpdateComplete => "UPDATE_COMPLETE",
            StackStatus::UpdateFailed => "UPDATE_FAILED",
            StackStatus::UpdateRollbackInProgress => "UPDATE_ROLLBACK_IN_PROGRESS",
            StackStatus::UpdateRollbackFailed => "UPDATE_ROLLBACK_FAILED",
            StackStatus::UpdateRollbackCompleteCleanupInProgress => {
                "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS"
            }
            StackStatus::UpdateRollbackComplete => "UPDATE_ROLLBACK_COMPLETE",
        }
    }

    /// Still moving; a waiter should keep polling
    pub fn is_in_progress(&self) -> bool {
        self.as_str().ends_with("_IN_PROGRESS")
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutput {
    pub key: String,
    pub value: String,
}

impl StackOutput {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Stack parameter; `use_previous_value` keeps whatever the deployed stack has
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackParameter {
    pub key: String,
    pub value: Option<String>,
    pub use_previous_value: bool,
}

impl StackParameter {
    pub fn value(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            use_previous_value: false,
        }
    }

    pub fn previous(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            use_previous_value: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackDescription {
    pub stack_id: String,
    pub stack_name: String,
    pub status: StackStatus,
    pub status_reason: Option<String>,
    pub outputs: Vec<StackOutput>,
    pub parameters: Vec<StackParameter>,
    pub termination_protection: bool,
}

impl StackDescription {
    pub fn output(&self, key: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|o| o.key == key)
            .map(|o| o.value.as_str())
    }
}

/// What the control plane does with a stack whose creation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnFailure {
    Delete,
    Rollback,
    DoNothing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateStackRequest {
    pub stack_name: String,
    pub template_body: String,
    pub parameters: Vec<StackParameter>,
    pub termination_protection: bool,
    pub on_failure: OnFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStackRequest {
    pub stack_name: String,
    pub template_body: String,
    pub parameters: Vec<StackParameter>,
}

// ============================================================================
// Tasks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchType {
    Fargate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Command/environment override for one container of the task definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerOverride {
    pub name: String,
    pub command: Vec<String>,
    pub environment: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsVpcConfig {
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub assign_public_ip: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTaskRequest {
    pub cluster: String,
    pub task_definition: String,
    pub count: u32,
    pub launch_type: LaunchType,
    pub started_by: String,
    pub network: AwsVpcConfig,
    pub overrides: Vec<ContainerOverride>,
    pub tags: Vec<Tag>,
    pub propagate_task_definition_tags: bool,
}

/// One rejected instance of a run request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchFailure {
    pub arn: Option<String>,
    pub reason: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTaskResponse {
    pub tasks: Vec<TaskDescription>,
    pub failures: Vec<LaunchFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    pub name: String,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescription {
    pub task_arn: String,
    pub last_status: String,
    pub desired_status: String,
    pub stop_code: Option<String>,
    pub stopped_reason: Option<String>,
    pub containers: Vec<ContainerState>,
    pub public_ip: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Subnet lookup; every populated field narrows the result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetQuery {
    pub vpc_id: Option<String>,
    pub subnet_ids: Vec<String>,
    pub public_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub subnet_id: String,
    pub vpc_id: String,
    pub map_public_ip_on_launch: bool,
}

// ============================================================================
// Logs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveTailRequest {
    pub log_group: String,
    pub log_streams: Vec<String>,
}

/// Historical query; `end_time: None` means "up to now" at the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterLogEventsRequest {
    pub log_group: String,
    pub log_streams: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEventsPage {
    pub events: Vec<LogEvent>,
    pub next_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_status_strings() {
        assert_eq!(StackStatus::CreateComplete.to_string(), "CREATE_COMPLETE");
        assert!(StackStatus::UpdateCompleteCleanupInProgress.is_in_progress());
        assert!(!StackStatus::UpdateRollbackComplete.is_in_progress());

        let json = serde_json::to_string(&StackStatus::UpdateRollbackFailed).unwrap();
        assert_eq!(json, "\"UPDATE_ROLLBACK_FAILED\"");
    }

    #[test]
    fn test_stack_output_lookup() {
        let description = StackDescription {
            stack_id: "id".into(),
            stack_name: "crun".into(),
            status: StackStatus::CreateComplete,
            status_reason: None,
            outputs: vec![StackOutput::new("ClusterName", "crun-Cluster")],
            parameters: vec![],
            termination_protection: true,
        };
        assert_eq!(description.output("ClusterName"), Some("crun-Cluster"));
        assert_eq!(description.output("BucketName"), None);
    }
}
