//! Task outcome

use crate::api::TaskDescription;
use serde::{Deserialize, Serialize};

const STOP_CODE_ESSENTIAL_CONTAINER_EXITED: &str = "EssentialContainerExited";

/// What a task is doing, as far as the control plane can tell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    /// Alive, or not visible yet
    Running,

    /// Essential container exited with code 0
    Succeeded,

    /// Non-zero exit or abnormal stop
    Failed {
        reason: String,
        exit_code: Option<i32>,
    },
}

impl TaskOutcome {
    pub fn failed(reason: impl Into<String>, exit_code: Option<i32>) -> Self {
        TaskOutcome::Failed {
            reason: reason.into(),
            exit_code,
        }
    }

    /// Terminal outcomes end a tail session
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskOutcome::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }

    /// Process exit code to report for this outcome
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TaskOutcome::Running => None,
            TaskOutcome::Succeeded => Some(0),
            TaskOutcome::Failed { exit_code, .. } => Some(exit_code.unwrap_or(1)),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            TaskOutcome::Running => "Running",
            TaskOutcome::Succeeded => "Succeeded",
            TaskOutcome::Failed { .. } => "Failed",
        }
    }

    /// Classify a task description.
    ///
    /// Only `STOPPED`, `DELETED` and `DEPROVISIONING` are terminal; logs may
    /// still arrive in every other status.
    pub fn from_description(task: &TaskDescription) -> Self {
        if !matches!(
            task.last_status.as_str(),
            "STOPPED" | "DELETED" | "DEPROVISIONING"
        ) {
            return TaskOutcome::Running;
        }

        let stopped_reason = task.stopped_reason.as_deref().unwrap_or_default();
        match task.stop_code.as_deref() {
            None | Some("") => TaskOutcome::Succeeded,
            Some(STOP_CODE_ESSENTIAL_CONTAINER_EXITED) => {
                match task.containers.iter().find_map(|c| c.exit_code.filter(|&code| code != 0)) {
                    Some(code) => TaskOutcome::failed(
                        format!(
                            "{}: {} with code {}",
                            STOP_CODE_ESSENTIAL_CONTAINER_EXITED, stopped_reason, code
                        ),
                        Some(code),
                    ),
                    None => TaskOutcome::Succeeded,
                }
            }
            Some(code) => TaskOutcome::failed(format!("{}: {}", code, stopped_reason), None),
        }
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Failed { reason, .. } => write!(f, "Failed: {}", reason),
            other => f.write_str(other.display_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ContainerState;

    fn task(status: &str, stop_code: Option<&str>, exit_code: Option<i32>) -> TaskDescription {
        TaskDescription {
            task_arn: "arn:aws:ecs:us-west-2:1:task/c/t".into(),
            last_status: status.into(),
            desired_status: "STOPPED".into(),
            stop_code: stop_code.map(String::from),
            stopped_reason: Some("Essential container in task exited".into()),
            containers: vec![ContainerState {
                name: "main".into(),
                exit_code,
                reason: None,
            }],
            public_ip: None,
            started_at: None,
        }
    }

    #[test]
    fn test_running_statuses() {
        for status in ["PROVISIONING", "PENDING", "RUNNING", "DEACTIVATING", "STOPPING"] {
            assert_eq!(
                TaskOutcome::from_description(&task(status, None, None)),
                TaskOutcome::Running
            );
        }
    }

    #[test]
    fn test_stop_code_before_stopped_is_still_running() {
        let stopping = task("STOPPING", Some("EssentialContainerExited"), Some(1));
        assert_eq!(TaskOutcome::from_description(&stopping), TaskOutcome::Running);
    }

    #[test]
    fn test_exit_zero_succeeds() {
        let outcome = TaskOutcome::from_description(&task(
            "STOPPED",
            Some("EssentialContainerExited"),
            Some(0),
        ));
        assert_eq!(outcome, TaskOutcome::Succeeded);
        assert_eq!(outcome.exit_code(), Some(0));
    }

    #[test]
    fn test_non_zero_exit_fails() {
        let outcome = TaskOutcome::from_description(&task(
            "STOPPED",
            Some("EssentialContainerExited"),
            Some(137),
        ));
        match &outcome {
            TaskOutcome::Failed { reason, exit_code } => {
                assert!(reason.contains("137"));
                assert_eq!(*exit_code, Some(137));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(outcome.exit_code(), Some(137));
        assert!(outcome.is_terminal());
    }

    #[test]
    fn test_other_stop_code_fails() {
        let mut description = task("DEPROVISIONING", Some("TaskFailedToStart"), None);
        description.stopped_reason = Some("CannotPullContainerError".into());
        let outcome = TaskOutcome::from_description(&description);
        assert_eq!(
            outcome,
            TaskOutcome::failed("TaskFailedToStart: CannotPullContainerError", None)
        );
        assert_eq!(outcome.exit_code(), Some(1));
        assert_eq!(
            outcome.to_string(),
            "Failed: TaskFailedToStart: CannotPullContainerError"
        );
    }
}
