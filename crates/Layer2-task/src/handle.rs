//! Task handles
//!
//! A `TaskHandle` wraps an ECS task ARN
//! (`arn:aws:ecs:<region>:<account>:task/<cluster>/<task-id>`). The cluster and
//! the log stream name are derived from it; malformed ARNs are rejected when
//! the handle is built.

use crun_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const ECS_ARN_PREFIX: &str = "arn:aws:ecs:";

/// Identifier of one launched task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskHandle {
    arn: String,
    region: String,
    account: String,
    cluster: String,
    task_id: String,
}

impl TaskHandle {
    /// Parse a task ARN
    pub fn parse(arn: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("invalid task ARN: {:?}", arn));

        if !arn.starts_with(ECS_ARN_PREFIX) {
            return Err(invalid());
        }
        let parts: Vec<&str> = arn.splitn(6, ':').collect();
        let [_, _, _, region, account, resource] = parts.as_slice() else {
            return Err(invalid());
        };
        let resource: Vec<&str> = resource.split('/').collect();
        let ["task", cluster, task_id] = resource.as_slice() else {
            return Err(invalid());
        };
        if cluster.is_empty() || task_id.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            arn: arn.to_string(),
            region: region.to_string(),
            account: account.to_string(),
            cluster: cluster.to_string(),
            task_id: task_id.to_string(),
        })
    }

    /// Rebuild the ARN of a task known only by its id
    pub fn from_task_id(task_id: &str, region: &str, account: &str, cluster: &str) -> Result<Self> {
        if task_id.contains('/') || task_id.contains(':') {
            return Err(Error::InvalidInput(format!("invalid task id: {:?}", task_id)));
        }
        Self::parse(&format!(
            "{}{}:{}:task/{}/{}",
            ECS_ARN_PREFIX, region, account, cluster, task_id
        ))
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Final path segment of the ARN
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// `<prefix>/<container>/<task-id>`, the stream the awslogs driver writes to
    pub fn log_stream(&self, prefix: &str, container: &str) -> String {
        format!("{}/{}/{}", prefix, container, self.task_id)
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.arn)
    }
}

impl FromStr for TaskHandle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TaskHandle {
    type Error = Error;

    fn try_from(arn: String) -> Result<Self> {
        Self::parse(&arn)
    }
}

impl From<TaskHandle> for String {
    fn from(handle: TaskHandle) -> Self {
        handle.arn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARN: &str = "arn:aws:ecs:us-west-2:123456789012:task/crun-Cluster-abc/0123456789abcdef";

    #[test]
    fn test_parse() {
        let handle = TaskHandle::parse(ARN).unwrap();
        assert_eq!(handle.region(), "us-west-2");
        assert_eq!(handle.account(), "123456789012");
        assert_eq!(handle.cluster(), "crun-Cluster-abc");
        assert_eq!(handle.task_id(), "0123456789abcdef");
        assert_eq!(handle.to_string(), ARN);
    }

    #[test]
    fn test_log_stream_name() {
        let handle: TaskHandle = ARN.parse().unwrap();
        assert_eq!(
            handle.log_stream("crun", "main"),
            "crun/main/0123456789abcdef"
        );
    }

    #[test]
    fn test_invalid_arns_are_errors() {
        for arn in [
            "",
            "0123456789abcdef",
            "arn:aws:logs:us-west-2:123456789012:log-group:x",
            "arn:aws:ecs:us-west-2:123456789012:task/0123456789abcdef",
            "arn:aws:ecs:us-west-2:123456789012:service/cluster/name",
            "arn:aws:ecs:us-west-2:123456789012:task/cluster/id/extra",
            "arn:aws:ecs:us-west-2",
        ] {
            assert!(
                matches!(TaskHandle::parse(arn), Err(Error::InvalidInput(_))),
                "{:?} should be rejected",
                arn
            );
        }
    }

    #[test]
    fn test_from_task_id() {
        let handle =
            TaskHandle::from_task_id("0123456789abcdef", "us-west-2", "123456789012", "crun-Cluster-abc")
                .unwrap();
        assert_eq!(handle.arn(), ARN);
        assert!(TaskHandle::from_task_id("a/b", "us-west-2", "1", "c").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let handle = TaskHandle::parse(ARN).unwrap();
        let json = serde_json::to_string(&handle).unwrap();
        assert_eq!(json, format!("\"{}\"", ARN));
        let back: TaskHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, handle);
        assert!(serde_json::from_str::<TaskHandle>("\"nope\"").is_err());
    }
}
