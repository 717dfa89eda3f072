//! Resolved infrastructure identifiers
//!
//! `InfraOutputs` is bound from the stack's named outputs. Fields are sticky:
//! a refresh that reports a blank value never erases a value already known.

use crate::api::StackOutput;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const OUTPUT_CLUSTER_NAME: &str = "ClusterName";
pub const OUTPUT_SUBNET_ID: &str = "SubnetID";
pub const OUTPUT_SECURITY_GROUP_ID: &str = "SecurityGroupID";
pub const OUTPUT_TASK_DEF_ARN: &str = "TaskDefArn";
pub const OUTPUT_LOG_GROUP_ARN: &str = "LogGroupARN";
pub const OUTPUT_BUCKET_NAME: &str = "BucketName";
pub const OUTPUT_TEMPLATE_VERSION: &str = "TemplateVersion";

/// Provider-opaque identifiers of the provisioned stack
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfraOutputs {
    pub cluster: String,
    pub subnet: String,
    pub security_group: String,
    pub task_definition: String,
    /// Log group ARN (`arn:aws:logs:<region>:<account>:log-group:<name>:*`)
    pub log_group: String,
    pub bucket: String,
    pub template_version: String,
}

impl InfraOutputs {
    /// Bind the known output keys; unknown keys are ignored
    pub fn from_stack_outputs(outputs: &[StackOutput]) -> Self {
        let mut bound = Self::default();
        for output in outputs {
            let slot = match output.key.as_str() {
                OUTPUT_CLUSTER_NAME => &mut bound.cluster,
                OUTPUT_SUBNET_ID => &mut bound.subnet,
                OUTPUT_SECURITY_GROUP_ID => &mut bound.security_group,
                OUTPUT_TASK_DEF_ARN => &mut bound.task_definition,
                OUTPUT_LOG_GROUP_ARN => &mut bound.log_group,
                OUTPUT_BUCKET_NAME => &mut bound.bucket,
                OUTPUT_TEMPLATE_VERSION => &mut bound.template_version,
                _ => continue,
            };
            *slot = output.value.clone();
        }
        bound
    }

    /// Sticky merge: non-empty values in `other` win, blanks are ignored
    pub fn merge(&mut self, other: InfraOutputs) {
        fn keep(slot: &mut String, value: String) {
            if !value.is_empty() {
                *slot = value;
            }
        }
        keep(&mut self.cluster, other.cluster);
        keep(&mut self.subnet, other.subnet);
        keep(&mut self.security_group, other.security_group);
        keep(&mut self.task_definition, other.task_definition);
        keep(&mut self.log_group, other.log_group);
        keep(&mut self.bucket, other.bucket);
        keep(&mut self.template_version, other.template_version);
    }

    /// Fields required to launch and observe a task
    pub fn is_complete(&self) -> bool {
        !self.cluster.is_empty() && !self.task_definition.is_empty() && !self.log_group.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Log group identifier accepted by the live tail API (no `:*` suffix)
    pub fn log_group_identifier(&self) -> &str {
        self.log_group.strip_suffix(":*").unwrap_or(&self.log_group)
    }

    /// Region component of the log group ARN
    pub fn region(&self) -> Option<&str> {
        arn_component(&self.log_group, 3)
    }

    /// Account component of the log group ARN
    pub fn account_id(&self) -> Option<&str> {
        arn_component(&self.log_group, 4)
    }

    /// Deployed template revision, if the stack reports one
    pub fn template_revision(&self) -> Option<u32> {
        self.template_version.parse().ok()
    }
}

fn arn_component(arn: &str, index: usize) -> Option<&str> {
    if !arn.starts_with("arn:") {
        return None;
    }
    arn.split(':').nth(index).filter(|c| !c.is_empty())
}

/// `InfraOutputs` shared between the provisioner and its readers.
///
/// Every refresh replaces the record under one write lock, so readers never
/// observe a partially applied refresh.
#[derive(Debug, Clone, Default)]
pub struct SharedOutputs {
    inner: Arc<RwLock<InfraOutputs>>,
}

impl SharedOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> InfraOutputs {
        self.inner.read().clone()
    }

    /// Sticky merge of a refresh; returns the merged record
    pub fn merge(&self, refreshed: InfraOutputs) -> InfraOutputs {
        let mut outputs = self.inner.write();
        outputs.merge(refreshed);
        outputs.clone()
    }

    pub fn set_subnet(&self, subnet: impl Into<String>) {
        let subnet = subnet.into();
        if !subnet.is_empty() {
            self.inner.write().subnet = subnet;
        }
    }

    /// Forget everything (after the stack is deleted)
    pub fn clear(&self) {
        *self.inner.write() = InfraOutputs::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG_GROUP: &str = "arn:aws:logs:us-west-2:123456789012:log-group:crun-LogGroup-abc:*";

    fn full() -> InfraOutputs {
        InfraOutputs::from_stack_outputs(&[
            StackOutput::new(OUTPUT_CLUSTER_NAME, "crun-Cluster"),
            StackOutput::new(OUTPUT_SUBNET_ID, "subnet-1"),
            StackOutput::new(OUTPUT_TASK_DEF_ARN, "arn:aws:ecs:us-west-2:123456789012:task-definition/crun:1"),
            StackOutput::new(OUTPUT_LOG_GROUP_ARN, LOG_GROUP),
            StackOutput::new(OUTPUT_TEMPLATE_VERSION, "1"),
            StackOutput::new("Unrelated", "x"),
        ])
    }

    #[test]
    fn test_bind_outputs() {
        let outputs = full();
        assert_eq!(outputs.cluster, "crun-Cluster");
        assert_eq!(outputs.subnet, "subnet-1");
        assert!(outputs.security_group.is_empty());
        assert!(outputs.is_complete());
        assert_eq!(outputs.template_revision(), Some(1));
    }

    #[test]
    fn test_merge_is_sticky() {
        let mut outputs = full();
        let partial = InfraOutputs {
            cluster: String::new(),
            subnet: "subnet-2".into(),
            security_group: "sg-1".into(),
            ..Default::default()
        };
        outputs.merge(partial);

        assert_eq!(outputs.cluster, "crun-Cluster");
        assert_eq!(outputs.subnet, "subnet-2");
        assert_eq!(outputs.security_group, "sg-1");
        assert_eq!(outputs.log_group, LOG_GROUP);
    }

    #[test]
    fn test_log_group_helpers() {
        let outputs = full();
        assert_eq!(
            outputs.log_group_identifier(),
            "arn:aws:logs:us-west-2:123456789012:log-group:crun-LogGroup-abc"
        );
        assert_eq!(outputs.region(), Some("us-west-2"));
        assert_eq!(outputs.account_id(), Some("123456789012"));
        assert_eq!(InfraOutputs::default().account_id(), None);
    }

    #[test]
    fn test_shared_outputs() {
        let shared = SharedOutputs::new();
        assert!(shared.snapshot().is_empty());

        shared.merge(full());
        shared.merge(InfraOutputs::default());
        assert_eq!(shared.snapshot().cluster, "crun-Cluster");

        shared.set_subnet("");
        assert_eq!(shared.snapshot().subnet, "subnet-1");

        shared.clear();
        assert!(shared.snapshot().is_empty());
    }
}
