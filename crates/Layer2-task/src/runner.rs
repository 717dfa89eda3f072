//! Task launching
//!
//! `TaskRunner` launches exactly one Fargate task against the provisioned
//! stack. Outputs are refreshed lazily and the subnet is looked up once when
//! neither the stack nor the caller supplied one.

use crate::api::{
    AwsVpcConfig, ComputeApi, ContainerOverride, KeyValue, LaunchType, RunTaskRequest, StackApi,
    SubnetQuery, Tag,
};
use crate::driver::TaskInfo;
use crate::handle::TaskHandle;
use crate::provisioner::StackProvisioner;
use chrono::{SecondsFormat, Utc};
use crun_foundation::{current_user, Error, Result, DEFAULT_CONTAINER_NAME};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Reason recorded on tasks stopped through `stop`
pub const STOP_REASON: &str = "stopped by user";

/// `startedBy` allows letters, digits, hyphens and underscores
fn sanitize_started_by(user: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    INVALID
        .get_or_init(|| Regex::new(r"[^a-zA-Z0-9_-]+").expect("static regex"))
        .replace_all(user, "_")
        .into_owned()
}

/// Fill in whichever of VPC and subnet is missing from the other.
///
/// A VPC without a subnet resolves to its first public subnet; a subnet
/// without a VPC resolves to the subnet's VPC.
pub async fn resolve_network<C>(
    compute: &C,
    vpc_id: Option<String>,
    subnet_id: Option<String>,
) -> Result<(Option<String>, Option<String>)>
where
    C: ComputeApi + ?Sized,
{
    match (vpc_id, subnet_id) {
        (Some(vpc_id), None) => {
            let subnet = first_public_subnet(compute, &vpc_id).await?;
            Ok((Some(vpc_id), Some(subnet)))
        }
        (None, Some(subnet_id)) => {
            let subnets = compute
                .describe_subnets(&SubnetQuery {
                    subnet_ids: vec![subnet_id.clone()],
                    ..Default::default()
                })
                .await?;
            let subnet = subnets.into_iter().next().ok_or_else(|| {
                Error::Config(format!("subnet {} not found", subnet_id))
            })?;
            Ok((Some(subnet.vpc_id), Some(subnet_id)))
        }
        other => Ok(other),
    }
}

async fn first_public_subnet<C>(compute: &C, vpc_id: &str) -> Result<String>
where
    C: ComputeApi + ?Sized,
{
    let subnets = compute
        .describe_subnets(&SubnetQuery {
            vpc_id: Some(vpc_id.to_string()),
            public_only: true,
            ..Default::default()
        })
        .await?;
    // First match; not configurable yet
    subnets
        .into_iter()
        .next()
        .map(|s| s.subnet_id)
        .ok_or_else(|| Error::Config(format!("no public subnet found in VPC {}", vpc_id)))
}

/// Launches tasks on the provisioner's stack
pub struct TaskRunner<S: StackApi, C: ComputeApi> {
    provisioner: Arc<StackProvisioner<S>>,
    compute: Arc<C>,
    container_name: String,
    vpc_id: Option<String>,
    subnet_id: Option<String>,
    security_group_id: Option<String>,
    user: String,
}

impl<S: StackApi, C: ComputeApi> TaskRunner<S, C> {
    pub fn new(provisioner: Arc<StackProvisioner<S>>, compute: Arc<C>) -> Self {
        Self {
            provisioner,
            compute,
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            vpc_id: None,
            subnet_id: None,
            security_group_id: None,
            user: current_user(),
        }
    }

    /// Container that receives the command/environment override
    pub fn with_container_name(mut self, name: impl Into<String>) -> Self {
        self.container_name = name.into();
        self
    }

    /// VPC searched when the stack reports no subnet
    pub fn with_vpc(mut self, vpc_id: Option<String>) -> Self {
        self.vpc_id = vpc_id;
        self
    }

    /// Subnet used instead of the stack's
    pub fn with_subnet(mut self, subnet_id: Option<String>) -> Self {
        self.subnet_id = subnet_id;
        self
    }

    /// Security group used instead of the stack's; disables public IPs
    pub fn with_security_group(mut self, security_group_id: Option<String>) -> Self {
        self.security_group_id = security_group_id;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    async fn subnet(&self, stack_subnet: &str) -> Result<String> {
        if let Some(subnet) = &self.subnet_id {
            return Ok(subnet.clone());
        }
        if !stack_subnet.is_empty() {
            return Ok(stack_subnet.to_string());
        }
        let vpc_id = self
            .vpc_id
            .as_deref()
            .ok_or_else(|| Error::Config("no subnet available: set a VPC or subnet id".into()))?;
        let subnet = first_public_subnet(self.compute.as_ref(), vpc_id).await?;
        debug!("using subnet {} of VPC {}", subnet, vpc_id);
        self.provisioner.outputs().set_subnet(subnet.clone());
        Ok(subnet)
    }

    /// Launch one task with `cmd` and `env` overriding the main container
    pub async fn run(&self, env: &BTreeMap<String, String>, cmd: &[String]) -> Result<TaskHandle> {
        let outputs = self.provisioner.ensure_outputs().await?;
        let subnet = self.subnet(&outputs.subnet).await?;

        let (security_groups, assign_public_ip) = match &self.security_group_id {
            Some(group) => (vec![group.clone()], false),
            None => (vec![outputs.security_group.clone()], true),
        };

        let request = RunTaskRequest {
            cluster: outputs.cluster.clone(),
            task_definition: outputs.task_definition.clone(),
            count: 1,
            launch_type: LaunchType::Fargate,
            started_by: sanitize_started_by(&self.user),
            network: AwsVpcConfig {
                subnets: vec![subnet],
                security_groups,
                assign_public_ip,
            },
            overrides: vec![ContainerOverride {
                name: self.container_name.clone(),
                command: cmd.to_vec(),
                environment: env
                    .iter()
                    .map(|(name, value)| KeyValue {
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect(),
            }],
            tags: vec![
                Tag::new(
                    "StartedAt",
                    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
                Tag::new("StartedBy", self.user.clone()),
            ],
            propagate_task_definition_tags: true,
        };

        let response = self.compute.run_task(request).await?;
        if !response.failures.is_empty() {
            return Err(Error::launch_failures(
                response.failures.into_iter().map(|f| (f.reason, f.detail)),
            ));
        }
        let task = response
            .tasks
            .into_iter()
            .next()
            .ok_or_else(|| Error::Launch(vec!["no task started".to_string()]))?;

        let handle = TaskHandle::parse(&task.task_arn)?;
        info!("Started task {}", handle.task_id());
        Ok(handle)
    }

    /// Ask the control plane to stop the task
    pub async fn stop(&self, handle: &TaskHandle) -> Result<()> {
        self.compute
            .stop_task(handle.cluster(), handle.task_id(), STOP_REASON)
            .await
    }

    /// Last status and public IP of the task
    pub async fn info(&self, handle: &TaskHandle) -> Result<TaskInfo> {
        let task = self
            .compute
            .describe_task(handle.cluster(), handle.task_id())
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {}", handle.task_id())))?;
        Ok(TaskInfo {
            status: task.last_status,
            ip: task.public_ip,
        })
    }
}
