//! Cloud driver - Fargate tasks on a provisioned stack

use super::{Driver, TaskInfo};
use crate::api::{ComputeApi, LogApi, StackApi};
use crate::container::ContainerSpec;
use crate::handle::TaskHandle;
use crate::monitor::TaskStatusMonitor;
use crate::outputs::InfraOutputs;
use crate::provisioner::StackProvisioner;
use crate::runner::{resolve_network, TaskRunner};
use crate::session::{LogSink, TailConfig, TailSession};
use crate::source::CloudLogSource;
use crate::state::TaskOutcome;
use crate::template::TemplateOptions;
use crate::waiter::WaitConfig;
use async_trait::async_trait;
use crun_foundation::{CrunConfig, Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Runs tasks against one stack through the control-plane capabilities
pub struct CloudDriver<S: StackApi, C: ComputeApi, L: LogApi> {
    provisioner: Arc<StackProvisioner<S>>,
    runner: TaskRunner<S, C>,
    monitor: TaskStatusMonitor<C>,
    logs: Arc<CloudLogSource<L>>,
    tail_config: TailConfig,
    cancel: CancellationToken,
}

impl<S, C, L> CloudDriver<S, C, L>
where
    S: StackApi + 'static,
    C: ComputeApi + 'static,
    L: LogApi + 'static,
{
    /// Build a driver for `config`.
    ///
    /// A VPC without a subnet (or the reverse) is completed here, before the
    /// template options are fixed. `cancel` aborts stack waits and tails.
    pub async fn new(
        stacks: Arc<S>,
        compute: Arc<C>,
        logs: Arc<L>,
        config: &CrunConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let provision = &config.provision;
        let (vpc_id, subnet_id) = resolve_network(
            compute.as_ref(),
            provision.vpc_id.clone(),
            provision.subnet_id.clone(),
        )
        .await?;
        debug!("network: vpc={:?} subnet={:?}", vpc_id, subnet_id);

        let options = TemplateOptions {
            spot: provision.spot(),
            vpc_id: vpc_id.clone(),
            retain_bucket: provision.retain_bucket(),
            stream_prefix: config.logs.stream_prefix.clone(),
            default_container_name: config.logs.container_name.clone(),
        };
        let wait = WaitConfig {
            poll_interval: config.timing.stack_poll_interval(),
            timeout: config.timing.stack_timeout(),
        };
        let provisioner = Arc::new(
            StackProvisioner::new(stacks, config.resolved_stack_name())?
                .with_template_options(options)
                .with_wait_config(wait)
                .with_cancel(cancel.clone()),
        );

        let runner = TaskRunner::new(Arc::clone(&provisioner), Arc::clone(&compute))
            .with_container_name(config.logs.container_name.clone())
            .with_vpc(vpc_id)
            .with_subnet(subnet_id)
            .with_security_group(provision.security_group_id.clone());

        Ok(Self {
            provisioner,
            runner,
            monitor: TaskStatusMonitor::new(compute),
            logs: Arc::new(CloudLogSource::new(logs).with_config(&config.logs)),
            tail_config: TailConfig::from_config(config),
            cancel,
        })
    }

    pub fn provisioner(&self) -> &StackProvisioner<S> {
        &self.provisioner
    }

    /// Outputs bound so far
    pub fn outputs(&self) -> InfraOutputs {
        self.provisioner.outputs().snapshot()
    }
}

#[async_trait]
impl<S, C, L> Driver for CloudDriver<S, C, L>
where
    S: StackApi + 'static,
    C: ComputeApi + 'static,
    L: LogApi + 'static,
{
    async fn set_up(&self, containers: &[ContainerSpec]) -> Result<()> {
        self.provisioner.set_up(containers).await
    }

    async fn tear_down(&self) -> Result<()> {
        self.provisioner.tear_down().await
    }

    async fn run(&self, env: &BTreeMap<String, String>, cmd: &[String]) -> Result<TaskHandle> {
        self.runner.run(env, cmd).await
    }

    async fn tail(&self, handle: &TaskHandle, sink: &mut dyn LogSink) -> Result<TaskOutcome> {
        let outputs = self.provisioner.ensure_outputs().await?;
        TailSession::new(
            Arc::clone(&self.logs),
            self.monitor.clone(),
            self.tail_config.clone(),
        )
        .with_cancel(self.cancel.child_token())
        .run(handle, &outputs.log_group, sink)
        .await
    }

    async fn stop(&self, handle: &TaskHandle) -> Result<()> {
        self.runner.stop(handle).await
    }

    async fn info(&self, handle: &TaskHandle) -> Result<TaskInfo> {
        self.runner.info(handle).await
    }

    async fn resolve(&self, task: &str) -> Result<TaskHandle> {
        if let Ok(handle) = TaskHandle::parse(task) {
            return Ok(handle);
        }
        let outputs = self.provisioner.ensure_outputs().await?;
        match (outputs.region(), outputs.account_id()) {
            (Some(region), Some(account)) if !outputs.cluster.is_empty() => {
                TaskHandle::from_task_id(task, region, account, &outputs.cluster)
            }
            _ => Err(Error::Config(format!(
                "stack {} does not report a cluster and log group",
                self.provisioner.stack_name()
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "cloud"
    }
}
