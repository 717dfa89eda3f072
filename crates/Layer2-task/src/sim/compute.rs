//! Simulated task execution

use super::script::at;
use super::{SimCloud, SimState, SimTask, TaskScript};
use crate::outputs::OUTPUT_CLUSTER_NAME;
use crate::api::{
    ComputeApi, ContainerState, RunTaskRequest, RunTaskResponse, Subnet, SubnetQuery,
    TaskDescription,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crun_foundation::{Error, Result, DEFAULT_CONTAINER_NAME, PROJECT_NAME};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "ecs";

/// Log group and stream prefix the task definition's log driver writes to
fn log_configuration(template: &str, container: &str) -> Option<(String, String)> {
    let template: Value = serde_json::from_str(template).ok()?;
    let resources = template["Resources"].as_object()?;
    let definition = resources
        .values()
        .find(|r| r["Type"] == "AWS::ECS::TaskDefinition")?;
    let containers = definition["Properties"]["ContainerDefinitions"].as_array()?;
    let options = &containers
        .iter()
        .find(|c| c["Name"] == container)?["LogConfiguration"]["Options"];
    let group = options["awslogs-group"]["Ref"].as_str()?.to_string();
    let prefix = options["awslogs-stream-prefix"]
        .as_str()
        .unwrap_or(PROJECT_NAME)
        .to_string();
    Some((group, prefix))
}

impl SimTask {
    fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// When the task stops, by itself or through `stop_task`
    pub(super) fn stopped_at(&self) -> DateTime<Utc> {
        let natural = at(self.started_at, self.script.stop_offset());
        match &self.stopped {
            Some((when, _)) if *when < natural => *when,
            _ => natural,
        }
    }

    /// The log stream exists once the log driver wrote to it
    pub(super) fn stream_exists(&self, now: DateTime<Utc>) -> bool {
        let created = at(self.started_at, self.script.log_delay);
        now >= created && self.stopped_at() >= created
    }

    /// Lines written up to `now`, with their timestamps
    pub(super) fn written(&self, now: DateTime<Utc>) -> Vec<(usize, DateTime<Utc>, &str)> {
        let until = now.min(self.stopped_at());
        self.script
            .lines
            .iter()
            .enumerate()
            .map(|(i, line)| (i, at(self.started_at, self.script.line_offset(i)), line.as_str()))
            .take_while(|(_, ts, _)| *ts <= until)
            .collect()
    }

    fn describe(&self, now: DateTime<Utc>) -> Option<TaskDescription> {
        let elapsed = self.elapsed(now);
        if elapsed < self.script.visibility_delay {
            return None;
        }
        let mut description = TaskDescription {
            task_arn: self.arn.clone(),
            last_status: "RUNNING".into(),
            desired_status: "RUNNING".into(),
            stop_code: None,
            stopped_reason: None,
            containers: vec![ContainerState {
                name: self.container.clone(),
                exit_code: None,
                reason: None,
            }],
            public_ip: Some("203.0.113.10".into()),
            started_at: Some(self.started_at),
        };

        if now >= self.stopped_at() {
            description.last_status = "STOPPED".into();
            description.desired_status = "STOPPED".into();
            description.public_ip = None;
            match &self.stopped {
                Some((_, reason)) => {
                    description.stop_code = Some("UserInitiated".into());
                    description.stopped_reason = Some(reason.clone());
                }
                None => {
                    description.stop_code = Some("EssentialContainerExited".into());
                    description.stopped_reason = Some("Essential container in task exited".into());
                    description.containers[0].exit_code = Some(self.script.exit_code);
                }
            }
        } else if elapsed < self.script.pending_for {
            description.last_status = "PENDING".into();
            description.public_ip = None;
        }
        Some(description)
    }
}

impl SimCloud {
    /// Log group and stream prefix for a task launched on `cluster`
    fn launch_target(&self, state: &SimState, cluster: &str, container: &str) -> Result<(String, String)> {
        let (name, stack) = state
            .stacks
            .iter()
            .find(|(_, stack)| {
                stack
                    .outputs
                    .iter()
                    .any(|o| o.key == OUTPUT_CLUSTER_NAME && o.value == cluster)
            })
            .ok_or_else(|| Error::api(SERVICE, "ClusterNotFoundException", "Cluster not found."))?;

        let (logical_group, prefix) = log_configuration(&stack.template, container)
            .unwrap_or_else(|| ("LogGroup".to_string(), PROJECT_NAME.to_string()));
        let group = self.physical_id(
            name,
            &stack.suffix,
            stack.revision,
            &logical_group,
            "AWS::Logs::LogGroup",
        );
        Ok((group, prefix))
    }
}

#[async_trait]
impl ComputeApi for SimCloud {
    async fn run_task(&self, request: RunTaskRequest) -> Result<RunTaskResponse> {
        let mut state = self.inner.state.lock();
        let container = request
            .overrides
            .first()
            .map(|o| o.name.clone())
            .unwrap_or_else(|| DEFAULT_CONTAINER_NAME.to_string());
        let (log_group, prefix) = self.launch_target(&state, &request.cluster, &container)?;

        if let Some(failure) = state.launch_rejections.pop_front() {
            return Ok(RunTaskResponse {
                tasks: Vec::new(),
                failures: vec![failure],
            });
        }

        let command = request
            .overrides
            .first()
            .map(|o| o.command.clone())
            .unwrap_or_default();
        let script = state
            .scripts
            .pop_front()
            .unwrap_or_else(|| TaskScript::echo(&command));

        let task_id = uuid::Uuid::new_v4().simple().to_string();
        let arn = format!(
            "arn:aws:ecs:{}:{}:task/{}/{}",
            self.inner.region, self.inner.account, request.cluster, task_id
        );
        let task = SimTask {
            arn,
            cluster: request.cluster.clone(),
            stream: format!("{}/{}/{}", prefix, container, task_id),
            container,
            log_group,
            started_at: Utc::now(),
            script,
            stopped: None,
        };
        debug!("sim: started task {} writing to {}", task_id, task.stream);
        let description = task.describe(task.started_at);
        state.tasks.insert(task_id, task.clone());

        Ok(RunTaskResponse {
            tasks: vec![description.unwrap_or(TaskDescription {
                task_arn: task.arn,
                last_status: "PROVISIONING".into(),
                desired_status: "RUNNING".into(),
                stop_code: None,
                stopped_reason: None,
                containers: Vec::new(),
                public_ip: None,
                started_at: None,
            })],
            failures: Vec::new(),
        })
    }

    async fn describe_task(&self, cluster: &str, task: &str) -> Result<Option<TaskDescription>> {
        let state = self.inner.state.lock();
        Ok(state
            .tasks
            .get(task)
            .filter(|t| t.cluster == cluster)
            .and_then(|t| t.describe(Utc::now())))
    }

    async fn stop_task(&self, cluster: &str, task: &str, reason: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        let task = state
            .tasks
            .get_mut(task)
            .filter(|t| t.cluster == cluster)
            .ok_or_else(|| {
                Error::api(SERVICE, "InvalidParameterException", "The referenced task was not found.")
            })?;
        if task.stopped.is_none() {
            task.stopped = Some((Utc::now(), reason.to_string()));
        }
        Ok(())
    }

    async fn describe_subnets(&self, query: &SubnetQuery) -> Result<Vec<Subnet>> {
        let state = self.inner.state.lock();
        Ok(state
            .subnets
            .iter()
            .filter(|s| query.vpc_id.as_ref().map_or(true, |vpc| &s.vpc_id == vpc))
            .filter(|s| query.subnet_ids.is_empty() || query.subnet_ids.contains(&s.subnet_id))
            .filter(|s| !query.public_only || s.map_public_ip_on_launch)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        AwsVpcConfig, ContainerOverride, CreateStackRequest, LaunchType, OnFailure, StackApi,
    };
    use crate::container::ContainerSpec;
    use crate::template::{render, TemplateOptions};

    async fn provisioned(sim: &SimCloud) -> String {
        let body = render(
            "crun",
            &[ContainerSpec::new("alpine")],
            &TemplateOptions::default(),
        )
        .unwrap();
        sim.create_stack(CreateStackRequest {
            stack_name: "crun".into(),
            template_body: body,
            parameters: vec![],
            termination_protection: true,
            on_failure: OnFailure::Delete,
        })
        .await
        .unwrap();
        sim.describe_stack("crun").await.unwrap();
        let stack = sim.describe_stack("crun").await.unwrap();
        stack.output("ClusterName").unwrap().to_string()
    }

    fn request(cluster: &str) -> RunTaskRequest {
        RunTaskRequest {
            cluster: cluster.into(),
            task_definition: "td".into(),
            count: 1,
            launch_type: LaunchType::Fargate,
            started_by: "test".into(),
            network: AwsVpcConfig {
                subnets: vec!["subnet-0public".into()],
                security_groups: vec![],
                assign_public_ip: true,
            },
            overrides: vec![ContainerOverride {
                name: "main".into(),
                command: vec!["echo".into(), "hi".into()],
                environment: vec![],
            }],
            tags: vec![],
            propagate_task_definition_tags: true,
        }
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let sim = SimCloud::new("sim");
        let cluster = provisioned(&sim).await;
        sim.push_script(
            TaskScript::new(["one"])
                .with_exit_code(3)
                .with_pending_for(Duration::from_millis(20))
                .with_run_time(Duration::from_millis(60)),
        );

        let response = sim.run_task(request(&cluster)).await.unwrap();
        let arn = response.tasks[0].task_arn.clone();
        assert_eq!(response.tasks[0].last_status, "PENDING");
        let task_id = arn.rsplit('/').next().unwrap().to_string();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stopped = sim.describe_task(&cluster, &task_id).await.unwrap().unwrap();
        assert_eq!(stopped.last_status, "STOPPED");
        assert_eq!(stopped.stop_code.as_deref(), Some("EssentialContainerExited"));
        assert_eq!(stopped.containers[0].exit_code, Some(3));

        assert!(sim.describe_task("other", &task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_launch_rejection_and_unknown_cluster() {
        let sim = SimCloud::new("sim");
        let cluster = provisioned(&sim).await;

        sim.reject_next_launch("RESOURCE:FARGATE", "capacity exceeded");
        let response = sim.run_task(request(&cluster)).await.unwrap();
        assert!(response.tasks.is_empty());
        assert_eq!(response.failures[0].detail, "capacity exceeded");

        let err = sim.run_task(request("missing")).await.unwrap_err();
        assert_eq!(err.code(), Some("ClusterNotFoundException"));
    }

    #[tokio::test]
    async fn test_describe_subnets_filters() {
        let sim = SimCloud::new("sim");
        let public = sim
            .describe_subnets(&SubnetQuery {
                vpc_id: Some(super::super::SIM_VPC.into()),
                public_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].subnet_id, "subnet-0public");

        let by_id = sim
            .describe_subnets(&SubnetQuery {
                subnet_ids: vec!["subnet-0private".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_id[0].vpc_id, super::super::SIM_VPC);
    }
}
