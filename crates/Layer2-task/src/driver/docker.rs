//! Docker driver - runs the task as a local container

use super::{Driver, TaskInfo};
use crate::container::{common_platform, ContainerSpec};
use crate::handle::TaskHandle;
use crate::log::LogEvent;
use crate::session::LogSink;
use crate::state::TaskOutcome;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig};
use bollard::Docker;
use chrono::Utc;
use crun_foundation::{Error, Result, PROJECT_NAME};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Region, account and cluster of handles for local containers
pub const LOCAL_REGION: &str = "local";
pub const LOCAL_ACCOUNT: &str = "000000000000";
pub const LOCAL_CLUSTER: &str = "docker";

/// Handle for a local container id or name
pub fn local_handle(container: &str) -> Result<TaskHandle> {
    TaskHandle::from_task_id(container, LOCAL_REGION, LOCAL_ACCOUNT, LOCAL_CLUSTER)
}

fn docker_error(context: &'static str) -> impl Fn(bollard::errors::Error) -> Error {
    move |err| match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => Error::NotFound(format!("{}: {}", context, message)),
        err => Error::Docker(format!("{}: {}", context, err)),
    }
}

/// Outcome of a container that is no longer running
fn exit_outcome(inspect: &ContainerInspectResponse) -> TaskOutcome {
    let Some(state) = &inspect.state else {
        return TaskOutcome::failed("container state unavailable", None);
    };
    if state.running == Some(true) {
        return TaskOutcome::Running;
    }
    match state.exit_code {
        Some(0) => TaskOutcome::Succeeded,
        Some(code) if state.oom_killed == Some(true) => {
            TaskOutcome::failed(format!("OOMKilled with code {}", code), Some(code as i32))
        }
        Some(code) => TaskOutcome::failed(
            format!("container exited with code {}", code),
            Some(code as i32),
        ),
        None => TaskOutcome::failed(
            state
                .error
                .clone()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "container exited".to_string()),
            None,
        ),
    }
}

/// Runs tasks in local Docker containers
pub struct DockerDriver {
    /// Docker client
    docker: Docker,

    /// Container prepared by `set_up`
    spec: Mutex<Option<ContainerSpec>>,

    /// Last container started by `run`
    last_container: Mutex<Option<String>>,

    cancel: CancellationToken,
}

impl DockerDriver {
    /// Connect to the local Docker daemon
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(docker_error("connect"))?;
        Ok(Self {
            docker,
            spec: Mutex::new(None),
            last_container: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Abort tails when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn inspect(&self, container: &str) -> Result<ContainerInspectResponse> {
        self.docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(docker_error("inspect container"))
    }

    async fn remove(&self, container: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container, Some(options))
            .await
            .map_err(docker_error("remove container"))
    }
}

#[async_trait]
impl Driver for DockerDriver {
    async fn set_up(&self, containers: &[ContainerSpec]) -> Result<()> {
        let platform = common_platform(containers)?;
        let spec = containers
            .iter()
            .find(|c| !c.is_init)
            .or_else(|| containers.first())
            .ok_or_else(|| Error::Config("no containers to run".into()))?
            .clone();
        if containers.len() > 1 {
            warn!("the Docker driver only runs the first container");
        }

        info!("Pulling image {}...", spec.image);
        let options = CreateImageOptions {
            from_image: spec.image.clone(),
            platform: platform.map(|p| p.to_string()).unwrap_or_default(),
            ..Default::default()
        };
        let mut pull = Box::pin(self.docker.create_image(Some(options), None, None));
        while let Some(progress) = pull.next().await {
            let progress = progress.map_err(docker_error("pull image"))?;
            if let Some(status) = progress.status {
                debug!("{}", status);
            }
        }

        *self.spec.lock() = Some(spec);
        Ok(())
    }

    async fn tear_down(&self) -> Result<()> {
        let container = self.last_container.lock().take();
        if let Some(container) = container {
            match self.remove(&container).await {
                Err(err) if err.is_not_found() => {}
                other => other?,
            }
        }
        Ok(())
    }

    async fn run(&self, env: &BTreeMap<String, String>, cmd: &[String]) -> Result<TaskHandle> {
        let spec = self
            .spec
            .lock()
            .clone()
            .ok_or_else(|| Error::Config("set_up must run before run".into()))?;

        let command = if cmd.is_empty() {
            spec.command.clone()
        } else {
            cmd.to_vec()
        };
        let binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|v| {
                if v.read_only {
                    format!("{}:{}:ro", v.source, v.target)
                } else {
                    format!("{}:{}", v.source, v.target)
                }
            })
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
            cmd: (!command.is_empty()).then_some(command),
            env: Some(env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            working_dir: spec.working_dir.clone(),
            host_config: Some(HostConfig {
                memory: (spec.memory > 0).then_some(spec.memory as i64),
                nano_cpus: (spec.cpus > 0.0).then_some((spec.cpus as f64 * 1e9) as i64),
                binds: (!binds.is_empty()).then_some(binds),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: format!("{}-{}", PROJECT_NAME, uuid::Uuid::new_v4().simple()),
            platform: spec.platform.clone(),
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(docker_error("create container"))?;
        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(docker_error("start container"))?;

        *self.last_container.lock() = Some(response.id.clone());
        info!("Started container {}", response.id);
        local_handle(&response.id)
    }

    async fn tail(&self, handle: &TaskHandle, sink: &mut dyn LogSink) -> Result<TaskOutcome> {
        let container = handle.task_id();
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut logs = Box::pin(self.docker.logs(container, Some(options)));

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                chunk = logs.next() => match chunk {
                    Some(Ok(output)) => {
                        let stream = match &output {
                            LogOutput::StdErr { .. } => "stderr",
                            _ => "stdout",
                        };
                        let bytes = output.into_bytes();
                        let text = String::from_utf8_lossy(&bytes);
                        for line in text.lines() {
                            sink.emit(&LogEvent::new(stream, Utc::now(), line));
                        }
                    }
                    Some(Err(err)) => return Err(docker_error("container logs")(err)),
                    None => break,
                }
            }
        }

        // Logs end when the container stops
        let inspect = self.inspect(container).await?;
        Ok(exit_outcome(&inspect))
    }

    async fn stop(&self, handle: &TaskHandle) -> Result<()> {
        self.remove(handle.task_id()).await
    }

    async fn info(&self, handle: &TaskHandle) -> Result<TaskInfo> {
        let inspect = self.inspect(handle.task_id()).await?;
        let status = inspect
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string().to_uppercase())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let ip = inspect
            .network_settings
            .and_then(|n| n.ip_address)
            .filter(|ip| !ip.is_empty());
        Ok(TaskInfo { status, ip })
    }

    async fn resolve(&self, task: &str) -> Result<TaskHandle> {
        TaskHandle::parse(task).or_else(|_| local_handle(task))
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}
