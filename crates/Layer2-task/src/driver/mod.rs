//! Task drivers
//!
//! Provides the execution backends behind the CLI:
//! - `CloudDriver` - Fargate tasks on a provisioned stack
//! - `DockerDriver` - local containers through the Docker daemon
//!
//! `connect` picks one from the configured region.

pub mod cloud;
pub mod docker;
pub mod r#trait;

pub use cloud::CloudDriver;
pub use docker::{local_handle, DockerDriver};
pub use r#trait::{Driver, TaskInfo};

use crate::sim::SimCloud;
use crun_foundation::{CrunConfig, Error, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Regions served by the local Docker driver
pub const LOCAL_REGIONS: &[&str] = &["", "docker", "local"];

/// Region served by the in-memory control plane
pub const SIM_REGION: &str = "sim";

/// Driver for the configured region
pub async fn connect(config: &CrunConfig, cancel: CancellationToken) -> Result<Box<dyn Driver>> {
    let region = config.region();
    if LOCAL_REGIONS.contains(&region) {
        return Ok(Box::new(DockerDriver::connect()?.with_cancel(cancel)));
    }
    if region == SIM_REGION {
        let cloud = Arc::new(SimCloud::new(SIM_REGION));
        let driver = CloudDriver::new(
            Arc::clone(&cloud),
            Arc::clone(&cloud),
            cloud,
            config,
            cancel,
        )
        .await?;
        return Ok(Box::new(driver));
    }
    Err(Error::Config(format!("unsupported region: {}", region)))
}
