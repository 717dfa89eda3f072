//! # crun-task
//!
//! Provisioning, task execution and live log multiplexing for crun.
//!
//! ## Features
//!
//! - Idempotent stack upsert with convergence waits (`StackProvisioner`)
//! - One-shot task launch against the provisioned stack (`TaskRunner`)
//! - Live tails that tolerate late log destinations (`StreamMultiplexer`)
//! - Terminal outcome detection (`TaskStatusMonitor`)
//! - Tail-until-exit sessions (`TailSession`)
//! - Cloud and local Docker drivers behind one `Driver` trait
//! - An in-memory control plane for the `sim` region and for tests

pub mod api;
pub mod container;
pub mod driver;
pub mod handle;
pub mod log;
pub mod monitor;
pub mod multiplexer;
pub mod outputs;
pub mod provisioner;
pub mod runner;
pub mod session;
pub mod sim;
pub mod sizing;
pub mod source;
pub mod state;
pub mod template;
pub mod waiter;

// Control plane
pub use api::{ComputeApi, LogApi, StackApi};

// Provisioning
pub use container::{ContainerSpec, Platform, VolumeMount};
pub use outputs::{InfraOutputs, SharedOutputs};
pub use provisioner::StackProvisioner;
pub use template::TemplateOptions;
pub use waiter::{StackOperation, WaitConfig};

// Tasks
pub use handle::TaskHandle;
pub use monitor::{StatusWatch, TaskStatusMonitor};
pub use runner::TaskRunner;
pub use state::TaskOutcome;

// Logs
pub use log::{LiveEventStream, LogEvent, StreamCloser, TailEvent};
pub use multiplexer::{StreamMultiplexer, StreamState};
pub use session::{LogSink, TailConfig, TailSession};
pub use source::{CloudLogSource, LogDestination, LogSource};

// Drivers
pub use driver::{CloudDriver, DockerDriver, Driver, TaskInfo};
pub use sim::{SimCloud, TaskScript};
