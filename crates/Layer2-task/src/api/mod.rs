//! Control-plane interfaces
//!
//! - `r#trait` - `StackApi`, `ComputeApi`, `LogApi`
//! - `types` - request/response shapes

pub mod r#trait;
pub mod types;

pub use r#trait::{ComputeApi, LogApi, StackApi};
pub use types::{
    AwsVpcConfig, ContainerOverride, ContainerState, CreateStackRequest, FilterLogEventsRequest,
    KeyValue, LaunchFailure, LaunchType, LiveTailRequest, LogEventsPage, OnFailure,
    RunTaskRequest, RunTaskResponse, StackDescription, StackOutput, StackParameter, StackStatus,
    Subnet, SubnetQuery, Tag, TaskDescription, UpdateStackRequest,
};
