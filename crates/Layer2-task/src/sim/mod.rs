//! In-memory control plane
//!
//! `SimCloud` implements `StackApi`, `ComputeApi` and `LogApi` with the
//! provider's observable behaviour: stacks converge over a few describe
//! calls, tasks follow a `TaskScript`, log streams appear late and live
//! tails deliver only lines written after the session started.
//!
//! Used by the `sim` region and by the engine's tests.

mod compute;
mod logs;
mod script;
mod stacks;

pub use script::TaskScript;

use crate::api::{LaunchFailure, StackDescription, StackOutput, StackParameter, StackStatus, Subnet};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub const SIM_ACCOUNT: &str = "123456789012";
pub const SIM_VPC: &str = "vpc-0sim";

// ============================================================================
// State
// ============================================================================

/// Stack operation that completes after a number of describe calls
#[derive(Debug, Clone)]
enum PendingOp {
    Create,
    Update {
        template: String,
        parameters: Vec<StackParameter>,
        failure: Option<String>,
    },
    Delete,
}

#[derive(Debug, Clone)]
struct Pending {
    op: PendingOp,
    remaining: u32,
}

#[derive(Debug, Clone)]
struct SimStack {
    stack_id: String,
    suffix: String,
    status: StackStatus,
    status_reason: Option<String>,
    pending: Option<Pending>,
    template: String,
    parameters: Vec<StackParameter>,
    outputs: Vec<StackOutput>,
    termination_protection: bool,
    revision: u32,
}

impl SimStack {
    fn describe(&self, name: &str) -> StackDescription {
        StackDescription {
            stack_id: self.stack_id.clone(),
            stack_name: name.to_string(),
            status: self.status,
            status_reason: self.status_reason.clone(),
            outputs: self.outputs.clone(),
            parameters: self.parameters.clone(),
            termination_protection: self.termination_protection,
        }
    }
}

#[derive(Debug, Clone)]
struct SimTask {
    arn: String,
    cluster: String,
    container: String,
    log_group: String,
    stream: String,
    started_at: DateTime<Utc>,
    script: TaskScript,
    /// Set by `stop_task`
    stopped: Option<(DateTime<Utc>, String)>,
}

#[derive(Debug, Default)]
struct SimState {
    stacks: HashMap<String, SimStack>,
    /// Log group name -> owning stack
    log_groups: HashMap<String, String>,
    tasks: HashMap<String, SimTask>,
    subnets: Vec<Subnet>,
    scripts: VecDeque<TaskScript>,
    launch_rejections: VecDeque<LaunchFailure>,
    update_failures: VecDeque<String>,
    /// (code, message) returned by the next `update_stack` calls
    update_rejections: VecDeque<(String, String)>,
    /// Creates that lose to a concurrent creator
    create_races: u32,
    throttled_describes: u32,
    stack_calls: HashMap<&'static str, usize>,
}

struct Inner {
    region: String,
    account: String,
    settle_polls: u32,
    tail_poll_interval: Duration,
    open_tails: Mutex<usize>,
    state: Mutex<SimState>,
}

// ============================================================================
// SimCloud
// ============================================================================

/// In-memory control plane shared by every clone
#[derive(Clone)]
pub struct SimCloud {
    inner: Arc<Inner>,
}

impl SimCloud {
    pub fn new(region: impl Into<String>) -> Self {
        Self::builder(region).build()
    }

    pub fn builder(region: impl Into<String>) -> SimCloudBuilder {
        SimCloudBuilder {
            region: region.into(),
            settle_polls: 1,
            tail_poll_interval: Duration::from_millis(10),
        }
    }

    pub fn region(&self) -> &str {
        &self.inner.region
    }

    pub fn account(&self) -> &str {
        &self.inner.account
    }

    // ========================================================================
    // Scripting
    // ========================================================================

    /// Behaviour of the next launched task (FIFO); unscripted tasks echo
    /// their command
    pub fn push_script(&self, script: TaskScript) {
        self.inner.state.lock().scripts.push_back(script);
    }

    /// Reject the next launch with `reason`
    pub fn reject_next_launch(&self, reason: impl Into<String>, detail: impl Into<String>) {
        self.inner
            .state
            .lock()
            .launch_rejections
            .push_back(LaunchFailure {
                arn: None,
                reason: reason.into(),
                detail: detail.into(),
            });
    }

    /// Roll back the next stack update with `reason`
    pub fn fail_next_update(&self, reason: impl Into<String>) {
        self.inner
            .state
            .lock()
            .update_failures
            .push_back(reason.into());
    }

    /// Reject the next `update_stack` call itself with an API error
    pub fn reject_next_update(&self, code: impl Into<String>, message: impl Into<String>) {
        self.inner
            .state
            .lock()
            .update_rejections
            .push_back((code.into(), message.into()));
    }

    /// The next `create_stack` starts the stack but answers `AlreadyExistsException`,
    /// as if another client created it first
    pub fn race_next_create(&self) {
        self.inner.state.lock().create_races += 1;
    }

    /// Answer the next `count` stack describes with a throttling error
    pub fn throttle_describes(&self, count: u32) {
        self.inner.state.lock().throttled_describes += count;
    }

    pub fn add_subnet(&self, subnet: Subnet) {
        self.inner.state.lock().subnets.push(subnet);
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// How many times a stack operation (`create`, `update`, `delete`) was called
    pub fn stack_calls(&self, operation: &str) -> usize {
        self.inner
            .state
            .lock()
            .stack_calls
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn stack_exists(&self, name: &str) -> bool {
        self.inner.state.lock().stacks.contains_key(name)
    }

    /// Current template body of a stack
    pub fn template(&self, name: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .stacks
            .get(name)
            .map(|s| s.template.clone())
    }

    /// Live tail sessions whose producer is still running
    pub fn open_tails(&self) -> usize {
        *self.inner.open_tails.lock()
    }

    pub fn task_count(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }
}

pub struct SimCloudBuilder {
    region: String,
    settle_polls: u32,
    tail_poll_interval: Duration,
}

impl SimCloudBuilder {
    /// Describe calls a stack stays in progress before settling
    pub fn settle_polls(mut self, polls: u32) -> Self {
        self.settle_polls = polls;
        self
    }

    /// How often live tails look for new lines
    pub fn tail_poll_interval(mut self, interval: Duration) -> Self {
        self.tail_poll_interval = interval;
        self
    }

    pub fn build(self) -> SimCloud {
        let state = SimState {
            subnets: vec![
                Subnet {
                    subnet_id: "subnet-0private".into(),
                    vpc_id: SIM_VPC.into(),
                    map_public_ip_on_launch: false,
                },
                Subnet {
                    subnet_id: "subnet-0public".into(),
                    vpc_id: SIM_VPC.into(),
                    map_public_ip_on_launch: true,
                },
            ],
            ..Default::default()
        };
        SimCloud {
            inner: Arc::new(Inner {
                region: self.region,
                account: SIM_ACCOUNT.to_string(),
                settle_polls: self.settle_polls,
                tail_poll_interval: self.tail_poll_interval,
                open_tails: Mutex::new(0),
                state: Mutex::new(state),
            }),
        }
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_uppercase()
}
