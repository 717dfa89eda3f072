//! Simulated stack lifecycle

use super::{short_id, Pending, PendingOp, SimCloud, SimStack, SimState};
use crate::api::{
    CreateStackRequest, StackApi, StackDescription, StackOutput, StackParameter, StackStatus,
    Subnet, UpdateStackRequest,
};
use async_trait::async_trait;
use crun_foundation::{Error, Result};
use serde_json::Value;
use tracing::debug;

const SERVICE: &str = "cloudformation";

fn validation(message: impl Into<String>) -> Error {
    Error::api(SERVICE, "ValidationError", message)
}

fn missing(name: &str) -> Error {
    validation(format!("Stack [{}] does not exist", name))
}

fn parse_template(body: &str) -> Result<Value> {
    serde_json::from_str(body).map_err(|e| validation(format!("Template format error: {}", e)))
}

/// Parameter values after applying `use_previous_value`
fn resolve_parameters(
    requested: &[StackParameter],
    previous: &[StackParameter],
) -> Vec<StackParameter> {
    requested
        .iter()
        .map(|p| {
            let value = if p.use_previous_value {
                previous
                    .iter()
                    .find(|old| old.key == p.key)
                    .and_then(|old| old.value.clone())
                    .unwrap_or_default()
            } else {
                p.value.clone().unwrap_or_default()
            };
            StackParameter::value(p.key.clone(), value)
        })
        .collect()
}

impl SimCloud {
    pub(super) fn physical_id(
        &self,
        stack: &str,
        suffix: &str,
        revision: u32,
        logical: &str,
        kind: &str,
    ) -> String {
        let lower = suffix.to_lowercase();
        match kind {
            "AWS::ECS::TaskDefinition" => format!(
                "arn:aws:ecs:{}:{}:task-definition/{}-{}-{}:{}",
                self.inner.region, self.inner.account, stack, logical, suffix, revision
            ),
            "AWS::EC2::SecurityGroup" => format!("sg-{}", lower),
            "AWS::EC2::Subnet" => format!("subnet-{}", lower),
            "AWS::EC2::VPC" => format!("vpc-{}", lower),
            "AWS::S3::Bucket" => format!("{}-{}-{}", stack, logical, suffix).to_lowercase(),
            _ => format!("{}-{}-{}", stack, logical, suffix),
        }
    }

    fn arn_of(&self, kind: &str, physical: &str) -> String {
        match kind {
            "AWS::Logs::LogGroup" => format!(
                "arn:aws:logs:{}:{}:log-group:{}:*",
                self.inner.region, self.inner.account, physical
            ),
            _ => format!(
                "arn:aws:sim:{}:{}:{}",
                self.inner.region, self.inner.account, physical
            ),
        }
    }

    /// Evaluate an output value: literals, `Ref` and `Fn::GetAtt ... Arn`
    fn evaluate(&self, name: &str, stack: &SimStack, template: &Value, value: &Value) -> String {
        let kind_of = |logical: &str| {
            template["Resources"][logical]["Type"]
                .as_str()
                .map(str::to_string)
        };
        if let Some(literal) = value.as_str() {
            return literal.to_string();
        }
        if let Some(logical) = value["Ref"].as_str() {
            if logical == "AWS::Region" {
                return self.inner.region.clone();
            }
            if let Some(kind) = kind_of(logical) {
                return self.physical_id(name, &stack.suffix, stack.revision, logical, &kind);
            }
            return stack
                .parameters
                .iter()
                .find(|p| p.key == logical)
                .and_then(|p| p.value.clone())
                .unwrap_or_default();
        }
        if let Some([logical, attribute]) = value["Fn::GetAtt"].as_array().map(Vec::as_slice) {
            if let (Some(logical), Some("Arn")) = (logical.as_str(), attribute.as_str()) {
                if let Some(kind) = kind_of(logical) {
                    let physical =
                        self.physical_id(name, &stack.suffix, stack.revision, logical, &kind);
                    return self.arn_of(&kind, &physical);
                }
            }
        }
        value.to_string()
    }

    /// Bind outputs and register the log groups and subnets the template creates
    fn materialize(&self, state: &mut SimState, name: &str) -> Result<()> {
        let Some(stack) = state.stacks.get(name) else {
            return Ok(());
        };
        let template = parse_template(&stack.template)?;

        let mut outputs = Vec::new();
        if let Some(declared) = template["Outputs"].as_object() {
            for (key, output) in declared {
                let value = self.evaluate(name, stack, &template, &output["Value"]);
                outputs.push(StackOutput::new(key.clone(), value));
            }
        }

        let mut log_groups = Vec::new();
        let mut subnets = Vec::new();
        let mut vpc = None;
        if let Some(resources) = template["Resources"].as_object() {
            for (logical, resource) in resources {
                let kind = resource["Type"].as_str().unwrap_or_default();
                let physical = self.physical_id(name, &stack.suffix, stack.revision, logical, kind);
                match kind {
                    "AWS::Logs::LogGroup" => log_groups.push(physical),
                    "AWS::EC2::Subnet" => subnets.push(physical),
                    "AWS::EC2::VPC" => vpc = Some(physical),
                    _ => {}
                }
            }
        }

        for group in log_groups {
            state.log_groups.insert(group, name.to_string());
        }
        if let Some(vpc_id) = vpc {
            for subnet_id in subnets {
                if !state.subnets.iter().any(|s| s.subnet_id == subnet_id) {
                    state.subnets.push(Subnet {
                        subnet_id,
                        vpc_id: vpc_id.clone(),
                        map_public_ip_on_launch: true,
                    });
                }
            }
        }
        if let Some(stack) = state.stacks.get_mut(name) {
            stack.outputs = outputs;
        }
        Ok(())
    }

    /// Finish the pending operation of `name`
    fn settle(&self, state: &mut SimState, name: &str, op: PendingOp) -> Result<()> {
        match op {
            PendingOp::Create => {
                self.materialize(state, name)?;
                if let Some(stack) = state.stacks.get_mut(name) {
                    stack.status = StackStatus::CreateComplete;
                }
            }
            PendingOp::Update {
                failure: Some(reason),
                ..
            } => {
                if let Some(stack) = state.stacks.get_mut(name) {
                    stack.status = StackStatus::UpdateRollbackComplete;
                    stack.status_reason = Some(reason);
                }
            }
            PendingOp::Update {
                template,
                parameters,
                failure: None,
            } => {
                if let Some(stack) = state.stacks.get_mut(name) {
                    stack.template = template;
                    stack.parameters = parameters;
                    stack.revision += 1;
                    stack.status = StackStatus::UpdateComplete;
                    stack.status_reason = None;
                }
                self.materialize(state, name)?;
            }
            PendingOp::Delete => {
                state.stacks.remove(name);
                state.log_groups.retain(|_, owner| owner != name);
                debug!("sim: stack {} deleted", name);
            }
        }
        Ok(())
    }

    fn count_call(state: &mut SimState, operation: &'static str) {
        *state.stack_calls.entry(operation).or_default() += 1;
    }
}

#[async_trait]
impl StackApi for SimCloud {
    async fn describe_stack(&self, stack_name: &str) -> Result<StackDescription> {
        let mut state = self.inner.state.lock();
        if state.throttled_describes > 0 {
            state.throttled_describes -= 1;
            return Err(Error::api(SERVICE, "Throttling", "Rate exceeded"));
        }

        let stack = state
            .stacks
            .get_mut(stack_name)
            .ok_or_else(|| missing(stack_name))?;
        let due = match stack.pending.as_mut() {
            Some(pending) if pending.remaining > 0 => {
                pending.remaining -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        let finished = if due { stack.pending.take().map(|p| p.op) } else { None };
        if let Some(op) = finished {
            self.settle(&mut state, stack_name, op)?;
        }

        state
            .stacks
            .get(stack_name)
            .map(|stack| stack.describe(stack_name))
            .ok_or_else(|| missing(stack_name))
    }

    async fn create_stack(&self, request: CreateStackRequest) -> Result<String> {
        parse_template(&request.template_body)?;
        let mut state = self.inner.state.lock();
        Self::count_call(&mut state, "create");
        if state.stacks.contains_key(&request.stack_name) {
            return Err(Error::api(
                SERVICE,
                "AlreadyExistsException",
                format!("Stack [{}] already exists", request.stack_name),
            ));
        }

        let suffix = short_id();
        let stack_id = format!(
            "arn:aws:cloudformation:{}:{}:stack/{}/{}",
            self.inner.region,
            self.inner.account,
            request.stack_name,
            uuid::Uuid::new_v4()
        );
        state.stacks.insert(
            request.stack_name.clone(),
            SimStack {
                stack_id: stack_id.clone(),
                suffix,
                status: StackStatus::CreateInProgress,
                status_reason: None,
                pending: Some(Pending {
                    op: PendingOp::Create,
                    remaining: self.inner.settle_polls,
                }),
                template: request.template_body,
                parameters: resolve_parameters(&request.parameters, &[]),
                outputs: Vec::new(),
                termination_protection: request.termination_protection,
                revision: 1,
            },
        );
        if state.create_races > 0 {
            state.create_races -= 1;
            return Err(Error::api(
                SERVICE,
                "AlreadyExistsException",
                format!("Stack [{}] already exists", request.stack_name),
            ));
        }
        Ok(stack_id)
    }

    async fn update_stack(&self, request: UpdateStackRequest) -> Result<String> {
        parse_template(&request.template_body)?;
        let mut state = self.inner.state.lock();
        Self::count_call(&mut state, "update");
        if let Some((code, message)) = state.update_rejections.pop_front() {
            return Err(Error::api(SERVICE, code, message));
        }

        let stack = state
            .stacks
            .get_mut(&request.stack_name)
            .ok_or_else(|| missing(&request.stack_name))?;
        if stack.status.is_in_progress() {
            return Err(validation(format!(
                "Stack:{} is in {} state and can not be updated.",
                stack.stack_id, stack.status
            )));
        }

        let parameters = resolve_parameters(&request.parameters, &stack.parameters);
        let mut current = stack.parameters.clone();
        let mut requested = parameters.clone();
        current.sort_by(|a, b| a.key.cmp(&b.key));
        requested.sort_by(|a, b| a.key.cmp(&b.key));
        if stack.template == request.template_body && current == requested {
            return Err(validation("No updates are to be performed."));
        }

        let failure = state.update_failures.pop_front();
        let stack = state
            .stacks
            .get_mut(&request.stack_name)
            .ok_or_else(|| missing(&request.stack_name))?;
        stack.status = StackStatus::UpdateInProgress;
        stack.status_reason = None;
        stack.pending = Some(Pending {
            op: PendingOp::Update {
                template: request.template_body,
                parameters,
                failure,
            },
            remaining: self.inner.settle_polls,
        });
        Ok(stack.stack_id.clone())
    }

    async fn delete_stack(&self, stack_name: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        Self::count_call(&mut state, "delete");
        let stack = state
            .stacks
            .get_mut(stack_name)
            .ok_or_else(|| missing(stack_name))?;
        if stack.termination_protection {
            return Err(validation(format!(
                "Stack [{}] cannot be deleted while TerminationProtection is enabled",
                stack_name
            )));
        }
        if stack.status != StackStatus::DeleteInProgress {
            stack.status = StackStatus::DeleteInProgress;
            stack.pending = Some(Pending {
                op: PendingOp::Delete,
                remaining: self.inner.settle_polls,
            });
        }
        Ok(())
    }

    async fn update_termination_protection(&self, stack_name: &str, enabled: bool) -> Result<()> {
        let mut state = self.inner.state.lock();
        let stack = state
            .stacks
            .get_mut(stack_name)
            .ok_or_else(|| missing(stack_name))?;
        stack.termination_protection = enabled;
        Ok(())
    }
}
