//! Stack provisioning
//!
//! `StackProvisioner` performs an idempotent upsert of the rendered template:
//! update first, create only when the stack does not exist, then wait for
//! convergence and bind the stack outputs.

use crate::api::{CreateStackRequest, OnFailure, StackApi, StackDescription, StackParameter, UpdateStackRequest};
use crate::container::ContainerSpec;
use crate::outputs::{InfraOutputs, SharedOutputs};
use crate::template::{self, TemplateOptions, TEMPLATE_REVISION};
use crate::waiter::{is_no_updates, is_stack_missing, wait_for_stack, StackOperation, WaitConfig};
use crun_foundation::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owns one named stack and the outputs bound from it
pub struct StackProvisioner<S: StackApi> {
    api: Arc<S>,
    stack_name: String,
    options: TemplateOptions,
    wait: WaitConfig,
    outputs: SharedOutputs,
    cancel: CancellationToken,
}

impl<S: StackApi> StackProvisioner<S> {
    pub fn new(api: Arc<S>, stack_name: impl Into<String>) -> Result<Self> {
        let stack_name = stack_name.into();
        if stack_name.trim().is_empty() {
            return Err(Error::Config("stack name must be set".into()));
        }
        Ok(Self {
            api,
            stack_name,
            options: TemplateOptions::default(),
            wait: WaitConfig::default(),
            outputs: SharedOutputs::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_template_options(mut self, options: TemplateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_wait_config(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    /// Abort waits when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn stack_name(&self) -> &str {
        &self.stack_name
    }

    pub fn template_options(&self) -> &TemplateOptions {
        &self.options
    }

    /// Shared handle to the bound outputs
    pub fn outputs(&self) -> SharedOutputs {
        self.outputs.clone()
    }

    /// Upsert the stack for `containers` and wait for it to converge
    pub async fn set_up(&self, containers: &[ContainerSpec]) -> Result<()> {
        let body = template::render(&self.stack_name, containers, &self.options)?;
        let parameters = self.options.parameters();

        match self.update_and_wait(&body, parameters.clone()).await {
            Err(Error::StackNotFound(_)) => self.create_and_wait(&body, parameters).await,
            other => other,
        }
    }

    async fn update_and_wait(&self, body: &str, mut parameters: Vec<StackParameter>) -> Result<()> {
        match self.api.describe_stack(&self.stack_name).await {
            Ok(deployed) => {
                self.check_revision(&deployed)?;
                // Keep whatever the deployed stack has for parameters we no longer send
                let sent: HashSet<String> = parameters.iter().map(|p| p.key.clone()).collect();
                for previous in deployed.parameters {
                    if !sent.contains(&previous.key) {
                        parameters.push(StackParameter::previous(previous.key));
                    }
                }
            }
            Err(err) if is_stack_missing(&err) => {
                return Err(Error::StackNotFound(self.stack_name.clone()));
            }
            Err(err) => warn!("describe {} before update failed: {}", self.stack_name, err),
        }

        let request = UpdateStackRequest {
            stack_name: self.stack_name.clone(),
            template_body: body.to_string(),
            parameters,
        };
        match self.api.update_stack(request).await {
            Ok(stack_id) => debug!("update of {} started: {}", self.stack_name, stack_id),
            Err(err) if is_no_updates(&err) => {
                debug!("stack {} is up to date", self.stack_name);
                self.fill_outputs().await?;
                return Ok(());
            }
            Err(err) if is_stack_missing(&err) => {
                return Err(Error::StackNotFound(self.stack_name.clone()));
            }
            Err(err) => return Err(err),
        }

        info!("Waiting for stack {} to be updated...", self.stack_name);
        let description = wait_for_stack(
            self.api.as_ref(),
            &self.stack_name,
            StackOperation::Update,
            self.wait,
            &self.cancel,
        )
        .await?;
        self.bind(description);
        Ok(())
    }

    async fn create_and_wait(&self, body: &str, parameters: Vec<StackParameter>) -> Result<()> {
        let request = CreateStackRequest {
            stack_name: self.stack_name.clone(),
            template_body: body.to_string(),
            parameters,
            termination_protection: true,
            on_failure: OnFailure::Delete,
        };
        match self.api.create_stack(request).await {
            Ok(stack_id) => debug!("create of {} started: {}", self.stack_name, stack_id),
            // Someone else is creating it; wait for theirs
            Err(err) if err.code() == Some("AlreadyExistsException") => {
                debug!("stack {} already exists", self.stack_name)
            }
            Err(err) => return Err(err),
        }

        info!("Waiting for stack {} to be created...", self.stack_name);
        let description = wait_for_stack(
            self.api.as_ref(),
            &self.stack_name,
            StackOperation::Create,
            self.wait,
            &self.cancel,
        )
        .await?;
        self.bind(description);
        Ok(())
    }

    fn check_revision(&self, deployed: &StackDescription) -> Result<()> {
        let revision = InfraOutputs::from_stack_outputs(&deployed.outputs).template_revision();
        match revision {
            Some(revision) if revision > TEMPLATE_REVISION => Err(Error::Config(format!(
                "this CLI has an older template (revision {}) than the deployed {} stack (revision {}): please update the CLI",
                TEMPLATE_REVISION, self.stack_name, revision
            ))),
            _ => Ok(()),
        }
    }

    fn bind(&self, description: Option<StackDescription>) {
        if let Some(description) = description {
            self.outputs
                .merge(InfraOutputs::from_stack_outputs(&description.outputs));
        }
    }

    /// Refresh the outputs from the current stack description
    pub async fn fill_outputs(&self) -> Result<InfraOutputs> {
        let description = self.api.describe_stack(&self.stack_name).await.map_err(|err| {
            if is_stack_missing(&err) {
                Error::StackNotFound(self.stack_name.clone())
            } else {
                err
            }
        })?;
        Ok(self
            .outputs
            .merge(InfraOutputs::from_stack_outputs(&description.outputs)))
    }

    /// Outputs, refreshed only when a required field is still blank
    pub async fn ensure_outputs(&self) -> Result<InfraOutputs> {
        let current = self.outputs.snapshot();
        if current.is_complete() {
            return Ok(current);
        }
        self.fill_outputs().await
    }

    /// Delete the stack and wait until it is gone.
    ///
    /// Fails with the control plane's not-found error when there is no stack.
    pub async fn tear_down(&self) -> Result<()> {
        if let Err(err) = self
            .api
            .update_termination_protection(&self.stack_name, false)
            .await
        {
            warn!(
                "Failed to disable termination protection for stack {}: {}",
                self.stack_name, err
            );
        }

        self.api.delete_stack(&self.stack_name).await?;

        info!("Waiting for stack {} to be deleted...", self.stack_name);
        wait_for_stack(
            self.api.as_ref(),
            &self.stack_name,
            StackOperation::Delete,
            self.wait,
            &self.cancel,
        )
        .await?;
        self.outputs.clear();
        Ok(())
    }
}
