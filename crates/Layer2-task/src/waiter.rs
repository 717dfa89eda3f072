//! Stack convergence waiter
//!
//! Polls `describe_stack` on a fixed interval until the stack reaches the
//! target status, fails, the deadline passes or the operation is cancelled.
//! Throttling errors are retried until the deadline; any other error ends the
//! wait immediately.

use crate::api::{StackApi, StackDescription, StackStatus};
use crun_foundation::{Error, Result};
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Control-plane message for an update with nothing to change
pub const NO_UPDATES_MESSAGE: &str = "No updates are to be performed.";

/// Stack operation being waited on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOperation {
    Create,
    Update,
    Delete,
}

impl StackOperation {
    fn target(&self) -> StackStatus {
        match self {
            StackOperation::Create => StackStatus::CreateComplete,
            StackOperation::Update => StackStatus::UpdateComplete,
            StackOperation::Delete => StackStatus::DeleteComplete,
        }
    }
}

impl fmt::Display for StackOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StackOperation::Create => "create",
            StackOperation::Update => "update",
            StackOperation::Delete => "delete",
        })
    }
}

/// Poll cadence and deadline
#[derive(Debug, Clone, Copy)]
pub struct WaitConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(180),
        }
    }
}

/// `ValidationError ... does not exist` or an explicit `StackNotFound`
pub fn is_stack_missing(err: &Error) -> bool {
    match err {
        Error::StackNotFound(_) => true,
        Error::Api { code, message, .. } => {
            code == "ValidationError" && message.ends_with(" does not exist")
        }
        _ => false,
    }
}

/// `ValidationError "No updates are to be performed."`
pub fn is_no_updates(err: &Error) -> bool {
    matches!(err, Error::Api { code, message, .. }
        if code == "ValidationError" && message == NO_UPDATES_MESSAGE)
}

enum Poll {
    Done(Option<StackDescription>),
    Pending(StackStatus),
    Retry,
}

fn classify(
    stack_name: &str,
    operation: StackOperation,
    observed: Result<StackDescription>,
) -> Result<Poll> {
    let description = match observed {
        Ok(description) => description,
        Err(err) if operation == StackOperation::Delete && is_stack_missing(&err) => {
            return Ok(Poll::Done(None));
        }
        Err(err) if err.is_retryable() => {
            warn!("describe {} throttled, retrying: {}", stack_name, err);
            return Ok(Poll::Retry);
        }
        Err(err) => return Err(err),
    };

    let status = description.status;
    if status == operation.target() {
        return Ok(Poll::Done(Some(description)));
    }
    if status.is_in_progress() {
        return Ok(Poll::Pending(status));
    }

    Err(Error::api(
        "cloudformation",
        "ResourceNotReady",
        format!(
            "stack {} failed to {}: {}{}",
            stack_name,
            operation,
            status,
            description
                .status_reason
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        ),
    ))
}

/// Wait for `operation` on `stack_name` to converge.
///
/// Returns the final description, or `None` once a deleted stack is gone.
pub async fn wait_for_stack<S>(
    api: &S,
    stack_name: &str,
    operation: StackOperation,
    config: WaitConfig,
    cancel: &CancellationToken,
) -> Result<Option<StackDescription>>
where
    S: StackApi + ?Sized,
{
    let deadline = Instant::now() + config.timeout;
    let mut first = true;

    loop {
        let poll = async {
            if !first {
                sleep(config.poll_interval).await;
            }
            api.describe_stack(stack_name).await
        };

        let observed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep_until(deadline) => {
                return Err(Error::timeout(
                    format!("waiting for stack {} to {}", stack_name, operation),
                    config.timeout,
                ));
            }
            observed = poll => observed,
        };
        first = false;

        match classify(stack_name, operation, observed)? {
            Poll::Done(description) => return Ok(description),
            Poll::Pending(status) => debug!("stack {}: {}", stack_name, status),
            Poll::Retry => {}
        }
    }
}
