//! Command implementations

use crate::parse::{parse_env_file, parse_env_line, parse_memory};
use anyhow::{bail, Context, Result};
use crun_foundation::{CrunConfig, Error, FileStore, RunState};
use crun_task::waiter::is_stack_missing;
use crun_task::{ContainerSpec, Driver, LogEvent, LogSink, TaskHandle, TaskOutcome};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

/// Options of `crun run`
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub image: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub memory: String,
    pub platform: Option<String>,
    pub detach: bool,
}

/// Writes task lines to stdout
struct StdoutSink;

impl LogSink for StdoutSink {
    fn emit(&mut self, event: &LogEvent) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", event.message);
    }
}

/// Env files first, then `-e` flags, so the command line wins
fn build_env(args: &RunArgs) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for path in &args.env_files {
        parse_env_file(path, &mut env)?;
    }
    for line in &args.env {
        if let Some((key, value)) = parse_env_line(line, |k| std::env::var(k).ok()) {
            env.insert(key, value);
        }
    }
    Ok(env)
}

fn state_store() -> Result<FileStore> {
    Ok(FileStore::global()?)
}

fn remember(config: &CrunConfig, handle: &TaskHandle) {
    let stack = config.resolved_stack_name();
    let saved = state_store().and_then(|store| {
        let mut state = RunState::load(&store)?;
        state.record(stack, handle.arn());
        state.save(&store)?;
        Ok(())
    });
    if let Err(err) = saved {
        warn!("Failed to record task {}: {}", handle.task_id(), err);
    }
}

/// Task argument, or the last task started on this stack
async fn resolve_task(
    driver: &dyn Driver,
    config: &CrunConfig,
    task: Option<&str>,
) -> Result<TaskHandle> {
    let task = match task {
        Some(task) => task.to_string(),
        None => {
            let state = RunState::load(&state_store()?)?;
            state
                .last_task(&config.resolved_stack_name())
                .map(str::to_string)
                .context("no task id given and no task was started on this stack")?
        }
    };
    Ok(driver.resolve(&task).await?)
}

/// Exit status for a finished task
fn exit_status(outcome: &TaskOutcome) -> i32 {
    match outcome.exit_code() {
        Some(0) | None => 0,
        Some(code) => code,
    }
}

/// Follow the task and report how it ended
async fn follow(driver: &dyn Driver, handle: &TaskHandle) -> Result<i32> {
    match driver.tail(handle, &mut StdoutSink).await {
        Ok(outcome) => {
            match &outcome {
                TaskOutcome::Failed { reason, .. } => eprintln!("Task failed: {}", reason),
                _ => info!("Task {} {}", handle.task_id(), outcome.display_name()),
            }
            Ok(exit_status(&outcome))
        }
        Err(Error::Cancelled) => {
            eprintln!(
                "Detached; task {} keeps running. Use `crun stop {}` to stop it.",
                handle.task_id(),
                handle.task_id()
            );
            Ok(130)
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn run(driver: &dyn Driver, config: &CrunConfig, args: RunArgs) -> Result<i32> {
    let memory = parse_memory(&args.memory)?;
    let env = build_env(&args)?;

    let mut container = ContainerSpec::new(&args.image).with_memory(memory);
    if let Some(platform) = &args.platform {
        container = container.with_platform(platform.clone());
    }

    driver.set_up(&[container]).await?;
    let handle = driver.run(&env, &args.args).await?;
    remember(config, &handle);
    eprintln!("Task ID: {}", handle.task_id());

    if args.detach {
        println!("{}", handle.arn());
        return Ok(0);
    }
    follow(driver, &handle).await
}

pub async fn logs(driver: &dyn Driver, config: &CrunConfig, task: Option<&str>) -> Result<i32> {
    let handle = resolve_task(driver, config, task).await?;
    follow(driver, &handle).await
}

pub async fn stop(driver: &dyn Driver, config: &CrunConfig, task: Option<&str>) -> Result<i32> {
    let handle = resolve_task(driver, config, task).await?;
    driver.stop(&handle).await?;
    eprintln!("Stopping task {}", handle.task_id());
    Ok(0)
}

pub async fn info(driver: &dyn Driver, config: &CrunConfig, task: Option<&str>) -> Result<i32> {
    let handle = resolve_task(driver, config, task).await?;
    let info = driver.info(&handle).await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(0)
}

pub async fn destroy(driver: &dyn Driver, config: &CrunConfig) -> Result<i32> {
    let stack = config.resolved_stack_name();
    match driver.tear_down().await {
        Ok(()) => {}
        Err(err) if err.is_not_found() || is_stack_missing(&err) => bail!("nothing to destroy: {}", err),
        Err(err) => return Err(err.into()),
    }

    if let Ok(store) = state_store() {
        if let Ok(mut state) = RunState::load(&store) {
            state.forget(&stack);
            if let Err(err) = state.save(&store) {
                warn!("Failed to update run state: {}", err);
            }
        }
    }
    eprintln!("Destroyed {} resources for {}", driver.name(), stack);
    Ok(0)
}
