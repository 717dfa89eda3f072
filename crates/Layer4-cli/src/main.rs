//! crun CLI - Main entry point

mod cli;
mod parse;

use clap::{Parser, Subcommand};
use crun_foundation::CrunConfig;
use crun_task::driver;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// crun - run a container image once, on the cloud or on local Docker
#[derive(Parser, Debug)]
#[command(name = "crun")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Which cloud region to use, or blank for local Docker
    #[arg(short, long, global = true)]
    region: Option<String>,

    /// Stack holding the shared resources (default: crun-<user>)
    #[arg(long, global = true)]
    stack: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create and run a new task from an image
    #[command(visible_alias = "r")]
    Run {
        /// Image to run
        image: String,

        /// Arguments passed to the image
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Environment variables (KEY=value, or KEY to pass through)
        #[arg(short, long = "env")]
        env: Vec<String>,

        /// Read in a file of environment variables
        #[arg(long = "env-file")]
        env_file: Vec<PathBuf>,

        /// Memory limit
        #[arg(short, long, default_value = "2g")]
        memory: String,

        /// Set platform if host is multi-platform capable
        #[arg(long)]
        platform: Option<String>,

        /// VPC to use for the task
        #[arg(long)]
        vpcid: Option<String>,

        /// Subnet to use for the task
        #[arg(long)]
        subnetid: Option<String>,

        /// Print the task ARN and exit without tailing
        #[arg(short, long)]
        detach: bool,
    },
    /// Follow the logs of a task until it stops
    #[command(visible_aliases = ["tail", "l"])]
    Logs {
        /// Task ID or ARN (default: the last task started)
        task: Option<String>,
    },
    /// Stop a running task
    #[command(visible_alias = "s")]
    Stop {
        /// Task ID or ARN (default: the last task started)
        task: Option<String>,
    },
    /// Show information about a task
    #[command(visible_alias = "i")]
    Info {
        /// Task ID or ARN (default: the last task started)
        task: Option<String>,
    },
    /// Destroy all resources created by this tool
    #[command(visible_aliases = ["teardown", "d"])]
    Destroy,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr, so task output stays clean on stdout)
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    // Load configuration; flags win over files and environment
    let mut config = CrunConfig::load()?;
    if let Some(region) = args.region {
        config.region = Some(region);
    }
    if let Some(stack) = args.stack {
        config.stack_name = Some(stack);
    }
    if let Command::Run { vpcid, subnetid, .. } = &args.command {
        if vpcid.is_some() {
            config.provision.vpc_id = vpcid.clone();
        }
        if subnetid.is_some() {
            config.provision.subnet_id = subnetid.clone();
        }
    }
    config.validate()?;

    // Ctrl-C stops waiting; the task itself keeps running
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let driver = driver::connect(&config, cancel).await?;
    tracing::debug!("Using {} driver", driver.name());

    let code = match args.command {
        Command::Run {
            image,
            args,
            env,
            env_file,
            memory,
            platform,
            detach,
            ..
        } => {
            let run = cli::RunArgs {
                image,
                args,
                env,
                env_files: env_file,
                memory,
                platform,
                detach,
            };
            cli::run(driver.as_ref(), &config, run).await?
        }
        Command::Logs { task } => cli::logs(driver.as_ref(), &config, task.as_deref()).await?,
        Command::Stop { task } => cli::stop(driver.as_ref(), &config, task.as_deref()).await?,
        Command::Info { task } => cli::info(driver.as_ref(), &config, task.as_deref()).await?,
        Command::Destroy => cli::destroy(driver.as_ref(), &config).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
