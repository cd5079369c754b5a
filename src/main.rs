//! `workflow_bridge` command line.
//!
//! ```text
//! workflow_bridge --config config/bridge.toml list
//! workflow_bridge --config config/bridge.toml run TranslationalCalibration
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use workflow_bridge::config::BridgeConfig;
use workflow_bridge::{handlers, WorkflowBridge};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "workflow_bridge")]
#[command(about = "Run external workflow engine sessions against this beamline")]
struct Args {
    /// Bridge configuration file
    #[arg(short, long, default_value = "config/bridge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the configured workflows
    List,
    /// Run one workflow until the engine finishes or the session is aborted
    Run {
        /// Workflow name as configured
        workflow: String,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let config = BridgeConfig::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level)),
        )
        .init();

    match args.command {
        Command::List => {
            list_workflows(&config);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { workflow } => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run(&config, &workflow))
        }
    }
}

fn list_workflows(config: &BridgeConfig) {
    if config.workflows.is_empty() {
        println!("No workflows configured");
        return;
    }
    for workflow in &config.workflows {
        println!("{}", workflow.name);
        for line in workflow.documentation.lines() {
            println!("    {}", line.trim());
        }
    }
}

async fn run(config: &BridgeConfig, workflow: &str) -> anyhow::Result<ExitCode> {
    let spec = config.launch_spec(workflow)?;
    let table = handlers::builtin(config)?.build();
    let bridge = WorkflowBridge::from_config(config);

    info!(application = %config.application.name, %workflow, "Starting workflow");
    let session = bridge.start(spec, table).await?;

    let aborter = session.aborter();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            aborter.abort("Interrupted by user");
        }
    });

    let outcome = session.wait().await;
    interrupt.abort();
    let outcome = outcome?;

    println!("{}", outcome.end);
    if outcome.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!(end = %outcome.end, "Workflow did not complete");
        Ok(ExitCode::FAILURE)
    }
}
