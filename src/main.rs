//! Lobster CLI
//!
//! Runs pipe-syntax pipelines and manages their approval gates.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lobster::{Config, Error, Outcome, Result, Runtime};

#[derive(Parser)]
#[command(name = "lobster")]
#[command(author, version, about = "Pipe-syntax pipelines with resumable approval gates")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workflow id (default: from config)
    #[arg(short, long, global = true, env = "LOBSTER_WORKFLOW")]
    workflow: Option<String>,

    /// State directory (default: from config)
    #[arg(long, global = true, env = "LOBSTER_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Default timeout for exec stages, e.g. 30s
    #[arg(long, global = true)]
    timeout: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline
    Run {
        /// Pipeline string, e.g. "exec ls | table"
        #[arg(required_unless_present = "file")]
        pipeline: Option<String>,

        /// Read the pipeline from a file
        #[arg(long, short, conflicts_with = "pipeline")]
        file: Option<PathBuf>,
    },

    /// Resume a paused run
    Resume {
        /// Resume token printed by a paused run
        #[arg(required_unless_present = "latest")]
        token: Option<String>,

        /// Resume the workflow's stored paused run
        #[arg(long, conflicts_with = "token")]
        latest: bool,
    },

    /// Approval gate commands
    Gate {
        #[command(subcommand)]
        action: GateCommands,
    },

    /// Show the workflow's latest run
    Status,

    /// Delete the workflow's run record
    Reset {
        /// Also delete the workflow's gates
        #[arg(long)]
        gates: bool,
    },

    /// List available commands
    Commands,

    /// Show current configuration
    Config,
}

#[derive(Subcommand)]
enum GateCommands {
    /// Approve a gate
    Approve {
        /// Gate id (default: the gate the paused run is waiting on)
        gate: Option<String>,

        /// Approver identity (default: from config)
        #[arg(long)]
        by: Option<String>,

        /// Approval note
        #[arg(long, short)]
        reason: Option<String>,
    },

    /// Reject a gate
    Reject {
        /// Gate id (default: the gate the paused run is waiting on)
        gate: Option<String>,

        /// Rejection reason
        #[arg(long, short)]
        reason: Option<String>,
    },

    /// Return a gate to pending
    Reset {
        /// Gate id
        gate: String,
    },

    /// Show a gate's status
    Status {
        /// Gate id (default: the gate the paused run is waiting on)
        gate: Option<String>,
    },

    /// List the workflow's gates
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for command output
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Load config and apply command-line overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(workflow) = &cli.workflow {
        config.workflow_id = workflow.clone();
    }
    if let Some(state_dir) = &cli.state_dir {
        config.state_dir = state_dir.clone();
    }
    if let Some(timeout) = &cli.timeout {
        config.exec.timeout = Some(timeout.clone());
        config.exec.timeout()?;
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run { pipeline, file } => {
            let pipeline = match (pipeline, file) {
                (Some(pipeline), _) => pipeline,
                (None, Some(path)) => std::fs::read_to_string(&path)?,
                (None, None) => return Err(Error::Parse("no pipeline given".to_string())),
            };
            let runtime = Runtime::from_config(&config)?;
            print_outcome(&runtime.run(&pipeline).await)
        }

        Commands::Resume { token, latest } => {
            let runtime = Runtime::from_config(&config)?;
            let outcome = match token {
                Some(token) if !latest => runtime.resume(&token).await,
                _ => runtime.resume_workflow(&config.workflow_id).await,
            };
            print_outcome(&outcome)
        }

        Commands::Gate { action } => {
            handle_gate_command(action, &config)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Status => {
            let runtime = Runtime::from_config(&config)?;
            let record = runtime.state().load_run(&config.workflow_id).map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(format!(
                    "no run recorded for workflow '{}'",
                    config.workflow_id
                )),
                other => other,
            })?;
            println!("{}", record.summary());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Reset { gates } => {
            let runtime = Runtime::from_config(&config)?;
            if runtime.state().reset_run(&config.workflow_id)? {
                println!("Deleted run record for workflow {}", config.workflow_id);
            } else {
                println!("No run record for workflow {}", config.workflow_id);
            }
            if gates {
                for gate in runtime.gates().list(&config.workflow_id)? {
                    runtime.gates().remove(&gate.workflow_id, &gate.gate_id)?;
                    println!("Deleted gate {}", gate.gate_id);
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Commands => {
            let runtime = Runtime::from_config(&config)?;
            for (name, usage) in runtime.registry().list() {
                println!("{:<8} {}", name, usage);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Config => {
            match toml::to_string_pretty(&config) {
                Ok(s) => println!("{}", s),
                Err(e) => eprintln!("Failed to serialize config: {}", e),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Print an outcome as JSON; only error outcomes fail the process
fn print_outcome(outcome: &Outcome) -> Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(if outcome.is_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn handle_gate_command(action: GateCommands, config: &Config) -> Result<()> {
    let runtime = Runtime::from_config(config)?;
    let gates = runtime.gates();
    let workflow = config.workflow_id.as_str();

    // A missing gate id means the gate the workflow's paused run waits on
    let resolve = |gate: Option<String>| -> Result<String> {
        if let Some(gate) = gate {
            return Ok(gate);
        }
        runtime
            .state()
            .load_run(workflow)
            .ok()
            .and_then(|record| record.gate)
            .map(|gate| gate.gate_id)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no gate given and workflow '{}' is not paused at one",
                    workflow
                ))
            })
    };

    match action {
        GateCommands::Approve { gate, by, reason } => {
            let gate = resolve(gate)?;
            let by = by.unwrap_or_else(|| config.approver.clone());
            print_json(&gates.approve(workflow, &gate, &by, reason)?)
        }

        GateCommands::Reject { gate, reason } => {
            let gate = resolve(gate)?;
            print_json(&gates.reject(workflow, &gate, reason)?)
        }

        GateCommands::Reset { gate } => print_json(&gates.reset(workflow, &gate)?),

        GateCommands::Status { gate } => {
            let gate = resolve(gate)?;
            println!("{}", gates.status(workflow, &gate)?);
            Ok(())
        }

        GateCommands::List => {
            for gate in gates.list(workflow)? {
                println!(
                    "{} | {} | {}",
                    gate.gate_id,
                    gate.status,
                    gate.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
