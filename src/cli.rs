use crate::backend::BackendKind;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stackform")]
#[command(version)]
#[command(about = "Validate, plan, apply and destroy declarative infrastructure stacks", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Stack file (TOML or JSON)
    #[arg(short, long, global = true, default_value = "stack.toml")]
    pub file: PathBuf,

    /// Override a stack parameter
    #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_param, global = true)]
    pub params: Vec<(String, String)>,

    /// Directory holding state files
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Provisioning backend
    #[arg(long, value_enum, global = true)]
    pub backend: Option<BackendKind>,

    /// Provisioning endpoint for the http backend
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Override the stack's region
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check the stack file and its resource graph
    Validate(ValidateArgs),

    /// Show what apply would change
    Plan(PlanArgs),

    /// Converge the remote resources to the stack file
    Apply(ApplyArgs),

    /// Delete every resource recorded for the stack
    Destroy(DestroyArgs),

    /// Show the recorded state of each resource
    Status,

    /// Print the stack's recorded outputs
    Outputs(OutputsArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Also ask the backend to check each resource
    #[arg(long)]
    pub preflight: bool,
}

#[derive(Args)]
pub struct PlanArgs {
    /// Limit the plan to resources (by id or kind) and their prerequisites
    #[arg(short, long)]
    pub target: Vec<String>,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Show the plan without applying it
    #[arg(long)]
    pub dry_run: bool,

    /// Limit the run to resources (by id or kind) and their prerequisites
    #[arg(short, long)]
    pub target: Vec<String>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Stack name, required to proceed without a prompt
    #[arg(long, value_name = "STACK")]
    pub confirm: Option<String>,

    #[command(flatten)]
    pub run: RunArgs,
}

/// Execution tuning shared by apply and destroy
#[derive(Args)]
pub struct RunArgs {
    /// Maximum parallel operations
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Initial seconds between status polls
    #[arg(long, value_name = "SECONDS")]
    pub poll_interval: Option<f64>,

    /// Seconds to wait for a resource to settle
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<f64>,

    /// Keep applying independent resources after a failure
    #[arg(long)]
    pub continue_on_error: bool,
}

#[derive(Args)]
pub struct OutputsArgs {
    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

/// Parse `KEY=VALUE`
fn parse_param(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing parameter name in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
