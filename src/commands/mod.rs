//! Command implementations

pub mod apply;
pub mod destroy;
pub mod outputs;
pub mod plan;
pub mod status;
pub mod validate;

use crate::Context;
use crate::cli::RunArgs;
use crate::engine::{self, LoadedStack, RunOptions};
use anyhow::Result;

/// Load the stack file with the global flags and, if given, run tuning
fn load(ctx: &Context, run: Option<&RunArgs>) -> Result<LoadedStack> {
    let mut overrides = ctx.overrides.clone();
    if let Some(run) = run {
        overrides.concurrency = run.concurrency;
        overrides.poll_interval = run.poll_interval;
        overrides.timeout = run.timeout;
        overrides.continue_on_error = run.continue_on_error;
    }
    engine::load(&ctx.file, &ctx.params, &overrides)
}

fn run_options(ctx: &Context, yes: bool, dry_run: bool) -> RunOptions {
    RunOptions {
        yes,
        dry_run,
        verbose: ctx.verbose > 0,
        quiet: ctx.quiet,
    }
}
