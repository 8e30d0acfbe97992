//! `stackform plan`

use crate::Context;
use crate::cli::PlanArgs;
use crate::engine::differ;
use anyhow::Result;

pub fn run(ctx: &Context, args: &PlanArgs) -> Result<bool> {
    let stack = super::load(ctx, None)?;
    let graph = stack.graph()?;
    let store = stack.open_state()?;
    let change_set = stack.plan(&graph, &store, &args.target)?;

    differ::display_change_set(&change_set, ctx.verbose > 0);
    differ::display_batches(&change_set);
    Ok(true)
}
