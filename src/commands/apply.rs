//! `stackform apply`

use crate::Context;
use crate::cli::ApplyArgs;
use crate::engine::executor::{self, DialoguerConfirm};
use anyhow::Result;
use declarative::CancelToken;

pub fn run(ctx: &Context, args: &ApplyArgs) -> Result<bool> {
    let stack = super::load(ctx, Some(&args.run))?;
    let graph = stack.graph()?;
    let store = stack.open_state()?;
    let change_set = stack.plan(&graph, &store, &args.target)?;
    let provider = stack.connect()?;

    let cancel = CancelToken::new();
    if !args.dry_run {
        executor::install_interrupt_handler(&cancel);
    }

    let result = executor::run(
        &change_set,
        provider.as_ref(),
        &store,
        &stack.settings.execute_options(),
        super::run_options(ctx, args.yes, args.dry_run),
        &cancel,
        &mut DialoguerConfirm,
    )?;
    Ok(result.is_success())
}
