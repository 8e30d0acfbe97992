//! `stackform outputs`

use crate::Context;
use crate::cli::OutputsArgs;
use crate::engine::executor::render_output;
use crate::ui;
use anyhow::Result;

pub fn run(ctx: &Context, args: &OutputsArgs) -> Result<bool> {
    let stack = super::load(ctx, None)?;
    let store = stack.open_state()?;
    let outputs = store.outputs();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outputs)?);
        return Ok(true);
    }

    if outputs.is_empty() {
        ui::info(&format!(
            "No outputs recorded for stack '{}'; run apply first",
            stack.name()
        ));
        return Ok(true);
    }

    for (name, value) in &outputs {
        if ctx.quiet {
            println!("{name}={}", render_output(value));
        } else {
            ui::kv(name, &render_output(value));
        }
    }
    Ok(true)
}
