//! `stackform validate`

use crate::Context;
use crate::cli::ValidateArgs;
use crate::engine::differ;
use crate::engine::planner::preflight;
use crate::ui;
use anyhow::Result;
use colored::Colorize;
use declarative::DiffSummary;

pub fn run(ctx: &Context, args: &ValidateArgs) -> Result<bool> {
    let stack = super::load(ctx, None)?;
    let graph = stack.graph()?;

    if !ctx.quiet {
        ui::header(&format!("Stack '{}'", stack.name()));
        ui::kv("File", &ctx.file.display().to_string());
        ui::kv("Region", &stack.settings.region);
        ui::kv("Backend", &stack.settings.backend.to_string());
        ui::kv("Resources", &graph.len().to_string());
        ui::kv("Outputs", &graph.outputs().len().to_string());
        ui::section("Apply order");
        for (position, id) in graph.order().iter().enumerate() {
            if let Some(resource) = graph.get(id) {
                println!(
                    "  {:>3}. {:<24} {}",
                    position + 1,
                    id,
                    resource.kind.dimmed()
                );
            }
        }
    }

    // Dry diff against recorded state
    let store = stack.open_state()?;
    let change_set = stack.plan(&graph, &store, &[])?;
    let summary = DiffSummary::from_change_set(&change_set);

    if args.preflight {
        let provider = stack.connect()?;
        let problems = preflight(&graph, provider.as_ref());
        if !problems.is_empty() {
            println!();
            for (id, message) in &problems {
                ui::error(&format!("{id}: {message}"));
            }
            ui::error(&format!(
                "Backend rejected {} of {} resources",
                problems.len(),
                graph.len()
            ));
            return Ok(false);
        }
        log::info!("Preflight passed for {} resources", graph.len());
    }

    println!();
    ui::success(&format!("Stack '{}' is valid", stack.name()));
    if !ctx.quiet {
        ui::dim(&differ::summary_line(&summary));
    }
    Ok(true)
}
