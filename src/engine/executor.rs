//! Applying a change-set with stackform's UI integration

use super::differ;
use crate::progress::BarProgress;
use crate::ui;
use anyhow::Result;
use colored::Colorize;
use declarative::{
    CancelToken, ChangeSet, ConfirmCallback, ExecuteOptions, ExecuteReport, ExecuteSummary,
    Provider, StackStatus, StateStore,
};
use std::collections::BTreeMap;

/// Front-end switches for a run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Skip the confirmation prompt
    pub yes: bool,
    /// Show the plan, change nothing
    pub dry_run: bool,
    pub verbose: bool,
    pub quiet: bool,
}

/// How a run ended
#[derive(Debug)]
pub enum RunResult {
    NoChanges,
    DryRun,
    Aborted,
    Executed(ExecuteReport),
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        match self {
            Self::Executed(report) => report.is_success(),
            Self::NoChanges | Self::DryRun => true,
            Self::Aborted => false,
        }
    }
}

/// Prompts through dialoguer
pub struct DialoguerConfirm;

impl ConfirmCallback for DialoguerConfirm {
    fn confirm(&mut self, prompt: &str) -> std::io::Result<bool> {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}

/// Route Ctrl-C to `cancel`
///
/// The handler can be installed once per process; a second attempt only
/// logs a warning.
pub fn install_interrupt_handler(cancel: &CancelToken) {
    let token = cancel.clone();
    let installed = ctrlc::set_handler(move || {
        eprintln!(
            "\n{} Interrupted - waiting for in-flight operations to settle",
            "⚠".yellow()
        );
        token.cancel();
    });
    if let Err(e) = installed {
        log::warn!("Could not install interrupt handler: {e}");
    }
}

/// Show, confirm and execute a change-set
pub fn run<C: ConfirmCallback>(
    change_set: &ChangeSet,
    provider: &dyn Provider,
    store: &StateStore,
    options: &ExecuteOptions,
    run_options: RunOptions,
    cancel: &CancelToken,
    confirm: &mut C,
) -> Result<RunResult> {
    differ::display_change_set(change_set, run_options.verbose);

    if change_set.is_empty() {
        return Ok(RunResult::NoChanges);
    }

    if run_options.verbose {
        differ::display_batches(change_set);
    }

    if run_options.dry_run {
        println!();
        println!("  {} Dry run - no changes made", "ℹ".blue());
        return Ok(RunResult::DryRun);
    }

    if !run_options.yes && !confirm.confirm("Apply these changes?")? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(RunResult::Aborted);
    }

    println!();
    println!(
        "  {} Applying {} changes with up to {} workers...",
        "→".cyan(),
        change_set.changes().count(),
        options.concurrency
    );

    let mut progress = BarProgress::new(run_options.quiet);
    let report = declarative::execute(change_set, provider, store, options, cancel, &mut progress)?;
    log::info!(
        "Run for '{}' finished: {:?} ({} changes)",
        report.stack,
        report.status,
        report.summary.total_changes()
    );

    print_summary(&report);
    print_outputs(&report.outputs);
    Ok(RunResult::Executed(report))
}

/// Print final summary
fn print_summary(report: &ExecuteReport) {
    println!();
    match report.status {
        StackStatus::Succeeded => {
            println!("  {} Stack '{}' is up to date", "✓".green().bold(), report.stack);
        }
        StackStatus::Failed => {
            println!("  {} Stack '{}' applied with errors", "⚠".yellow().bold(), report.stack);
        }
        StackStatus::Cancelled => {
            println!("  {} Run for '{}' was interrupted", "✗".red().bold(), report.stack);
        }
    }

    for line in summary_lines(&report.summary) {
        println!("    • {line}");
    }

    let failed: Vec<_> = report.failed().collect();
    if !failed.is_empty() {
        ui::section("Failures");
        for outcome in failed {
            let reason = outcome
                .error
                .as_ref()
                .map_or_else(|| "unknown error".to_string(), ToString::to_string);
            println!("  {} {}: {}", "✗".red(), outcome.id.bold(), reason);
        }
    }

    let skipped: Vec<&str> = report.skipped().map(|o| o.id.as_str()).collect();
    if !skipped.is_empty() {
        ui::warn(&format!("Skipped: {}", skipped.join(", ")));
    }

    for note in unfinished_notes(report) {
        ui::warn(&note);
    }
}

/// Entries the run did not finish, grouped by whether they ever started
fn unfinished_notes(report: &ExecuteReport) -> Vec<String> {
    let not_started: Vec<&str> = report.not_started().map(|o| o.id.as_str()).collect();
    let in_progress: Vec<&str> = report.in_progress().map(|o| o.id.as_str()).collect();
    let mut notes = Vec::new();
    if !not_started.is_empty() {
        notes.push(format!("Not started: {}", not_started.join(", ")));
    }
    if !in_progress.is_empty() {
        notes.push(format!(
            "Left in progress, re-run to reconcile: {}",
            in_progress.join(", ")
        ));
    }
    notes
}

fn summary_lines(summary: &ExecuteSummary) -> Vec<String> {
    let counts = [
        (summary.created, "created"),
        (summary.modified, "updated"),
        (summary.replaced, "replaced"),
        (summary.removed, "deleted"),
        (summary.skipped, "skipped"),
        (summary.failed, "failed"),
        (summary.incomplete, "left in progress"),
        (summary.not_started, "not started"),
    ];
    counts
        .into_iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, label)| format!("{n} {} {label}", if n == 1 { "resource" } else { "resources" }))
        .collect()
}

fn print_outputs(outputs: &BTreeMap<String, serde_json::Value>) {
    if outputs.is_empty() {
        return;
    }
    ui::section("Outputs");
    for (name, value) in outputs {
        ui::kv(name, &render_output(value));
    }
}

/// Strings print bare, everything else as JSON
pub fn render_output(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
