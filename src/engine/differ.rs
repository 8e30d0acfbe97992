//! Change-set display

use crate::ui;
use colored::Colorize;
use declarative::{ChangeEntry, ChangeSet, DiffSummary, Operation, Value};
use similar::{ChangeTag, TextDiff};
use std::convert::Infallible;

/// Print the change-set, property diffs included
pub fn display_change_set(change_set: &ChangeSet, verbose: bool) {
    let summary = DiffSummary::from_change_set(change_set);
    if !summary.has_changes() {
        println!();
        println!("  {} No changes needed", "✓".green());
        return;
    }

    println!();
    println!(
        "┌─ {} ─────────────────────────────────────────┐",
        format!("Plan for stack '{}'", change_set.stack).bold()
    );
    println!("│");
    for entry in &change_set.entries {
        if !entry.is_change() && !verbose {
            continue;
        }
        println!(
            "│ {} {:<24} {}",
            ui::operation_symbol(entry.operation),
            entry.id,
            format!("{} ({})", entry.kind, entry.reason).dimmed()
        );
        for line in entry_details(entry) {
            println!("│       {line}");
        }
    }
    println!("│");
    println!("├─────────────────────────────────────────────────────┤");
    println!("│ {}", summary_line(&summary));
    println!("└─────────────────────────────────────────────────────┘");
}

/// Print the levels the executor may run concurrently
pub fn display_batches(change_set: &ChangeSet) {
    let batches = change_set.batches();
    if batches.is_empty() {
        return;
    }
    ui::section("Execution order");
    for (level, batch) in batches.iter().enumerate() {
        let ids: Vec<String> = batch
            .iter()
            .map(|e| format!("{}{}", e.operation.symbol(), e.id))
            .collect();
        println!("  {} {}", format!("[{}]", level + 1).blue().bold(), ids.join(", "));
    }
}

pub fn summary_line(summary: &DiffSummary) -> String {
    format!(
        "Plan: {} to create, {} to update, {} to replace, {} to delete",
        summary.additions.to_string().green(),
        summary.updates.to_string().yellow(),
        summary.replacements.to_string().magenta(),
        summary.removals.to_string().red()
    )
}

/// Detail lines under an entry
fn entry_details(entry: &ChangeEntry) -> Vec<String> {
    let desired = entry.desired.as_ref().map(|d| &d.config);
    match entry.operation {
        Operation::Create => desired
            .into_iter()
            .flatten()
            .map(|(name, value)| format!("{} {name} = {value}", "+".green()))
            .collect(),
        Operation::Update | Operation::Replace => {
            let mut lines = Vec::new();
            for name in &entry.changed_properties {
                let old = entry.previous.as_ref().and_then(|p| p.get(name));
                let new = desired.and_then(|d| d.get(name));
                lines.push(format!("{} {name}:", "~".yellow()));
                for (tag, text) in property_diff(old, new) {
                    let line = match tag {
                        ChangeTag::Delete => format!("- {text}").red().to_string(),
                        ChangeTag::Insert => format!("+ {text}").green().to_string(),
                        ChangeTag::Equal => format!("  {text}").dimmed().to_string(),
                    };
                    lines.push(format!("  {line}"));
                }
            }
            lines
        }
        Operation::Delete | Operation::NoOp => Vec::new(),
    }
}

/// Line diff between two renderings of a property
pub fn property_diff(old: Option<&Value>, new: Option<&Value>) -> Vec<(ChangeTag, String)> {
    let old = old.map(render).unwrap_or_default();
    let new = new.map(render).unwrap_or_default();
    TextDiff::from_lines(&old, &new)
        .iter_all_changes()
        .map(|change| (change.tag(), change.value().trim_end_matches('\n').to_string()))
        .collect()
}

/// Pretty JSON with references written as `${...}`
fn render(value: &Value) -> String {
    let json: Result<_, Infallible> =
        value.to_json(&mut |r| Ok(serde_json::Value::String(format!("${{{r}}}"))));
    let json = json.unwrap_or_else(|never| match never {});
    let mut text = serde_json::to_string_pretty(&json).unwrap_or_else(|_| value.to_string());
    text.push('\n');
    text
}
