//! `stackform status`

use crate::Context;
use crate::ui;
use anyhow::Result;
use colored::Colorize;
use declarative::{StackDecl, StateFile};

/// One row of the status table
#[derive(Debug, PartialEq, Eq)]
struct Row {
    id: String,
    kind: String,
    /// Recorded status, `None` if never applied
    status: Option<String>,
    remote_id: Option<String>,
    /// Recorded but no longer declared
    orphaned: bool,
}

pub fn run(ctx: &Context) -> Result<bool> {
    let stack = super::load(ctx, None)?;
    let store = stack.open_state()?;
    let state = store.snapshot();

    ui::header(&format!("Stack '{}'", stack.name()));
    ui::kv("State", &stack.state_path().display().to_string());
    ui::kv("Last updated", &state.last_updated.to_rfc3339());

    let rows = rows(&stack.decl, &state);
    if rows.is_empty() {
        ui::dim("No resources declared or recorded");
        return Ok(true);
    }

    println!();
    for row in &rows {
        let status = match &row.status {
            Some(status) if row.orphaned => format!("{status}, no longer declared").yellow(),
            Some(status) => status.normal(),
            None => "not created".dimmed(),
        };
        let remote_id = row.remote_id.as_deref().unwrap_or("-");
        println!(
            "  {:<24} {:<24} {:<28} {}",
            row.id,
            row.kind.dimmed(),
            status,
            remote_id.dimmed()
        );
    }

    for (id, record) in &state.resources {
        if let Some(error) = &record.last_error {
            ui::warn(&format!("{id}: {error}"));
        }
    }
    Ok(true)
}

/// Declared resources in file order, then orphaned records
fn rows(decl: &StackDecl, state: &StateFile) -> Vec<Row> {
    let mut rows: Vec<Row> = decl
        .resources
        .iter()
        .map(|resource| {
            let record = state.resources.get(&resource.id);
            Row {
                id: resource.id.clone(),
                kind: resource.kind.clone(),
                status: record.map(|r| r.status.to_string()),
                remote_id: record.and_then(|r| r.remote_id.clone()),
                orphaned: false,
            }
        })
        .collect();

    for (id, record) in &state.resources {
        if decl.resources.iter().any(|r| &r.id == id) {
            continue;
        }
        rows.push(Row {
            id: id.clone(),
            kind: record.kind.clone(),
            status: Some(record.status.to_string()),
            remote_id: record.remote_id.clone(),
            orphaned: true,
        });
    }
    rows
}
