//! Progress indicators for stackform CLI.

use crate::ui;
use colored::Colorize;
use declarative::{ExecuteSummary, Operation, ProgressCallback, ResourceOutcome, ResourceStatus};
use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar fed by the execution engine
///
/// One line is printed above the bar for every entry that finishes.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        Self { bar }
    }
}

impl ProgressCallback for BarProgress {
    fn on_run_start(&mut self, changes: usize) {
        self.bar.set_length(changes as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            self.bar.set_style(style.progress_chars("=>-"));
        }
    }

    fn on_resource_start(&mut self, id: &str, operation: Operation) {
        self.bar.set_message(format!("{operation} {id}"));
    }

    fn on_transition(&mut self, id: &str, status: ResourceStatus) {
        self.bar.set_message(format!("{id}: {status}"));
    }

    fn on_resource_complete(&mut self, outcome: &ResourceOutcome) {
        if !outcome.operation.is_change() {
            return;
        }
        self.bar.inc(1);
        self.bar.println(render_outcome(outcome));
    }

    fn on_run_complete(&mut self, _summary: &ExecuteSummary) {
        self.bar.finish_and_clear();
    }
}

/// One report line for a finished entry
pub fn render_outcome(outcome: &ResourceOutcome) -> String {
    let mut line = format!(
        "  {} {:<24} {}",
        ui::operation_symbol(outcome.operation),
        outcome.id,
        ui::status(outcome.status)
    );
    if let Some(remote_id) = &outcome.remote_id {
        line.push_str(&format!(" {}", format!("({remote_id})").dimmed()));
    }
    if let Some(error) = &outcome.error {
        line.push_str(&format!("\n      {}", error.to_string().red()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::ResourceError;
    use std::time::Duration;

    #[test]
    fn outcome_line_shows_remote_id_and_error() {
        colored::control::set_override(false);
        let mut outcome = ResourceOutcome::new(
            "web",
            "compute_instance",
            Operation::Create,
            ResourceStatus::Failed,
        );
        outcome.remote_id = Some("i-1234".into());
        outcome.error = Some(ResourceError::Timeout {
            operation: Operation::Create,
            elapsed: Duration::from_secs(3),
        });

        let line = render_outcome(&outcome);
        assert!(line.starts_with("  + web"));
        assert!(line.contains("failed (i-1234)"));
        assert!(line.contains("timed out"));
    }

    #[test]
    fn quiet_bar_is_hidden() {
        let mut progress = BarProgress::new(true);
        progress.on_run_start(3);
        assert!(progress.bar.is_hidden());
    }
}
