use colored::{ColoredString, Colorize};
use declarative::{Operation, ResourceStatus};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Change symbol colored by operation
pub fn operation_symbol(operation: Operation) -> ColoredString {
    let symbol = operation.symbol();
    match operation {
        Operation::Create => symbol.green(),
        Operation::Update => symbol.yellow(),
        Operation::Delete => symbol.red(),
        Operation::Replace => symbol.magenta(),
        Operation::NoOp => symbol.dimmed(),
    }
}

/// Status name colored by outcome
pub fn status(status: ResourceStatus) -> ColoredString {
    let name = status.to_string();
    match status {
        ResourceStatus::Succeeded | ResourceStatus::Deleted => name.green(),
        ResourceStatus::Failed => name.red(),
        ResourceStatus::Skipped => name.yellow(),
        ResourceStatus::Pending => name.dimmed(),
        ResourceStatus::Creating | ResourceStatus::Updating | ResourceStatus::Deleting => {
            name.cyan()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_keep_plain_text() {
        colored::control::set_override(false);
        assert_eq!(operation_symbol(Operation::Replace).to_string(), "-/+");
        assert_eq!(operation_symbol(Operation::Delete).to_string(), "-");
        assert_eq!(status(ResourceStatus::Skipped).to_string(), "skipped");
        assert_eq!(status(ResourceStatus::Creating).to_string(), "creating");
    }
}
