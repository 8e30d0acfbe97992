//! Centralized path resolution for stackform
//!
//! # Environment Variables
//!
//! - `STACKFORM_STATE_DIR` - Override the state directory
//!
//! # Path Resolution Priority
//!
//! For state_dir():
//! 1. `STACKFORM_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/stackform` (if set)
//! 3. Platform default:
//!    - Windows: `%LOCALAPPDATA%\stackform`
//!    - macOS/Linux: `~/.local/state/stackform`
//!
//! Each stack keeps its state in `<state_dir>/<stack>.json`. The local
//! sandbox backend keeps its objects next to it in `<stack>.sandbox.json`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "STACKFORM_STATE_DIR";

/// Directory holding state and sandbox files, from the process environment
pub fn state_dir() -> Result<PathBuf> {
    state_dir_from(|key| std::env::var(key).ok())
}

/// Resolve the state directory with a custom environment lookup
pub fn state_dir_from<F>(env: F) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let (path, source) = if let Some(dir) = env(ENV_STATE_DIR) {
        (expand(&dir), ENV_STATE_DIR)
    } else if let Some(xdg_state) = env("XDG_STATE_HOME") {
        (PathBuf::from(xdg_state).join("stackform"), "XDG_STATE_HOME")
    } else {
        (platform_state_dir()?, "platform default")
    };
    log::debug!("State directory {} ({source})", path.display());
    Ok(path)
}

#[cfg(windows)]
fn platform_state_dir() -> Result<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join("stackform"))
        .context("Could not determine local app data directory")
}

#[cfg(not(windows))]
fn platform_state_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".local/state/stackform"))
}

/// State file of a stack
pub fn state_file(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(format!("{stack}.json"))
}

/// Object store of the local sandbox backend
pub fn sandbox_file(state_dir: &Path, stack: &str) -> PathBuf {
    state_dir.join(format!("{stack}.sandbox.json"))
}

/// `~` and `$VAR` expansion; unknown variables stay as written
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

// ============================================================================
// Tests
// ============================================================================
