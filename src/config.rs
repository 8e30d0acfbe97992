//! Effective settings for a run
//!
//! Precedence, lowest first: built-in defaults, the stack file's
//! `[settings]` table, environment variables, command-line flags.

use crate::backend::BackendKind;
use crate::paths;
use crate::schema::{SettingsSection, StackSection};
use anyhow::{Context, Result, bail};
use declarative::{ExecuteOptions, FailurePolicy, WaitConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable for the provisioning endpoint
pub const ENV_ENDPOINT: &str = "STACKFORM_ENDPOINT";

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_SANDBOX_READY_AFTER: u32 = 1;

/// Values supplied on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backend: Option<BackendKind>,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub poll_interval: Option<f64>,
    pub timeout: Option<f64>,
    pub continue_on_error: bool,
}

/// Fully resolved settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: BackendKind,
    pub endpoint: Option<String>,
    pub region: String,
    pub state_dir: PathBuf,
    pub concurrency: usize,
    pub wait: WaitConfig,
    pub failure_policy: FailurePolicy,
    pub sandbox_ready_after: u32,
}

impl Settings {
    /// Resolve against the process environment
    pub fn resolve(
        stack: &StackSection,
        file: &SettingsSection,
        cli: &Overrides,
    ) -> Result<Self> {
        Self::resolve_with(stack, file, cli, |key| std::env::var(key).ok())
    }

    /// Resolve with a custom environment lookup
    pub fn resolve_with<F>(
        stack: &StackSection,
        file: &SettingsSection,
        cli: &Overrides,
        env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match (&cli.backend, &file.backend) {
            (Some(kind), _) => *kind,
            (None, Some(name)) => name.parse()?,
            (None, None) => BackendKind::default(),
        };

        let endpoint = cli
            .endpoint
            .clone()
            .or_else(|| env(ENV_ENDPOINT))
            .or_else(|| stack.endpoint.clone());

        let region = cli.region.clone().unwrap_or_else(|| stack.region.clone());

        let state_dir = match (&cli.state_dir, env(paths::ENV_STATE_DIR), &file.state_dir) {
            (Some(dir), _, _) => dir.clone(),
            (None, Some(dir), _) => paths::expand(&dir),
            (None, None, Some(dir)) => paths::expand(dir),
            (None, None, None) => paths::state_dir_from(&env)?,
        };

        let concurrency = cli
            .concurrency
            .or(file.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            bail!("concurrency must be at least 1");
        }

        let defaults = WaitConfig::default();
        let wait = WaitConfig {
            poll_interval: seconds(
                "poll_interval",
                cli.poll_interval.or(file.poll_interval),
                defaults.poll_interval,
            )?,
            max_poll_interval: seconds(
                "max_poll_interval",
                file.max_poll_interval,
                defaults.max_poll_interval,
            )?,
            backoff_factor: match file.backoff_factor {
                Some(f) if f.is_finite() && f >= 1.0 => f,
                Some(f) => bail!("backoff_factor must be at least 1.0, got {f}"),
                None => defaults.backoff_factor,
            },
            timeout: seconds("timeout", cli.timeout.or(file.timeout), defaults.timeout)?,
        };

        let failure_policy = if cli.continue_on_error {
            FailurePolicy::Continue
        } else {
            match file.on_failure.as_deref() {
                None | Some("abort") => FailurePolicy::Abort,
                Some("continue") => FailurePolicy::Continue,
                Some(other) => bail!("on_failure must be 'abort' or 'continue', got '{other}'"),
            }
        };

        Ok(Self {
            backend,
            endpoint,
            region,
            state_dir,
            concurrency,
            wait,
            failure_policy,
            sandbox_ready_after: file
                .sandbox_ready_after
                .unwrap_or(DEFAULT_SANDBOX_READY_AFTER),
        })
    }

    pub fn execute_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            concurrency: self.concurrency,
            wait: self.wait.clone(),
            failure_policy: self.failure_policy,
        }
    }
}

fn seconds(name: &str, value: Option<f64>, default: Duration) -> Result<Duration> {
    match value {
        Some(secs) => Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|d| !d.is_zero())
            .with_context(|| format!("{name} must be a positive number of seconds, got {secs}")),
        None => Ok(default),
    }
}

// ============================================================================
// Tests
// ============================================================================
