//! Provisioning backends
//!
//! Every backend implements [`declarative::Provider`]:
//!
//! - [`local::SandboxProvider`] - a file-backed stand-in for a provisioning
//!   API, used by default and by tests
//! - [`http::HttpProvider`] - a JSON-over-HTTP client for a real endpoint

pub mod http;
pub mod local;

use crate::config::Settings;
use crate::paths;
use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use declarative::Provider;
use std::fmt;
use std::str::FromStr;

/// Which backend drives the run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// File-backed sandbox in the state directory
    #[default]
    Local,
    /// REST provisioning endpoint
    Http,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Http => write!(f, "http"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "http" => Ok(Self::Http),
            other => bail!("Unknown backend '{other}': expected 'local' or 'http'"),
        }
    }
}

/// Build the provider selected by `settings`
pub fn connect(settings: &Settings, stack: &str) -> Result<Box<dyn Provider>> {
    match settings.backend {
        BackendKind::Local => {
            let path = paths::sandbox_file(&settings.state_dir, stack);
            let provider = local::SandboxProvider::open(&path, settings.sandbox_ready_after)
                .with_context(|| format!("Could not open sandbox at {}", path.display()))?;
            log::debug!("Using local sandbox at {}", path.display());
            Ok(Box::new(provider))
        }
        BackendKind::Http => {
            let endpoint = settings
                .endpoint
                .as_deref()
                .context("The http backend needs an endpoint (--endpoint or STACKFORM_ENDPOINT)")?;
            let provider = http::HttpProvider::new(endpoint, &settings.region);
            log::debug!("Using provisioning endpoint {}", provider.endpoint());
            Ok(Box::new(provider))
        }
    }
}
