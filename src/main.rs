mod backend;
mod cli;
mod commands;
mod config;
mod engine;
mod kinds;
mod paths;
mod progress;
mod schema;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::Overrides;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub file: PathBuf,
    pub params: Vec<(String, String)>,
    pub overrides: Overrides,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        file: paths::expand(&cli.file.to_string_lossy()),
        params: cli.params,
        overrides: Overrides {
            backend: cli.backend,
            endpoint: cli.endpoint,
            region: cli.region,
            state_dir: cli.state_dir,
            ..Overrides::default()
        },
    };

    match cli.command {
        Command::Validate(args) => commands::validate::run(&ctx, &args),
        Command::Plan(args) => commands::plan::run(&ctx, &args),
        Command::Apply(args) => commands::apply::run(&ctx, &args),
        Command::Destroy(args) => commands::destroy::run(&ctx, &args),
        Command::Status => commands::status::run(&ctx),
        Command::Outputs(args) => commands::outputs::run(&ctx, &args),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "stackform", &mut io::stdout());
            Ok(true)
        }
    }
}

/// Print an error; graph validation problems are listed one per line
fn report(e: &anyhow::Error) {
    if let Some(declarative::Error::Validation(errors)) = e.downcast_ref::<declarative::Error>() {
        ui::error(&format!(
            "Stack is invalid ({} problem{})",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" }
        ));
        for problem in errors.iter() {
            eprintln!("    • {problem}");
        }
        return;
    }
    ui::error(&format!("{e:#}"));
}
