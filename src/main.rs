mod cli;
mod commands;
mod config;
mod engine;
mod host;
mod inventory;
mod modules;
mod paths;
mod progress;
mod resource;
mod runner;
mod secrets;
mod sudo;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    /// Inventory path from the command line
    pub inventory: Option<PathBuf>,
}

fn main() -> Result<()> {
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

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        inventory: cli.inventory,
    };

    match cli.command {
        Command::Apply(args) => commands::apply::apply(&ctx, args),
        Command::Plan(args) => commands::apply::plan(&ctx, args),
        Command::Facts(args) => commands::facts::run(&ctx, args),
        Command::Inventory(cmd) => commands::inventory::run(&ctx, cmd),
        Command::Modules => commands::modules::list(),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "hostwright", &mut io::stdout());
            Ok(())
        }
    }
}
