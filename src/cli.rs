use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hostwright")]
#[command(version)]
#[command(about = "Idempotent provisioning for Linux hosts", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Inventory file (overrides config.toml)
    #[arg(short, long, global = true, env = "HOSTWRIGHT_INVENTORY")]
    pub inventory: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Converge hosts to the state their inventory describes
    Apply(ApplyArgs),

    /// Show what apply would change, without changing anything
    Plan(TargetArgs),

    /// Gather and print host facts
    Facts(FactsArgs),

    /// Inspect the inventory
    #[command(subcommand)]
    Inventory(InventoryCommand),

    /// List provisioning modules
    Modules,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Which hosts and modules a command touches
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Hosts or groups (comma-separated); all hosts when omitted
    #[arg(short, long, value_delimiter = ',')]
    pub limit: Vec<String>,

    /// Modules to run (comma-separated); every applicable module when omitted
    #[arg(short, long, value_delimiter = ',')]
    pub module: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Dry run - probe and report without changing anything
    #[arg(short, long)]
    pub dry_run: bool,

    /// Hosts converged in parallel (default from config.toml)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Run destructive operations without asking
    #[arg(short, long)]
    pub yes: bool,

    /// Write a JSON run report (to the report directory when no path is given)
    #[arg(long, num_args = 0..=1, value_name = "PATH")]
    pub report: Option<Option<PathBuf>>,
}

#[derive(Args, Debug, Clone)]
pub struct FactsArgs {
    /// Hosts or groups (comma-separated); all hosts when omitted
    #[arg(short, long, value_delimiter = ',')]
    pub limit: Vec<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum InventoryCommand {
    /// List hosts with their groups and blocks
    List,

    /// Show one host with defaults merged in
    Show {
        /// Host name
        host: String,
    },

    /// Check the inventory and build every module plan without connecting
    Validate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_apply_args() {
        let cli = Cli::parse_from([
            "hostwright", "-vv", "apply", "--limit", "pantheon,phobos", "-m", "k3s", "--yes",
            "--report",
        ]);
        assert_eq!(cli.verbose, 2);
        let Command::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert_eq!(args.target.limit, vec!["pantheon", "phobos"]);
        assert_eq!(args.target.module, vec!["k3s"]);
        assert!(args.yes);
        assert_eq!(args.report, Some(None));
        assert_eq!(args.jobs, None);
    }

    #[test]
    fn test_report_path() {
        let cli = Cli::parse_from(["hostwright", "apply", "--report", "/tmp/run.json", "-j", "2"]);
        let Command::Apply(args) = cli.command else {
            panic!("expected apply");
        };
        assert_eq!(args.report, Some(Some(PathBuf::from("/tmp/run.json"))));
        assert_eq!(args.jobs, Some(2));
    }
}
