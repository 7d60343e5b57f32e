//! `apply` and `plan`

use anyhow::{Context as AnyhowContext, Result, bail};
use colored::Colorize;
use rayon::prelude::*;

use crate::Context;
use crate::cli::{ApplyArgs, TargetArgs};
use crate::engine::differ::{self, ModulePending};
use crate::engine::{self, RunOptions, build_plans};
use crate::host::ShellHost;
use crate::modules;
use crate::progress;
use crate::secrets::CommandDecryptor;
use crate::ui;

pub fn apply(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let (settings, inventory) = super::load(ctx)?;
    let hosts = inventory.select(&args.target.limit)?;
    if hosts.is_empty() {
        ui::warn("No hosts selected");
        return Ok(());
    }
    let modules = modules::select(&args.target.module)?;
    let secrets = CommandDecryptor::from_settings(&settings.secrets);

    let opts = RunOptions {
        dry_run: args.dry_run,
        jobs: args.jobs.unwrap_or(settings.jobs),
        yes: args.yes,
        verbose: ctx.verbose > 0,
        quiet: ctx.quiet,
    };
    if !ctx.quiet {
        let title = if opts.dry_run { "Dry run" } else { "Apply" };
        ui::header(&format!("{} on {} hosts", title, hosts.len()));
    }

    let explicit = !args.target.module.is_empty();
    let report = engine::run(hosts, &modules, explicit, &settings, &secrets, &opts)?;
    engine::print_summary(&report);

    if let Some(path) = args.report {
        let path = match path {
            Some(path) => path,
            None => report.default_path(&settings.report_dir()?),
        };
        report.write_json(&path)?;
        ui::info(&format!("Report written to {}", path.display()));
    }

    let failed = report.hosts.iter().filter(|h| !h.is_success()).count();
    if failed > 0 {
        bail!("{} of {} hosts failed", failed, report.hosts.len());
    }
    Ok(())
}

pub fn plan(ctx: &Context, args: TargetArgs) -> Result<()> {
    let (settings, inventory) = super::load(ctx)?;
    let hosts = inventory.select(&args.limit)?;
    let modules = modules::select(&args.module)?;
    let secrets = CommandDecryptor::from_settings(&settings.secrets);
    let explicit = !args.module.is_empty();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(settings.jobs.max(1))
        .build()
        .context("Failed to create host thread pool")?;

    let spinner = (!ctx.quiet).then(|| progress::spinner("Probing hosts..."));
    let results: Vec<(String, Result<Vec<ModulePending>, String>)> = pool.install(|| {
        hosts
            .par_iter()
            .map(|config| {
                let host = ShellHost::connect(config, &settings);
                let result = host
                    .gather_facts()
                    .map(|facts| {
                        let planned = build_plans(config, &facts, &secrets, &modules, explicit);
                        differ::pending(&planned, &host)
                    })
                    .map_err(|e| e.to_string());
                (config.name.clone(), result)
            })
            .collect()
    });
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    let mut changes = 0;
    let mut errors = 0;
    for (host, result) in &results {
        match result {
            Ok(pending) => {
                differ::display_host(host, pending);
                changes += pending
                    .iter()
                    .filter_map(|p| p.result.as_ref().ok())
                    .map(Vec::len)
                    .sum::<usize>();
                errors += pending.iter().filter(|p| p.result.is_err()).count();
            }
            Err(reason) => {
                ui::section(host);
                println!("  {} {}", "✗".red(), reason);
                errors += 1;
            }
        }
    }

    println!();
    if changes == 0 && errors == 0 {
        ui::success("Everything is converged");
    } else {
        println!(
            "  {} pending changes, {} errors",
            changes.to_string().yellow().bold(),
            errors.to_string().red()
        );
    }
    Ok(())
}
