//! `inventory list|show|validate`

use anyhow::{Context as AnyhowContext, Result, bail};
use colored::Colorize;

use crate::Context;
use crate::cli::InventoryCommand;
use crate::engine::{PlannedModule, build_plans};
use crate::host::HostFacts;
use crate::inventory::{Connection, HostConfig, Inventory};
use crate::modules;
use crate::secrets::{SecretDecryptor, SecretError};
use crate::ui;

pub fn run(ctx: &Context, cmd: InventoryCommand) -> Result<()> {
    let (_, inventory) = super::load(ctx)?;
    match cmd {
        InventoryCommand::List => list(&inventory),
        InventoryCommand::Show { host } => show(&inventory, &host),
        InventoryCommand::Validate => validate(&inventory),
    }
}

fn list(inventory: &Inventory) -> Result<()> {
    ui::header("Hosts");
    for name in inventory.hosts.keys() {
        let host = inventory.host(name)?;
        let connection = match host.connection {
            Connection::Ssh => host.address.clone(),
            Connection::Local => "local".to_string(),
        };
        let groups = inventory.groups_of(name);
        let blocks: Vec<&str> = host.blocks.keys().map(String::as_str).collect();
        println!(
            "  {:<28} {:<24} {}",
            name.bold(),
            connection.dimmed(),
            blocks.join(", ")
        );
        if !groups.is_empty() {
            ui::dim(&format!("  groups: {}", groups.join(", ")));
        }
    }
    Ok(())
}

fn show(inventory: &Inventory, name: &str) -> Result<()> {
    let host = inventory.host(name)?;
    let out = serde_json::to_string_pretty(&host).context("Failed to serialize host")?;
    println!("{}", out);
    Ok(())
}

/// Accepts any token; validation never decrypts
struct SkipSecrets;

impl SecretDecryptor for SkipSecrets {
    fn decrypt(&self, _token: &str) -> Result<String, SecretError> {
        Ok("unchecked".to_string())
    }
}

/// Facts stand-in for building plans without connecting
fn placeholder_facts(host: &HostConfig) -> HostFacts {
    let home = match host.ssh_user.as_deref() {
        Some("root") | None => "/root".to_string(),
        Some(user) => format!("/home/{}", user),
    };
    HostFacts {
        hostname: host.name.clone(),
        home,
        arch: "x86_64".to_string(),
    }
}

/// Structural problems plus every module build failure, one line each
pub fn problems(inventory: &Inventory) -> Result<Vec<String>> {
    let mut problems = inventory.problems();
    let modules = modules::select(&[])?;
    for name in inventory.hosts.keys() {
        let host = inventory.host(name)?;
        let facts = placeholder_facts(&host);
        for planned in build_plans(&host, &facts, &SkipSecrets, &modules, false) {
            if let PlannedModule::Rejected { error, .. } = planned {
                problems.push(format!("{}: {}", name, error));
            }
        }
    }
    Ok(problems)
}

fn validate(inventory: &Inventory) -> Result<()> {
    let problems = problems(inventory)?;
    if problems.is_empty() {
        ui::success(&format!("{} hosts are valid", inventory.hosts.len()));
        return Ok(());
    }
    for problem in &problems {
        ui::error(problem);
    }
    bail!("{} problems found", problems.len());
}
