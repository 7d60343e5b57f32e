//! `facts` - what hostwright sees on each host before planning

use anyhow::{Context as AnyhowContext, Result};
use rayon::prelude::*;
use serde_json::{Value, json};

use crate::Context;
use crate::cli::FactsArgs;
use crate::host::{HostFacts, ShellHost};
use crate::ui;

/// JSON object keyed by host; unreachable hosts carry an `error`
fn to_json(results: &[(String, Result<HostFacts, String>)]) -> Value {
    let mut map = serde_json::Map::new();
    for (host, result) in results {
        let value = match result {
            Ok(facts) => json!(facts),
            Err(e) => json!({ "error": e }),
        };
        map.insert(host.clone(), value);
    }
    Value::Object(map)
}

pub fn run(ctx: &Context, args: FactsArgs) -> Result<()> {
    let (settings, inventory) = super::load(ctx)?;
    let hosts = inventory.select(&args.limit)?;

    let results: Vec<(String, Result<HostFacts, String>)> = hosts
        .par_iter()
        .map(|config| {
            let host = ShellHost::connect(config, &settings);
            (
                config.name.clone(),
                host.gather_facts().map_err(|e| e.to_string()),
            )
        })
        .collect();

    if args.json {
        let out = serde_json::to_string_pretty(&to_json(&results))
            .context("Failed to serialize facts")?;
        println!("{}", out);
        return Ok(());
    }

    for (host, result) in &results {
        ui::section(host);
        match result {
            Ok(facts) => {
                ui::kv("hostname", &facts.hostname);
                ui::kv("home", &facts.home);
                ui::kv("arch", &facts.arch);
            }
            Err(e) => ui::error(e),
        }
    }
    Ok(())
}
