// Convergence commands
pub mod apply;
pub mod facts;

// Inventory and module introspection
pub mod inventory;
pub mod modules;

use anyhow::Result;

use crate::Context;
use crate::config::Settings;
use crate::inventory::Inventory;

/// Settings plus the inventory they (or `--inventory`) point at
pub fn load(ctx: &Context) -> Result<(Settings, Inventory)> {
    let settings = Settings::load()?;
    let path = match &ctx.inventory {
        Some(path) => path.clone(),
        None => settings.inventory.clone().into(),
    };
    let inventory = Inventory::load(&path)?;
    Ok((settings, inventory))
}
