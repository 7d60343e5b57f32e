use anyhow::Result;
use colored::Colorize;

use crate::modules;
use crate::ui;

pub fn list() -> Result<()> {
    ui::header("Modules");
    for module in modules::all() {
        let note = if module.run_by_default() {
            String::new()
        } else {
            format!(" {}", "(only when named)".yellow())
        };
        println!(
            "  {:<16} {:<28} {}{}",
            module.name().bold(),
            module.block().dimmed(),
            module.description(),
            note
        );
    }
    Ok(())
}
