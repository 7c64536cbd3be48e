//! Template CLI commands.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::state::AppState;

/// List the templates registered with the engine.
pub async fn list_templates(state: &AppState, json: bool) -> Result<()> {
    let templates = state.engine.get_available_workflows();

    if json {
        println!("{}", serde_json::to_string_pretty(&templates)?);
        return Ok(());
    }

    if templates.is_empty() {
        println!();
        println!(
            "  {} No templates found. Add YAML or JSON files to {}",
            style("i").blue().bold(),
            style(state.data_dir.join("templates").display()).yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Id").fg(Color::White),
        Cell::new("Name").fg(Color::White),
        Cell::new("Phases").fg(Color::White),
        Cell::new("Description").fg(Color::White),
    ]);

    for template in &templates {
        let desc = template.description.clone().unwrap_or_default();
        let desc = if desc.chars().count() > 50 {
            format!("{}...", desc.chars().take(47).collect::<String>())
        } else {
            desc
        };
        table.add_row(vec![
            Cell::new(&template.id).fg(Color::Cyan),
            Cell::new(&template.name),
            Cell::new(template.phase_count),
            Cell::new(desc),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
