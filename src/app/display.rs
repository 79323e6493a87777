//! Rendering of plugin lists and optimization results

use crate::config::PluginDescriptor;
use crate::core::styles::StyleRole;
use crate::plugin::{JobMirror, StoredItem};
use prettytable::{format, Cell, Row, Table};

fn header(titles: &[&str], color: bool) -> Row {
    let spec = if color {
        format!("b{}", StyleRole::Header.table_spec())
    } else {
        "b".to_string()
    };
    Row::new(
        titles
            .iter()
            .map(|t| Cell::new(t).style_spec(&spec))
            .collect(),
    )
}

fn styled(text: &str, role: StyleRole, color: bool) -> Cell {
    let cell = Cell::new(text);
    if color {
        cell.style_spec(role.table_spec())
    } else {
        cell
    }
}

fn money(value: f64) -> String {
    format!("${value:.2}")
}

fn money_cell(value: f64, role: StyleRole, color: bool) -> Cell {
    let spec = if color {
        format!("r{}", role.table_spec())
    } else {
        "r".to_string()
    };
    Cell::new(&money(value)).style_spec(&spec)
}

pub fn plugins_table(plugins: &[PluginDescriptor], color: bool) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_CLEAN);
    table.set_titles(header(&["Name", "Version", "Commands", "Path"], color));
    for plugin in plugins {
        let commands = plugin
            .commands
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(Row::new(vec![
            styled(&plugin.name, StyleRole::Literal, color),
            Cell::new(&plugin.version),
            Cell::new(&commands),
            styled(&plugin.path.display().to_string(), StyleRole::Dim, color),
        ]));
    }
    table
}

fn status(item: &StoredItem) -> String {
    let item = &item.item;
    if item.skipped {
        if item.skip_reason.is_empty() {
            "skipped".to_string()
        } else {
            format!("skipped: {}", item.skip_reason)
        }
    } else if item.loading {
        "loading".to_string()
    } else if item.lazy_loading_enabled {
        "pending evaluation".to_string()
    } else {
        String::new()
    }
}

pub fn report_table(items: &[StoredItem], color: bool) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
    table.set_titles(header(
        &[
            "Plugin", "Id", "Name", "Type", "Region", "Current", "Right-sized", "Savings",
            "Status",
        ],
        color,
    ));

    let mut total = 0.0;
    for stored in items {
        let item = &stored.item;
        let savings = item.savings();
        if !item.skipped {
            total += savings;
        }
        let savings_role = if savings > 0.0 {
            StyleRole::Savings
        } else {
            StyleRole::Value
        };
        table.add_row(Row::new(vec![
            Cell::new(&stored.plugin),
            styled(&item.id, StyleRole::Literal, color),
            Cell::new(&item.name),
            Cell::new(&item.resource_type),
            Cell::new(&item.region),
            money_cell(item.current_cost(), StyleRole::Value, color),
            money_cell(item.right_sized_cost(), StyleRole::Value, color),
            money_cell(savings, savings_role, color),
            styled(&status(stored), StyleRole::Pending, color),
        ]));
    }
    table.add_row(Row::new(vec![
        styled("Total", StyleRole::Header, color),
        Cell::new(""),
        Cell::new(""),
        Cell::new(""),
        Cell::new(""),
        Cell::new(""),
        Cell::new(""),
        money_cell(total, StyleRole::Savings, color),
        Cell::new(""),
    ]));
    table
}

/// Results as one JSON document
pub fn report_json(items: &[StoredItem], jobs: Option<&JobMirror>) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = items
        .iter()
        .map(|stored| {
            serde_json::json!({
                "plugin": stored.plugin,
                "savings": stored.item.savings(),
                "item": &*stored.item,
            })
        })
        .collect();
    let failed: Vec<String> = jobs
        .map(|j| j.failed().into_iter().map(|(_, text)| text).collect())
        .unwrap_or_default();
    serde_json::json!({
        "items": entries,
        "total_savings": items
            .iter()
            .filter(|s| !s.item.skipped)
            .map(|s| s.item.savings())
            .sum::<f64>(),
        "failed_jobs": failed,
    })
}

/// One-paragraph summary of failed jobs for stderr, if any failed
pub fn failed_jobs_note(jobs: &JobMirror, color: bool) -> Option<String> {
    let summary = jobs.failed_summary();
    if summary.entries.is_empty() {
        return None;
    }
    let mut lines = vec![StyleRole::Error.paint("Some jobs failed:", color)];
    lines.extend(summary.entries.iter().map(|e| format!("  - {e}")));
    if summary.has_more {
        lines.push(format!("  ... and {} more", jobs.failed_count() - summary.entries.len()));
    }
    Some(lines.join("\n"))
}
