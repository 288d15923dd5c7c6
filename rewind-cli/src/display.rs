//! Rendering of statement results for the shell.

use comfy_table::{
    modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, CellAlignment, Color,
    ContentArrangement, Table,
};
use rewind_core::{ResultSet, StatementResult};

/// Renders a result as the text printed after a statement.
pub fn render(result: &StatementResult) -> String {
    match result {
        StatementResult::ResultSet(rows) if rows.is_empty() => "(No rows returned)".to_string(),
        StatementResult::ResultSet(rows) => format!(
            "{}\n{}",
            table(rows),
            plural(rows.row_count() as i64, "row")
        ),
        StatementResult::UpdateCount(count) => format!("{} affected", plural(*count, "row")),
        StatementResult::UpdateCounts(counts) => {
            let total: i64 = counts.iter().sum();
            format!(
                "{} executed, {} affected",
                plural(counts.len() as i64, "statement"),
                plural(total, "row")
            )
        }
        StatementResult::NoResult => "OK".to_string(),
    }
}

pub fn table(rows: &ResultSet) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(rows.columns().iter().map(|name| {
        Cell::new(name)
            .fg(Color::Cyan)
            .set_alignment(CellAlignment::Center)
    }));
    for row in rows.iter() {
        table.add_row(row.iter().map(Cell::new));
    }
    table
}

fn plural(count: i64, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}
