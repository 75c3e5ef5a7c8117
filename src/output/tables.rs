use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};

/// Table and cell creation helpers
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn header(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .map(|label| Cell::new(*label).fg(TableColor::Cyan))
        .collect()
}

/// Pass rate as a fraction, red below `threshold`.
pub fn pass_rate_cell(rate: Option<f64>, threshold: f64) -> Cell {
    match rate {
        None => Cell::new("no data").fg(TableColor::DarkGrey),
        Some(rate) if rate < threshold => Cell::new(format!("{rate:.2}")).fg(TableColor::Red),
        Some(rate) if rate < 1.0 => Cell::new(format!("{rate:.2}")).fg(TableColor::Yellow),
        Some(rate) => Cell::new(format!("{rate:.2}")).fg(TableColor::Green),
    }
}

pub fn failure_count_cell(count: usize) -> Cell {
    if count == 0 {
        Cell::new(count).fg(TableColor::Green)
    } else {
        Cell::new(count).fg(TableColor::Red)
    }
}

pub fn problems_cell(problems: &[String], running: bool) -> Cell {
    let mut text = problems.join("\n");
    if running {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str("running");
    }
    if problems.is_empty() {
        Cell::new(text).fg(TableColor::Yellow)
    } else {
        Cell::new(text).fg(TableColor::Red)
    }
}
