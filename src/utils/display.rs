use crate::models::filters::{ActiveFilter, FilterKey, FilterOptions};
use crate::services::api_service::ChartData;
use colored::Colorize;
use prettytable::{format, Cell, Row, Table};
use serde_json::Value;

pub struct DisplayFormatter;

impl DisplayFormatter {
    pub fn new() -> Self {
        Self
    }

    pub fn format_header(&self, text: &str) -> String {
        format!("\n=== {} ===", text.bright_white().bold())
    }

    pub fn format_table(&self, headers: &[&str], rows: &[Vec<String>]) -> String {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);

        table.add_row(Row::new(
            headers.iter().map(|h| Cell::new(h).style_spec("b")).collect(),
        ));

        for row in rows {
            table.add_row(Row::new(row.iter().map(|cell| Cell::new(cell)).collect()));
        }

        table.to_string()
    }

    pub fn format_status(&self, ok: bool) -> String {
        if ok {
            "ok".green().to_string()
        } else {
            "failed".red().to_string()
        }
    }

    pub fn format_json(&self, value: &Value) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    }

    pub fn format_active_filters(&self, active: &[ActiveFilter]) -> String {
        if active.is_empty() {
            return "No active filters".dimmed().to_string();
        }
        let rows: Vec<Vec<String>> = active
            .iter()
            .map(|filter| {
                vec![
                    filter.key.to_string(),
                    filter.value.clone(),
                    filter.label.clone(),
                ]
            })
            .collect();
        self.format_table(&["Filter", "Value", "Label"], &rows)
    }

    pub fn format_filter_options(&self, options: &FilterOptions) -> String {
        let rows: Vec<Vec<String>> = FilterKey::DIMENSIONS
            .into_iter()
            .map(|key| {
                let values = options
                    .values(key)
                    .iter()
                    .map(|value| format!("{} ({})", value, key.label(value)))
                    .collect::<Vec<_>>()
                    .join(", ");
                vec![key.to_string(), values]
            })
            .collect();
        self.format_table(&["Filter", "Options"], &rows)
    }

    pub fn format_chart_summary(&self, charts: &ChartData) -> String {
        let entries = [
            ("Representation outcomes", &charts.representation_outcomes),
            ("Time series", &charts.time_series_analysis),
            ("Chi-square", &charts.chi_square_analysis),
            ("Outcome percentages", &charts.outcome_percentages),
            ("Countries", &charts.countries_chart),
        ];
        let rows: Vec<Vec<String>> = entries
            .iter()
            .map(|(name, data)| {
                vec![
                    name.to_string(),
                    self.format_status(data.is_some()),
                    data.as_ref().map(describe_payload).unwrap_or_default(),
                ]
            })
            .collect();

        let mut output = vec![self.format_table(&["Chart", "Status", "Payload"], &rows)];
        for failure in &charts.errors {
            output.push(format!("{} {}: {}", "!".red(), failure.chart, failure.error));
        }
        output.join("\n")
    }
}

impl Default for DisplayFormatter {
    fn default() -> Self {
        Self::new()
    }
}

/// Short shape description of a chart payload.
fn describe_payload(value: &Value) -> String {
    match value {
        Value::Object(map) => format!("{} fields", map.len()),
        Value::Array(items) => format!("{} items", items.len()),
        Value::Null => "empty".to_string(),
        other => other.to_string(),
    }
}
