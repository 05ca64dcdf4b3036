//! `table`: render items as an aligned text table
//!
//! Usage: `table [COLUMN...]`

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;

use super::{item_stream, ItemStream, StageContext, StageHandler, StageOutput};
use crate::Result;

/// Column holding non-object items
const VALUE_COLUMN: &str = "value";

pub struct TableHandler;

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn default_columns(items: &[Value]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    let mut has_scalars = false;
    for item in items {
        match item {
            Value::Object(map) => {
                for key in map.keys() {
                    if !columns.contains(key) {
                        columns.push(key.clone());
                    }
                }
            }
            _ => has_scalars = true,
        }
    }
    if has_scalars && !columns.iter().any(|c| c == VALUE_COLUMN) {
        columns.push(VALUE_COLUMN.to_string());
    }
    columns
}

/// Render items under the given columns (or the union of their keys)
pub fn render_table(items: &[Value], columns: &[String]) -> String {
    if items.is_empty() {
        return "(no rows)".to_string();
    }

    let columns = if columns.is_empty() {
        default_columns(items)
    } else {
        columns.to_vec()
    };

    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|item| {
            columns
                .iter()
                .map(|column| match item {
                    Value::Object(map) => cell(map.get(column)),
                    scalar if column == VALUE_COLUMN => cell(Some(scalar)),
                    _ => String::new(),
                })
                .collect()
        })
        .collect();

    let widths: Vec<usize> = columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            rows.iter()
                .map(|row| row[i].chars().count())
                .chain(std::iter::once(column.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let format_row = |cells: &[String]| -> String {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect();
        padded.join("  ").trim_end().to_string()
    };

    let mut lines = vec![format_row(&columns)];
    lines.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("  "),
    );
    lines.extend(rows.iter().map(|row| format_row(row)));
    lines.join("\n")
}

#[async_trait]
impl StageHandler for TableHandler {
    async fn execute(&self, ctx: &StageContext, input: ItemStream) -> Result<StageOutput> {
        let items: Vec<Value> = input.try_collect().await?;
        let rendered = render_table(&items, ctx.args());
        Ok(StageOutput::Items(item_stream(vec![Value::String(rendered)])))
    }

    fn usage(&self) -> &str {
        "table [COLUMN...]  render items as a text table"
    }
}
