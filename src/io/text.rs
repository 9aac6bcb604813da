//! Plain-text numeric tables.
//!
//! Input rows are whitespace- or comma-separated numbers. Output numbers are written in
//! scientific notation with 16 significant digits.
use crate::error::{MultiscaleError, Result};
use std::fs;
use std::path::Path;

/// Reads a table, skipping empty lines.
pub fn read_table(path: &Path) -> Result<Vec<Vec<f64>>> {
    let content = fs::read_to_string(path)
        .map_err(|err| MultiscaleError::data_format(path, format!("failed to read file: {}", err)))?;
    parse_table(&content).map_err(|message| MultiscaleError::data_format(path, message))
}

/// Reads a table whose rows must all have `columns` entries.
pub fn read_table_with_columns(path: &Path, columns: usize) -> Result<Vec<Vec<f64>>> {
    let rows = read_table(path)?;
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != columns) {
        return Err(MultiscaleError::data_format(
            path,
            format!("row {} has {} values, expected {}", i + 1, row.len(), columns),
        ));
    }
    Ok(rows)
}

pub fn parse_table(content: &str) -> std::result::Result<Vec<Vec<f64>>, String> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            line.replace(',', " ")
                .split_whitespace()
                .map(|token| {
                    token
                        .parse::<f64>()
                        .map_err(|_| format!("invalid number '{}' on line {}", token, i + 1))
                })
                .collect()
        })
        .collect()
}

pub fn format_value(value: f64) -> String {
    format!("{:.15e}", value)
}

/// Formats values on one line, separated by `separator`.
pub fn format_row(values: impl IntoIterator<Item = f64>, separator: &str) -> String {
    let mut line = String::new();
    for (i, value) in values.into_iter().enumerate() {
        if i > 0 {
            line.push_str(separator);
        }
        line.push_str(&format_value(value));
    }
    line
}

pub fn write_rows(path: &Path, rows: impl IntoIterator<Item = Vec<f64>>, separator: &str) -> Result<()> {
    let mut content = String::new();
    for row in rows {
        content.push_str(&format_row(row, separator));
        content.push('\n');
    }
    fs::write(path, content)?;
    Ok(())
}
