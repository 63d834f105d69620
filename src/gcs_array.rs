//! GCS array files: the bulk transfer layout stored on disk.
//!
//! ```text
//! # VERSION = 1
//! # TYPE = 1
//! # SEPARATOR = 32
//! # DIM = 2
//! # NDATA = 3
//! # SAMPLE_TIME = 0.0001
//! # END_HEADER
//! 0.100000 1.000000
//! ...
//! ```

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use indexmap::IndexMap;

use crate::bulk::{parse_header, parse_row, BulkHeader};
use crate::decoder::Value;
use crate::error::{GcsError, Result};

/// Space, the only separator written.
pub const SEPARATOR: u8 = 32;

const GENERATED: [&str; 5] = ["VERSION", "TYPE", "SEPARATOR", "DIM", "NDATA"];

/// Render `columns` with the standard header followed by `items`.
pub fn format_gcs_array(items: &IndexMap<String, Value>, columns: &[Vec<f64>]) -> Result<String> {
    let rows = columns.first().map_or(0, Vec::len);
    if let Some(bad) = columns.iter().position(|c| c.len() != rows) {
        return Err(GcsError::Validation(format!(
            "column {bad} has {} values, column 0 has {rows}",
            columns[bad].len()
        )));
    }
    let mut out = String::new();
    let _ = writeln!(out, "# VERSION = 1");
    let _ = writeln!(out, "# TYPE = 1");
    let _ = writeln!(out, "# SEPARATOR = {SEPARATOR}");
    let _ = writeln!(out, "# DIM = {}", columns.len());
    let _ = writeln!(out, "# NDATA = {rows}");
    for (k, v) in items.iter().filter(|(k, _)| !GENERATED.contains(&k.as_str())) {
        let _ = writeln!(out, "# {k} = {v}");
    }
    out.push_str("# END_HEADER\n");
    let sep = char::from(SEPARATOR).to_string();
    for i in 0..rows {
        let row: Vec<String> = columns.iter().map(|c| format!("{:.6}", c[i])).collect();
        out.push_str(&row.join(&sep));
        out.push('\n');
    }
    Ok(out)
}

/// Parse the text of a GCS array; anything before the header is skipped.
pub fn parse_gcs_array(text: &str) -> Result<(BulkHeader, Vec<Vec<f64>>)> {
    let start = text
        .split_inclusive('\n')
        .scan(0usize, |pos, line| {
            let at = *pos;
            *pos += line.len();
            Some((at, line.trim_start()))
        })
        .find(|(_, l)| l.starts_with('#') || l.starts_with("[GCS_ARRAY"))
        .map(|(at, _)| at)
        .ok_or_else(|| GcsError::protocol("no GCS array header", text))?;
    let body = &text[start..];
    let (head, data) = match body.find("END_HEADER") {
        Some(at) => body[at..]
            .find('\n')
            .map_or((body, ""), |nl| body.split_at(at + nl + 1)),
        None => return Err(GcsError::protocol("GCS array without END_HEADER", text)),
    };
    let header = parse_header(head)?;
    let sep = header.separator();
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); header.dim().unwrap_or(1)];
    for line in data.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let row = parse_row(line, sep)?;
        if row.len() != columns.len() {
            return Err(GcsError::protocol(
                format!("expected {} values per row, got {}", columns.len(), row.len()),
                line,
            ));
        }
        for (col, v) in columns.iter_mut().zip(row) {
            col.push(v);
        }
    }
    Ok((header, columns))
}

pub fn save_gcs_array(
    path: impl AsRef<Path>,
    items: &IndexMap<String, Value>,
    columns: &[Vec<f64>],
) -> Result<()> {
    let text = format_gcs_array(items, columns)?;
    fs::write(path.as_ref(), text)?;
    log::debug!("[GCS array] wrote {} columns to {}", columns.len(), path.as_ref().display());
    Ok(())
}

pub fn read_gcs_array(path: impl AsRef<Path>) -> Result<(BulkHeader, Vec<Vec<f64>>)> {
    let text = fs::read_to_string(path.as_ref())?;
    parse_gcs_array(&text)
}
