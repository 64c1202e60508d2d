use std::collections::BTreeSet;
use std::io::Write;

use anyhow::{Context, Result};
use rebound_core::models::{Extraction, ExtractionSchema};
use serde::Serialize;
use serde_json::Value;

/// Column used for items that are not JSON objects.
const VALUE_COLUMN: &str = "value";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
}

/// Extraction of one URL, as printed by `rebound extract`.
#[derive(Debug, Serialize)]
pub struct UrlExtraction {
    pub url: String,
    #[serde(flatten)]
    pub extraction: Extraction,
}

pub fn write_json<W: Write>(out: W, extractions: &[UrlExtraction]) -> Result<()> {
    serde_json::to_writer_pretty(out, extractions).context("Failed to write JSON output")
}

/// One row per item; `url` first, then the schema fields (or, without any,
/// the union of object keys seen across items).
pub fn write_csv<W: Write>(
    out: W,
    schema: &ExtractionSchema,
    extractions: &[UrlExtraction],
) -> Result<()> {
    let columns = columns(schema, extractions);
    let mut writer = csv::Writer::from_writer(out);

    writer
        .write_record(std::iter::once("url").chain(columns.iter().map(String::as_str)))
        .context("Failed to write CSV header")?;

    for entry in extractions {
        for item in &entry.extraction.items {
            let row = std::iter::once(entry.url.clone())
                .chain(columns.iter().map(|column| cell(item, column)));
            writer.write_record(row).context("Failed to write CSV row")?;
        }
    }

    writer.flush().context("Failed to flush CSV output")?;
    Ok(())
}

fn columns(schema: &ExtractionSchema, extractions: &[UrlExtraction]) -> Vec<String> {
    if !schema.fields.is_empty() {
        return schema.fields.keys().cloned().collect();
    }

    let mut keys = BTreeSet::new();
    let mut scalar_items = false;
    for item in extractions.iter().flat_map(|e| &e.extraction.items) {
        match item {
            Value::Object(map) => keys.extend(map.keys().cloned()),
            _ => scalar_items = true,
        }
    }
    if scalar_items {
        keys.insert(VALUE_COLUMN.to_string());
    }
    keys.into_iter().collect()
}

fn cell(item: &Value, column: &str) -> String {
    let value = match item {
        Value::Object(map) => map.get(column),
        other if column == VALUE_COLUMN => Some(other),
        _ => None,
    };
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
