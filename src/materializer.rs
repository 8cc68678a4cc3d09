//! Message materialization: template text + row data + field mappings →
//! rendered message with a validity verdict.
//!
//! Problems never abort rendering. Every mapped value is substituted (empty
//! ones included) and every problem is listed on the message, so a preview
//! shows exactly what went wrong in context.

use crate::mapping::FieldMappingTable;
use crate::template::{placeholder, placeholder_regex, Template};
use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Message text used when the template has no BODY component.
pub const MISSING_BODY_MESSAGE: &str = "Error: template has no body component";
pub const MISSING_BODY_ERROR: &str = "template has no body";

/// A loaded spreadsheet: header row plus data rows aligned to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetData {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// One rendered outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewMessage {
    pub phone_number: String,
    pub message: String,
    /// Full header → value map of the source row, for display. Duplicate or
    /// blank headers collapse here, so sends read `cells` instead.
    pub row_data: IndexMap<String, String>,
    /// Source row cells by column position.
    #[serde(skip)]
    pub cells: Vec<String>,
    pub is_valid: bool,
    pub errors: Vec<String>,
}

/// Render one row against `template`. Column 0 is the destination phone
/// number.
pub fn materialize(
    template: &Template,
    row: &[String],
    mappings: &FieldMappingTable,
    headers: &[String],
) -> PreviewMessage {
    let phone_number = row.first().cloned().unwrap_or_default();
    let row_data: IndexMap<String, String> = headers
        .iter()
        .enumerate()
        .map(|(idx, header)| (header.clone(), row.get(idx).cloned().unwrap_or_default()))
        .collect();

    let Some(body) = template.body() else {
        return PreviewMessage {
            phone_number,
            message: MISSING_BODY_MESSAGE.to_string(),
            row_data,
            cells: row.to_vec(),
            is_valid: false,
            errors: vec![MISSING_BODY_ERROR.to_string()],
        };
    };

    let mut message = body.text.clone();
    let mut errors = Vec::new();

    for mapping in mappings.iter() {
        let value = row
            .get(mapping.column_index)
            .map(String::as_str)
            .unwrap_or("");
        if value.is_empty() {
            errors.push(format!("empty field for parameter {}", mapping.parameter_index));
        }
        message = message.replace(&placeholder(mapping.parameter_index), value);
    }

    let mut residual: Vec<&str> = Vec::new();
    for m in placeholder_regex().find_iter(&message) {
        if !residual.contains(&m.as_str()) {
            residual.push(m.as_str());
        }
    }
    if !residual.is_empty() {
        errors.push(format!("unmapped parameters: {}", residual.join(", ")));
    }

    PreviewMessage {
        phone_number,
        is_valid: errors.is_empty(),
        message,
        row_data,
        cells: row.to_vec(),
        errors,
    }
}

/// Materialize every row of `sheet`, preserving row order.
pub fn generate_previews(
    template: &Template,
    sheet: &SheetData,
    mappings: &FieldMappingTable,
) -> Vec<PreviewMessage> {
    sheet
        .rows
        .iter()
        .map(|row| materialize(template, row, mappings, &sheet.headers))
        .collect()
}

/// Render previews as CSV for export: `phone,message,valid,errors`.
pub fn previews_to_csv(previews: &[PreviewMessage]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(["phone", "message", "valid", "errors"])
        .context("Failed to write CSV header")?;

    for preview in previews {
        let errors = preview.errors.join("; ");
        writer
            .write_record([
                preview.phone_number.as_str(),
                preview.message.as_str(),
                if preview.is_valid { "yes" } else { "no" },
                errors.as_str(),
            ])
            .context("Failed to write CSV record")?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush CSV writer: {}", e))?;
    String::from_utf8(bytes).context("CSV output is not valid UTF-8")
}
