//! Application state for one messaging workflow: selected template, loaded
//! sheet, field mappings and the previews derived from them.
//!
//! Previews are recomputed on every change to the template, sheet or
//! mappings. The core modules never see this struct; it hands them explicit
//! arguments.

use crate::mapping::{FieldMapping, FieldMappingTable};
use crate::materializer::{generate_previews, PreviewMessage, SheetData};
use crate::template::Template;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("no template selected")]
    NoTemplate,
    #[error("no spreadsheet loaded")]
    NoSheet,
    #[error("template {0} not found")]
    TemplateNotFound(String),
    #[error("template has no parameter {{{{{0}}}}}")]
    UnknownParameter(u32),
    #[error("column {column} out of range ({columns} columns)")]
    ColumnOutOfRange { column: usize, columns: usize },
}

/// Mapping progress against the selected template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingStatus {
    pub complete: bool,
    pub mapped: usize,
    pub missing: Vec<u32>,
    pub mappings: FieldMappingTable,
}

#[derive(Debug, Default)]
pub struct Session {
    templates: Vec<Template>,
    selected_template: Option<Template>,
    sheet: Option<SheetData>,
    mappings: FieldMappingTable,
    previews: Vec<PreviewMessage>,
    header_image_url: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn set_templates(&mut self, templates: Vec<Template>) {
        self.templates = templates;
    }

    pub fn selected_template(&self) -> Option<&Template> {
        self.selected_template.as_ref()
    }

    pub fn sheet(&self) -> Option<&SheetData> {
        self.sheet.as_ref()
    }

    pub fn mappings(&self) -> &FieldMappingTable {
        &self.mappings
    }

    pub fn previews(&self) -> &[PreviewMessage] {
        &self.previews
    }

    pub fn header_image_url(&self) -> Option<&str> {
        self.header_image_url.as_deref()
    }

    pub fn set_header_image_url(&mut self, url: Option<String>) {
        self.header_image_url = url;
    }

    /// Select a template. Mappings from any previous template are dropped.
    pub fn select_template(&mut self, template: Template) {
        info!("Selected template '{}' ({})", template.name, template.id);
        self.selected_template = Some(template);
        self.mappings.clear();
        self.refresh_previews();
    }

    /// Select one of the fetched templates by id.
    pub fn select_template_by_id(&mut self, id: &str) -> Result<(), SessionError> {
        let template = self
            .templates
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| SessionError::TemplateNotFound(id.to_string()))?;
        self.select_template(template);
        Ok(())
    }

    /// Load a spreadsheet. Existing mappings refer to the old columns and are
    /// dropped.
    pub fn load_sheet(&mut self, sheet: SheetData) {
        info!(
            "Loaded sheet with {} columns and {} rows",
            sheet.headers.len(),
            sheet.rows.len()
        );
        self.sheet = Some(sheet);
        self.mappings.clear();
        self.refresh_previews();
    }

    pub fn clear_sheet(&mut self) {
        self.sheet = None;
        self.mappings.clear();
        self.refresh_previews();
    }

    /// Bind template parameter `parameter_index` to sheet column
    /// `column_index`, evicting conflicting mappings.
    pub fn map_column(&mut self, parameter_index: u32, column_index: usize) -> Result<(), SessionError> {
        let template = self.selected_template.as_ref().ok_or(SessionError::NoTemplate)?;
        let sheet = self.sheet.as_ref().ok_or(SessionError::NoSheet)?;

        let column_name = sheet
            .headers
            .get(column_index)
            .cloned()
            .ok_or(SessionError::ColumnOutOfRange {
                column: column_index,
                columns: sheet.headers.len(),
            })?;
        let parameter = template
            .parameter(parameter_index)
            .ok_or(SessionError::UnknownParameter(parameter_index))?;

        let mapping = FieldMapping {
            parameter_index,
            column_index,
            column_name,
            parameter_type: parameter.param_type.clone(),
        };
        self.mappings.add(mapping);
        self.refresh_previews();
        Ok(())
    }

    pub fn unmap_parameter(&mut self, parameter_index: u32) -> Option<FieldMapping> {
        let removed = self.mappings.remove(parameter_index);
        if removed.is_some() {
            self.refresh_previews();
        }
        removed
    }

    pub fn unmap_column(&mut self, column_index: usize) -> Option<FieldMapping> {
        let removed = self.mappings.remove_column(column_index);
        if removed.is_some() {
            self.refresh_previews();
        }
        removed
    }

    pub fn clear_mappings(&mut self) {
        self.mappings.clear();
        self.refresh_previews();
    }

    pub fn mapping_status(&self) -> Result<MappingStatus, SessionError> {
        let template = self.selected_template.as_ref().ok_or(SessionError::NoTemplate)?;
        let missing = self.mappings.missing_parameters(template);
        Ok(MappingStatus {
            complete: missing.is_empty(),
            mapped: self.mappings.len(),
            missing,
            mappings: self.mappings.clone(),
        })
    }

    /// Valid previews to send. `indices` picks previews by position; an empty
    /// selection means every preview. Out-of-range indices are ignored.
    pub fn dispatch_selection(&self, indices: &[usize]) -> Vec<PreviewMessage> {
        if indices.is_empty() {
            return self.previews.iter().filter(|p| p.is_valid).cloned().collect();
        }
        let mut picked: Vec<usize> = indices.to_vec();
        picked.sort_unstable();
        picked.dedup();
        picked
            .into_iter()
            .filter_map(|idx| self.previews.get(idx))
            .filter(|p| p.is_valid)
            .cloned()
            .collect()
    }

    /// Drop template selection, sheet, mappings and previews. Fetched
    /// templates are kept.
    pub fn reset(&mut self) {
        self.selected_template = None;
        self.sheet = None;
        self.mappings.clear();
        self.previews.clear();
    }

    fn refresh_previews(&mut self) {
        self.previews = match (&self.selected_template, &self.sheet) {
            (Some(template), Some(sheet)) if !self.mappings.is_empty() => {
                generate_previews(template, sheet, &self.mappings)
            }
            _ => Vec::new(),
        };
    }
}
