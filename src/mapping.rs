//! Field mapping between template placeholders and spreadsheet columns.

use crate::template::Template;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Binds template parameter `{{parameter_index}}` to spreadsheet column
/// `column_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub parameter_index: u32,
    pub column_index: usize,
    pub column_name: String,
    pub parameter_type: String,
}

/// Mapping set kept as a partial bijection: no two entries share a
/// parameter index and no two share a column index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldMappingTable {
    mappings: Vec<FieldMapping>,
}

impl FieldMappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `mapping`, first evicting whatever held its column and whatever
    /// held its parameter. Returns the evicted entries.
    pub fn add(&mut self, mapping: FieldMapping) -> Vec<FieldMapping> {
        let mut evicted = Vec::new();
        self.mappings.retain(|m| {
            let collides = m.column_index == mapping.column_index
                || m.parameter_index == mapping.parameter_index;
            if collides {
                evicted.push(m.clone());
            }
            !collides
        });

        debug!(
            "Mapping {{{{{}}}}} -> column {} ({}), evicted {}",
            mapping.parameter_index,
            mapping.column_index,
            mapping.column_name,
            evicted.len()
        );

        self.mappings.push(mapping);
        evicted
    }

    /// Remove the mapping for `parameter_index`. Removing an absent mapping
    /// is a no-op.
    pub fn remove(&mut self, parameter_index: u32) -> Option<FieldMapping> {
        let pos = self
            .mappings
            .iter()
            .position(|m| m.parameter_index == parameter_index)?;
        Some(self.mappings.remove(pos))
    }

    /// Unmap whichever parameter is bound to `column_index`.
    pub fn remove_column(&mut self, column_index: usize) -> Option<FieldMapping> {
        let parameter_index = self.by_column(column_index)?.parameter_index;
        self.remove(parameter_index)
    }

    pub fn clear(&mut self) {
        self.mappings.clear();
    }

    pub fn by_parameter(&self, parameter_index: u32) -> Option<&FieldMapping> {
        self.mappings
            .iter()
            .find(|m| m.parameter_index == parameter_index)
    }

    pub fn by_column(&self, column_index: usize) -> Option<&FieldMapping> {
        self.mappings.iter().find(|m| m.column_index == column_index)
    }

    /// Mappings in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldMapping> {
        self.mappings.iter()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Template parameter indices with no mapping, ascending.
    pub fn missing_parameters(&self, template: &Template) -> Vec<u32> {
        template
            .parameter_indices()
            .into_iter()
            .filter(|index| self.by_parameter(*index).is_none())
            .collect()
    }

    /// True when every distinct parameter of `template` is mapped.
    pub fn is_complete(&self, template: &Template) -> bool {
        self.missing_parameters(template).is_empty()
    }

    /// Mapped cell values ordered by parameter index, read from `cells` by
    /// column position the same way previews are rendered. A missing cell
    /// yields an empty string.
    ///
    /// Every value is sent as a BODY parameter, including values for
    /// placeholders that appear only in a TEXT header.
    pub fn parameter_values(&self, cells: &[String]) -> Vec<String> {
        let mut ordered: Vec<&FieldMapping> = self.mappings.iter().collect();
        ordered.sort_by_key(|m| m.parameter_index);
        ordered
            .into_iter()
            .map(|m| cells.get(m.column_index).cloned().unwrap_or_default())
            .collect()
    }
}
