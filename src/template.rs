//! Message template model.
//!
//! Templates are fetched from the WhatsApp Business API in their raw Graph
//! form ([`ApiTemplate`]) and converted once into [`Template`], which the rest
//! of the crate treats as immutable.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Matches a numbered placeholder such as `{{3}}`, capturing the digits.
pub fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{(\d+)\}\}").expect("placeholder pattern is valid"))
}

/// Literal placeholder text for a parameter index.
pub fn placeholder(index: u32) -> String {
    format!("{{{{{}}}}}", index)
}

/// Distinct positive placeholder indices found in `text`, ascending.
pub fn placeholder_indices(text: &str) -> Vec<u32> {
    let indices: BTreeSet<u32> = placeholder_regex()
        .captures_iter(text)
        .filter_map(|caps| caps[1].parse::<u32>().ok())
        .filter(|index| *index > 0)
        .collect();
    indices.into_iter().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComponentType {
    Header,
    Body,
    Footer,
    Buttons,
}

/// A numbered substitution point inside a component's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub index: u32,
    #[serde(rename = "type")]
    pub param_type: String,
    pub required: bool,
    /// Sample value supplied by the template author, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    /// TEXT, IMAGE, VIDEO or DOCUMENT.
    pub format: String,
    pub text: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buttons: Option<serde_json::Value>,
}

impl Component {
    pub fn is_image_header(&self) -> bool {
        self.component_type == ComponentType::Header && self.format.eq_ignore_ascii_case("IMAGE")
    }
}

/// An approved message template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub category: String,
    pub components: Vec<Component>,
}

impl Template {
    /// The BODY component, if the template has one.
    pub fn body(&self) -> Option<&Component> {
        self.component(ComponentType::Body)
    }

    pub fn header(&self) -> Option<&Component> {
        self.component(ComponentType::Header)
    }

    fn component(&self, component_type: ComponentType) -> Option<&Component> {
        self.components
            .iter()
            .find(|c| c.component_type == component_type)
    }

    /// Whether sending this template requires a header image link.
    pub fn has_image_header(&self) -> bool {
        self.header().map(Component::is_image_header).unwrap_or(false)
    }

    /// Distinct parameter indices across all components.
    pub fn parameter_indices(&self) -> BTreeSet<u32> {
        self.components
            .iter()
            .flat_map(|c| c.parameters.iter().map(|p| p.index))
            .collect()
    }

    /// First parameter with `index`, in component order.
    pub fn parameter(&self, index: u32) -> Option<&Parameter> {
        self.components
            .iter()
            .flat_map(|c| c.parameters.iter())
            .find(|p| p.index == index)
    }
}

// ============================================================================
// Graph API representation
// ============================================================================

/// Template as returned by `GET /{waba_id}/message_templates`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiTemplate {
    pub id: String,
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub components: Vec<ApiComponent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiComponent {
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub example: Option<ApiExample>,
    #[serde(default)]
    pub buttons: Option<serde_json::Value>,
}

/// Author-supplied sample values. `body_text` holds one list of samples per
/// example set; only the first set is used.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiExample {
    #[serde(default)]
    pub body_text: Vec<Vec<String>>,
}

impl From<ApiTemplate> for Template {
    fn from(api: ApiTemplate) -> Self {
        Self {
            id: api.id,
            name: api.name,
            language: api.language,
            status: api.status,
            category: api.category,
            components: api.components.into_iter().map(Component::from).collect(),
        }
    }
}

impl From<ApiComponent> for Component {
    fn from(api: ApiComponent) -> Self {
        let text = api.text.unwrap_or_default();
        let samples: Vec<String> = api
            .example
            .and_then(|e| e.body_text.into_iter().next())
            .unwrap_or_default();

        let mut parameters: Vec<Parameter> = placeholder_indices(&text)
            .into_iter()
            .map(|index| Parameter {
                index,
                param_type: "TEXT".to_string(),
                required: true,
                example: None,
            })
            .collect();

        if parameters.is_empty() {
            // No placeholders in the text; infer them from the samples.
            parameters = (1u32..)
                .zip(samples.iter())
                .map(|(index, sample)| Parameter {
                    index,
                    param_type: "TEXT".to_string(),
                    required: true,
                    example: Some(sample.clone()),
                })
                .collect();
        } else {
            for (param, sample) in parameters.iter_mut().zip(samples) {
                param.example = Some(sample);
            }
        }

        Self {
            component_type: api.component_type,
            format: api.format.unwrap_or_else(|| "TEXT".to_string()),
            text,
            parameters,
            buttons: api.buttons,
        }
    }
}
