//! WhatsApp Cloud API client: template listing and template message sends.

use crate::config::WhatsAppConfig;
use crate::dispatcher::{MessageSender, SendFailure, SendReceipt};
use crate::mapping::FieldMappingTable;
use crate::materializer::PreviewMessage;
use crate::template::{ApiTemplate, Template};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const TEMPLATE_PAGE_SIZE: u32 = 100;
const MAX_TEMPLATE_PAGES: usize = 10;
const DIAGNOSTIC_TEMPLATE_LIMIT: u32 = 5;
const ACCOUNT_FIELDS: &str =
    "id,name,account_review_status,business_verification_status,message_template_namespace";

#[derive(Debug, thiserror::Error)]
pub enum WhatsAppError {
    #[error("access token invalid or expired, check WHATSAPP_ACCESS_TOKEN")]
    Unauthorized,
    #[error("missing permission to read message templates")]
    Forbidden,
    #[error("WABA id not found, check META_WABA_ID")]
    AccountNotFound,
    #[error("{message}")]
    Api { status: u16, message: String },
    #[error("invalid header image url: {0:?}")]
    InvalidImageUrl(String),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Filters for template listing. Unset fields are not sent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateFilter {
    pub status: Option<String>,
    pub category: Option<String>,
    pub language: Option<String>,
}

impl TemplateFilter {
    pub fn approved() -> Self {
        Self {
            status: Some("APPROVED".to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct TemplatePage {
    #[serde(default)]
    data: Vec<ApiTemplate>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    cursors: Option<Cursors>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Cursors {
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Clone)]
pub struct WhatsAppClient {
    client: Client,
    base_url: String,
    access_token: String,
    phone_number_id: String,
    waba_id: String,
}

impl WhatsAppClient {
    pub fn new(config: &WhatsAppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url(),
            access_token: config.access_token.clone(),
            phone_number_id: config.phone_number_id.clone(),
            waba_id: config.waba_id.clone(),
        }
    }

    /// Fetch all templates matching `filter`, following paging cursors for at
    /// most ten pages.
    pub async fn list_templates(&self, filter: &TemplateFilter) -> Result<Vec<Template>, WhatsAppError> {
        let url = format!("{}/{}/message_templates", self.base_url, self.waba_id);
        let mut templates = Vec::new();
        let mut after: Option<String> = None;

        for page in 1..=MAX_TEMPLATE_PAGES {
            let mut query: Vec<(&str, String)> = vec![("limit", TEMPLATE_PAGE_SIZE.to_string())];
            if let Some(ref status) = filter.status {
                query.push(("status", status.clone()));
            }
            if let Some(ref category) = filter.category {
                query.push(("category", category.clone()));
            }
            if let Some(ref language) = filter.language {
                query.push(("language", language.clone()));
            }
            if let Some(ref cursor) = after {
                query.push(("after", cursor.clone()));
            }

            debug!("Fetching template page {} from {}", page, url);
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.access_token)
                .query(&query)
                .send()
                .await?;

            let status = resp.status();
            let body = resp.text().await?;
            if !status.is_success() {
                return Err(template_listing_error(status, &body));
            }

            let parsed: TemplatePage = serde_json::from_str(&body)?;
            templates.extend(parsed.data.into_iter().map(Template::from));

            after = next_cursor(parsed.paging);
            if after.is_none() {
                break;
            }
        }

        info!("Fetched {} templates", templates.len());
        Ok(templates)
    }

    /// POST a prepared `/messages` payload.
    pub async fn post_message(&self, payload: &Value) -> Result<SendReceipt, WhatsAppError> {
        let url = format!("{}/{}/messages", self.base_url, self.phone_number_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        let parsed: SendResponse = serde_json::from_value(parse_api_response(status, &body)?)?;
        Ok(SendReceipt {
            message_id: parsed.messages.into_iter().next().map(|m| m.id),
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, WhatsAppError> {
        debug!("GET {}", url);
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        parse_api_response(status, &body)
    }

    /// Identity behind the access token (`GET /me`).
    pub async fn me(&self) -> Result<Value, WhatsAppError> {
        self.get_json(&format!("{}/me", self.base_url), &[]).await
    }

    /// Business account details (`GET /{waba_id}`).
    pub async fn account_info(&self) -> Result<Value, WhatsAppError> {
        let url = format!("{}/{}", self.base_url, self.waba_id);
        self.get_json(&url, &[("fields", ACCOUNT_FIELDS.to_string())]).await
    }

    /// Number of templates on a small first page, to check read access.
    pub async fn sample_templates(&self) -> Result<usize, WhatsAppError> {
        let url = format!("{}/{}/message_templates", self.base_url, self.waba_id);
        let body = self
            .get_json(&url, &[("limit", DIAGNOSTIC_TEMPLATE_LIMIT.to_string())])
            .await?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0))
    }

    /// Fetch a single template by id.
    pub async fn get_template(&self, id: &str) -> Result<Template, WhatsAppError> {
        let body = self.get_json(&format!("{}/{}", self.base_url, id), &[]).await?;
        let template: ApiTemplate = serde_json::from_value(body)?;
        Ok(template.into())
    }

    /// Check the token and the business account before loading templates.
    pub async fn validate(&self) -> Result<(), WhatsAppError> {
        self.me().await?;
        self.account_info().await?;
        Ok(())
    }

    /// Run the connection checks in order, stopping at the first failure.
    pub async fn diagnose(&self) -> Diagnostics {
        let mut report = Diagnostics::default();

        if let Err(e) = self.me().await {
            warn!("Connection check failed: {}", e);
            report.error = Some(e.to_string());
            return report;
        }
        report.connection = true;

        match self.account_info().await {
            Ok(info) => report.account = Some(info),
            Err(e) => {
                warn!("Account check failed: {}", e);
                report.error = Some(e.to_string());
                return report;
            }
        }

        match self.sample_templates().await {
            Ok(count) => {
                report.templates_access = true;
                report.templates_count = count;
            }
            Err(e) => {
                warn!("Template access check failed: {}", e);
                report.error = Some(e.to_string());
            }
        }
        report
    }
}

/// Outcome of [`WhatsAppClient::diagnose`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub connection: bool,
    /// Business account fields, present once the account check passed.
    pub account: Option<Value>,
    pub templates_access: bool,
    pub templates_count: usize,
    pub error: Option<String>,
}

/// Build the `/messages` request body for a template send.
///
/// An IMAGE header adds a header component linking `header_image_url`, which
/// must be an absolute URL. Body parameters are added only when present.
pub fn build_message_payload(
    to: &str,
    template: &Template,
    parameters: &[String],
    header_image_url: Option<&str>,
) -> Result<Value, WhatsAppError> {
    let mut components = Vec::new();

    if template.has_image_header() {
        let link = header_image_url.unwrap_or_default();
        reqwest::Url::parse(link).map_err(|_| WhatsAppError::InvalidImageUrl(link.to_string()))?;
        components.push(json!({
            "type": "header",
            "parameters": [{ "type": "image", "image": { "link": link } }]
        }));
    }

    if template.body().is_some() && !parameters.is_empty() {
        let params: Vec<Value> = parameters
            .iter()
            .map(|p| json!({ "type": "text", "text": p }))
            .collect();
        components.push(json!({ "type": "body", "parameters": params }));
    }

    let mut template_obj = json!({
        "name": template.name,
        "language": { "code": template.language },
    });
    if !components.is_empty() {
        template_obj["components"] = Value::Array(components);
    }

    Ok(json!({
        "messaging_product": "whatsapp",
        "to": to,
        "type": "template",
        "template": template_obj,
    }))
}

/// Human-readable message from a Graph API error body: `error.message`, then
/// `message`, then the raw body, then the HTTP status.
pub fn api_error_message(status: StatusCode, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| (!body.trim().is_empty()).then(|| body.to_string()))
        .unwrap_or_else(|| format!("HTTP {}", status))
}

/// Decode a successful body, or turn a failed one into [`WhatsAppError::Api`].
fn parse_api_response(status: StatusCode, body: &str) -> Result<Value, WhatsAppError> {
    if !status.is_success() {
        return Err(WhatsAppError::Api {
            status: status.as_u16(),
            message: api_error_message(status, body),
        });
    }
    Ok(serde_json::from_str(body)?)
}

/// Cursor for the next template page. Only followed while the API reports a
/// `next` link.
fn next_cursor(paging: Option<Paging>) -> Option<String> {
    paging
        .filter(|p| p.next.is_some())
        .and_then(|p| p.cursors)
        .and_then(|c| c.after)
}

fn template_listing_error(status: StatusCode, body: &str) -> WhatsAppError {
    let code = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/code").and_then(Value::as_i64));

    match (status, code) {
        (StatusCode::UNAUTHORIZED, _) | (_, Some(190)) => WhatsAppError::Unauthorized,
        (StatusCode::FORBIDDEN, _) => WhatsAppError::Forbidden,
        (StatusCode::NOT_FOUND, _) => WhatsAppError::AccountNotFound,
        _ => WhatsAppError::Api {
            status: status.as_u16(),
            message: api_error_message(status, body),
        },
    }
}

/// Parameters and `/messages` body for one preview.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub parameters: Vec<String>,
    pub payload: Value,
}

/// Build the request that sends `message`. Parameters come from the
/// preview's row cells by column position, so they match the substituted
/// preview text.
pub fn build_send_request(
    template: &Template,
    mappings: &FieldMappingTable,
    message: &PreviewMessage,
    header_image_url: Option<&str>,
) -> Result<SendRequest, WhatsAppError> {
    let parameters = mappings.parameter_values(&message.cells);
    let payload = build_message_payload(&message.phone_number, template, &parameters, header_image_url)?;
    Ok(SendRequest { parameters, payload })
}

/// Sends one preview through the Cloud API using the selected template and
/// field mappings.
#[derive(Clone)]
pub struct TemplateMessageSender {
    client: WhatsAppClient,
    template: Template,
    mappings: FieldMappingTable,
    header_image_url: Option<String>,
}

impl TemplateMessageSender {
    pub fn new(
        client: WhatsAppClient,
        template: Template,
        mappings: FieldMappingTable,
        header_image_url: Option<String>,
    ) -> Self {
        Self {
            client,
            template,
            mappings,
            header_image_url,
        }
    }

    pub fn request_for(&self, message: &PreviewMessage) -> Result<SendRequest, WhatsAppError> {
        build_send_request(
            &self.template,
            &self.mappings,
            message,
            self.header_image_url.as_deref(),
        )
    }
}

#[async_trait::async_trait]
impl MessageSender for TemplateMessageSender {
    async fn send(&self, message: &PreviewMessage) -> Result<SendReceipt, SendFailure> {
        let request = self
            .request_for(message)
            .map_err(|e| SendFailure::new(e.to_string()))?;
        debug!(
            "Sending template '{}' to {} ({} parameters)",
            self.template.name,
            message.phone_number,
            request.parameters.len()
        );
        self.client
            .post_message(&request.payload)
            .await
            .map_err(|e| SendFailure::new(e.to_string()))
    }
}
