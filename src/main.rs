//! Template Dispatch - bulk WhatsApp template messaging server.
//!
//! Fetches approved templates, maps spreadsheet columns onto template
//! placeholders, previews the rendered messages and sends them in paced
//! batches.

mod config;
mod dispatcher;
mod mapping;
mod materializer;
mod session;
mod template;
mod whatsapp;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{delete, get, post, put},
    Router,
};
use config::{AppConfig, ConfigSummary};
use dispatcher::BatchResult;
use materializer::{PreviewMessage, SheetData};
use session::{MappingStatus, Session, SessionError};
use std::sync::Arc;
use template::Template;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use whatsapp::{Diagnostics, TemplateFilter, TemplateMessageSender, WhatsAppClient};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    session: Arc<RwLock<Session>>,
    whatsapp: Arc<WhatsAppClient>,
    config: Arc<AppConfig>,
}

type ApiError = (StatusCode, String);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "template_dispatch=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    info!(
        "WhatsApp API at {} (group size {}, delay {} ms)",
        config.whatsapp.base_url(),
        config.dispatch.group_size,
        config.dispatch.delay_ms
    );

    let state = AppState {
        session: Arc::new(RwLock::new(Session::new())),
        whatsapp: Arc::new(WhatsAppClient::new(&config.whatsapp)),
        config: Arc::new(config),
    };
    let bind_addr = state.config.bind_addr.clone();

    let app = Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/diagnostics", get(diagnostics))
        .route("/templates", get(list_templates))
        .route("/templates/:id", get(get_template))
        .route("/session/template", post(select_template))
        .route("/session/sheet", post(load_sheet).delete(clear_sheet))
        .route("/session/header-image", put(set_header_image))
        .route("/session/mappings", post(add_mapping).delete(clear_mappings))
        .route("/session/mappings/status", get(mapping_status))
        .route("/session/mappings/:parameter_index", delete(remove_mapping))
        .route("/session/reset", post(reset_session))
        .route("/previews", get(list_previews))
        .route("/previews/export", get(export_previews))
        .route("/dispatch", post(dispatch_messages))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Active configuration with the access token redacted.
async fn get_config(State(state): State<AppState>) -> Json<ConfigSummary> {
    Json(state.config.summary())
}

/// Fetch templates from the WhatsApp API (approved only unless filtered).
async fn list_templates(
    State(state): State<AppState>,
    Query(filter): Query<TemplateFilter>,
) -> Result<Json<Vec<Template>>, ApiError> {
    let filter = if filter.status.is_none() && filter.category.is_none() && filter.language.is_none() {
        TemplateFilter::approved()
    } else {
        filter
    };

    state.whatsapp.validate().await.map_err(|e| {
        error!("WhatsApp API validation failed: {}", e);
        (StatusCode::BAD_GATEWAY, format!("API configuration invalid: {}", e))
    })?;

    let templates = state.whatsapp.list_templates(&filter).await.map_err(|e| {
        error!("Template fetch failed: {}", e);
        (StatusCode::BAD_GATEWAY, e.to_string())
    })?;

    state.session.write().await.set_templates(templates.clone());
    Ok(Json(templates))
}

/// Fetch one template by id straight from the API.
async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Template>, ApiError> {
    state.whatsapp.get_template(&id).await.map(Json).map_err(|e| {
        error!("Template {} fetch failed: {}", id, e);
        (StatusCode::BAD_GATEWAY, e.to_string())
    })
}

/// Step-by-step API checks: token, business account, template access.
async fn diagnostics(State(state): State<AppState>) -> Json<Diagnostics> {
    Json(state.whatsapp.diagnose().await)
}

#[derive(serde::Deserialize)]
struct SelectTemplate {
    template_id: Option<String>,
    template: Option<Template>,
}

/// Select a fetched template by id, or supply one inline.
async fn select_template(
    State(state): State<AppState>,
    Json(body): Json<SelectTemplate>,
) -> Result<Json<Template>, ApiError> {
    let mut session = state.session.write().await;
    match (body.template, body.template_id) {
        (Some(template), _) => session.select_template(template),
        (None, Some(id)) => session.select_template_by_id(&id).map_err(session_error)?,
        (None, None) => {
            return Err((
                StatusCode::BAD_REQUEST,
                "Provide template_id or template".to_string(),
            ))
        }
    }
    session
        .selected_template()
        .cloned()
        .map(Json)
        .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "Template selection lost".to_string()))
}

/// Load an already-parsed spreadsheet.
async fn load_sheet(
    State(state): State<AppState>,
    Json(sheet): Json<SheetData>,
) -> Result<StatusCode, ApiError> {
    if sheet.headers.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Sheet has no headers".to_string()));
    }
    state.session.write().await.load_sheet(sheet);
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_sheet(State(state): State<AppState>) -> StatusCode {
    state.session.write().await.clear_sheet();
    StatusCode::NO_CONTENT
}

#[derive(serde::Deserialize)]
struct HeaderImage {
    url: Option<String>,
}

/// Override the configured header image link for this session.
async fn set_header_image(
    State(state): State<AppState>,
    Json(body): Json<HeaderImage>,
) -> Result<StatusCode, ApiError> {
    if let Some(ref url) = body.url {
        reqwest::Url::parse(url)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid image url: {}", e)))?;
    }
    state.session.write().await.set_header_image_url(body.url);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(serde::Deserialize)]
struct MapColumn {
    /// `None` unmaps whatever parameter the column held.
    parameter_index: Option<u32>,
    column_index: usize,
}

/// Map a column to a parameter, evicting conflicting mappings.
async fn add_mapping(
    State(state): State<AppState>,
    Json(body): Json<MapColumn>,
) -> Result<Json<MappingStatus>, ApiError> {
    let mut session = state.session.write().await;
    match body.parameter_index {
        Some(parameter_index) => session
            .map_column(parameter_index, body.column_index)
            .map_err(session_error)?,
        None => {
            session.unmap_column(body.column_index);
        }
    }
    session.mapping_status().map(Json).map_err(session_error)
}

async fn remove_mapping(
    State(state): State<AppState>,
    Path(parameter_index): Path<u32>,
) -> Result<Json<MappingStatus>, ApiError> {
    let mut session = state.session.write().await;
    session.unmap_parameter(parameter_index);
    session.mapping_status().map(Json).map_err(session_error)
}

async fn clear_mappings(State(state): State<AppState>) -> StatusCode {
    state.session.write().await.clear_mappings();
    StatusCode::NO_CONTENT
}

async fn mapping_status(State(state): State<AppState>) -> Result<Json<MappingStatus>, ApiError> {
    state
        .session
        .read()
        .await
        .mapping_status()
        .map(Json)
        .map_err(session_error)
}

async fn reset_session(State(state): State<AppState>) -> StatusCode {
    state.session.write().await.reset();
    StatusCode::NO_CONTENT
}

#[derive(serde::Serialize)]
struct PreviewSummary {
    total: usize,
    valid: usize,
    invalid: usize,
    messages: Vec<PreviewMessage>,
}

async fn list_previews(State(state): State<AppState>) -> Json<PreviewSummary> {
    let session = state.session.read().await;
    let messages = session.previews().to_vec();
    let valid = messages.iter().filter(|m| m.is_valid).count();
    Json(PreviewSummary {
        total: messages.len(),
        valid,
        invalid: messages.len() - valid,
        messages,
    })
}

/// Download the previews as CSV.
async fn export_previews(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let csv = materializer::previews_to_csv(state.session.read().await.previews()).map_err(|e| {
        error!("Preview export failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"message_preview.csv\""),
        ],
        csv,
    ))
}

#[derive(serde::Deserialize, Default)]
struct DispatchRequest {
    /// Preview positions to send; empty or absent sends every valid preview.
    #[serde(default)]
    indices: Vec<usize>,
}

/// Send the selected valid previews in paced groups.
async fn dispatch_messages(
    State(state): State<AppState>,
    body: Option<Json<DispatchRequest>>,
) -> Result<Json<BatchResult>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let (messages, sender) = {
        let session = state.session.read().await;
        let template = session
            .selected_template()
            .cloned()
            .ok_or_else(|| session_error(SessionError::NoTemplate))?;

        let status = session.mapping_status().map_err(session_error)?;
        if !status.complete {
            return Err((
                StatusCode::CONFLICT,
                format!("Unmapped template parameters: {:?}", status.missing),
            ));
        }

        let header_image_url = session
            .header_image_url()
            .map(str::to_string)
            .or_else(|| state.config.whatsapp.default_header_image_url.clone());
        let sender = TemplateMessageSender::new(
            (*state.whatsapp).clone(),
            template,
            session.mappings().clone(),
            header_image_url,
        );
        (session.dispatch_selection(&request.indices), sender)
    };

    if messages.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No valid messages selected".to_string()));
    }

    let options = state.config.dispatch.options();
    let result = dispatcher::dispatch(&messages, &sender, &options, |p| {
        info!(
            "Progress: {}/{} ({} sent, {} failed)",
            p.processed, p.total, p.sent, p.failed
        );
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(result))
}

fn session_error(e: SessionError) -> ApiError {
    let status = match e {
        SessionError::TemplateNotFound(_) => StatusCode::NOT_FOUND,
        SessionError::NoTemplate | SessionError::NoSheet => StatusCode::CONFLICT,
        SessionError::UnknownParameter(_) | SessionError::ColumnOutOfRange { .. } => {
            StatusCode::BAD_REQUEST
        }
    };
    (status, e.to_string())
}
