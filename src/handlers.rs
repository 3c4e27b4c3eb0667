//! HTTP Router & Handlers (component H): request routing, JSON/HTMX
//! responses, SSE stream, and media/asset passthrough (spec §4.8).

use crate::content::ContentService;
use crate::error::{ErrorKind, WikiError};
use crate::events::ChangeEvent;
use crate::json::StrictJson;
use crate::path;
use crate::search::{self, SearchOptions};
use axum::{
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, Sse},
        Html, IntoResponse, Redirect, Response,
    },
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::Stream;
use minijinja::{context, Environment};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ContentService>,
    pub templates: Arc<Environment<'static>>,
    pub dark_theme: bool,
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn landing(State(state): State<AppState>) -> Response {
    let tree = state.service.current_tree();
    match first_document_path(&tree) {
        Some(path) => Redirect::to(&format!("/page/{path}")).into_response(),
        None => match render_page(&state, "wikimd", "<p>No documents yet.</p>") {
            Ok(html) => Html(html).into_response(),
            Err(e) => e.into_response(),
        },
    }
}

fn first_document_path(node: &crate::tree::TreeNode) -> Option<String> {
    match &node.kind {
        crate::tree::NodeKind::File { .. } => Some(node.path.clone()),
        crate::tree::NodeKind::Directory { children } => {
            children.iter().find_map(first_document_path)
        }
    }
}

pub async fn page(State(state): State<AppState>, AxumPath(raw_path): AxumPath<String>) -> Response {
    let decoded = percent_decode(&raw_path);
    match state.service.document(&decoded) {
        Ok(doc) => {
            let title = doc.metadata.title.clone().unwrap_or_else(|| decoded.clone());
            match render_page(&state, &title, &doc.html) {
                Ok(html) => Html(html).into_response(),
                Err(e) => e.into_response(),
            }
        }
        // The page shell still renders on a missing document (spec §4.8):
        // a broken link lands on a navigable 404, not a bare status line.
        Err(_) => {
            let body = render_page(&state, "Not found", "<p>Document not found.</p>")
                .unwrap_or_else(|_| "<p>Document not found.</p>".to_string());
            (StatusCode::NOT_FOUND, Html(body)).into_response()
        }
    }
}

fn render_page(state: &AppState, title: &str, body: &str) -> Result<String, WikiError> {
    let theme = if state.dark_theme { "dark" } else { "light" };
    let tmpl = state
        .templates
        .get_template("page.html.jinja")
        .map_err(|e| WikiError::Internal(e.to_string()))?;
    tmpl.render(context! { theme, title, body })
        .map_err(|e| WikiError::Internal(e.to_string()))
}

#[derive(Deserialize)]
pub struct FormatParam {
    format: Option<String>,
}

pub async fn api_tree(
    State(state): State<AppState>,
    Query(params): Query<FormatParam>,
) -> Response {
    let tree = state.service.current_tree();
    if params.format.as_deref() == Some("htmx") {
        let tmpl = match state.templates.get_template("tree_fragment.html.jinja") {
            Ok(t) => t,
            Err(e) => return WikiError::Internal(e.to_string()).into_response(),
        };
        match tmpl.render(context! { tree => tree.as_ref() }) {
            Ok(html) => Html(html).into_response(),
            Err(e) => WikiError::Internal(e.to_string()).into_response(),
        }
    } else {
        Json(tree.as_ref()).into_response()
    }
}

pub async fn api_page(
    State(state): State<AppState>,
    AxumPath(raw_path): AxumPath<String>,
    Query(format): Query<FormatParam>,
) -> Response {
    let decoded = percent_decode(&raw_path);
    if decoded.trim().is_empty() {
        return bad_request("path is required");
    }
    match state.service.document(&decoded) {
        Ok(doc) => match format.format.as_deref() {
            Some("raw") | Some("markdown") => Json(json!({
                "raw": doc.raw_markdown,
                "path": decoded,
                "modified": to_rfc3339(doc.modified),
            }))
            .into_response(),
            _ => Json(json!({
                "html": doc.html,
                "metadata": doc.metadata,
                "modified": to_rfc3339(doc.modified),
                "path": decoded,
            }))
            .into_response(),
        },
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreatePageBody {
    path: String,
    content: String,
}

pub async fn create_page(
    State(state): State<AppState>,
    StrictJson(body): StrictJson<CreatePageBody>,
) -> Response {
    match state.service.create(&body.path, body.content.as_bytes()).await {
        Ok(()) => (StatusCode::CREATED, Json(json!({"path": body.path}))).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SavePageBody {
    content: String,
}

pub async fn save_page(
    State(state): State<AppState>,
    AxumPath(raw_path): AxumPath<String>,
    StrictJson(body): StrictJson<SavePageBody>,
) -> Response {
    let decoded = percent_decode(&raw_path);
    match state.service.save(&decoded, body.content.as_bytes()).await {
        Ok(()) => Json(json!({"path": decoded})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenamePageBody {
    from: String,
    to: String,
}

pub async fn rename_page(
    State(state): State<AppState>,
    StrictJson(body): StrictJson<RenamePageBody>,
) -> Response {
    match state.service.rename(&body.from, &body.to).await {
        Ok(()) => Json(json!({"from": body.from, "to": body.to})).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn delete_page(
    State(state): State<AppState>,
    AxumPath(raw_path): AxumPath<String>,
) -> Response {
    let decoded = percent_decode(&raw_path);
    match state.service.delete(&decoded).await {
        Ok(()) => Json(json!({"path": decoded})).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
pub struct SearchParams {
    q: Option<String>,
    #[serde(default)]
    case_sensitive: bool,
    #[serde(default)]
    context: usize,
    #[serde(default)]
    hidden: bool,
    format: Option<String>,
}

pub async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Response {
    let Some(query) = params.q.filter(|q| !q.trim().is_empty()) else {
        return bad_request("q is required");
    };

    let options = SearchOptions {
        case_sensitive: params.case_sensitive,
        context: params.context,
        hidden: params.hidden,
        ..Default::default()
    };

    // Tied to this handler's own future: if the client disconnects or the
    // outer request timeout fires, the future is dropped, the guard fires,
    // and the in-flight `rg` child is killed instead of running to completion.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    match search::search(state.service.root(), &query, &options, cancel).await {
        Ok(results) => {
            if params.format.as_deref() == Some("htmx") {
                let tmpl = match state.templates.get_template("search_fragment.html.jinja") {
                    Ok(t) => t,
                    Err(e) => return WikiError::Internal(e.to_string()).into_response(),
                };
                match tmpl.render(context! { results => results }) {
                    Ok(html) => Html(html).into_response(),
                    Err(e) => WikiError::Internal(e.to_string()).into_response(),
                }
            } else {
                Json(json!({"count": results.len(), "results": results})).into_response()
            }
        }
        Err(e) if e.kind() == ErrorKind::ServiceUnavailable => e.into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let cancel = CancellationToken::new();
    let mut rx = state.service.subscribe(cancel.clone());

    let stream = async_stream::stream! {
        yield Ok(SseEvent::default().comment("ready"));
        loop {
            match rx.recv().await {
                Some(event) => {
                    yield Ok(sse_event(&event));
                }
                None => break,
            }
        }
        cancel.cancel();
    };

    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default())
}

fn sse_event(event: &ChangeEvent) -> SseEvent {
    SseEvent::default().data(serde_json::to_string(event).unwrap_or_default())
}

pub async fn media(
    State(state): State<AppState>,
    AxumPath(raw_path): AxumPath<String>,
) -> Response {
    let decoded = percent_decode(&raw_path);
    if decoded.trim().is_empty() {
        return bad_request("path is required");
    }
    let validated = match path::validate_non_markdown(state.service.root(), &decoded) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    match tokio::fs::read(&validated).await {
        Ok(bytes) => {
            let mime = mime_guess_simple(&decoded);
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, mime)],
                Body::from(bytes),
            )
                .into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            WikiError::NotFound(validated).into_response()
        }
        Err(e) => WikiError::io("read media", &validated, e).into_response(),
    }
}

fn mime_guess_simple(relative: &str) -> &'static str {
    let lower = relative.to_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else if lower.ends_with(".svg") {
        "image/svg+xml"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".pdf") {
        "application/pdf"
    } else {
        "application/octet-stream"
    }
}

const MAX_CUSTOM_THEME_BYTES: u64 = 1024 * 1024;

pub async fn custom_theme(
    State(state): State<AppState>,
    AxumPath(index): AxumPath<u32>,
    headers: HeaderMap,
) -> Response {
    let candidates = [
        dirs_home_wikimd_css(),
        Some(state.service.root().join(".wikimd").join("custom.css")),
    ];
    let Some(Some(candidate)) = candidates.get(index as usize) else {
        return bad_request("invalid theme index");
    };
    if candidate.extension().and_then(|e| e.to_str()) != Some("css") {
        return (StatusCode::FORBIDDEN, "only .css files are served").into_response();
    }

    let allowed_dir = candidate.parent().map(|p| p.to_path_buf());
    let Some(allowed_dir) = allowed_dir else {
        return WikiError::NotFound(candidate.clone()).into_response();
    };
    let resolved = match path::validate_symlink_contained(candidate, &allowed_dir) {
        Ok(p) => p,
        Err(_) => return WikiError::NotFound(candidate.clone()).into_response(),
    };

    let meta = match tokio::fs::metadata(&resolved).await {
        Ok(m) => m,
        Err(_) => return WikiError::NotFound(resolved).into_response(),
    };
    if meta.len() > MAX_CUSTOM_THEME_BYTES {
        return (StatusCode::PAYLOAD_TOO_LARGE, "theme file too large").into_response();
    }

    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let http_date = httpdate::fmt_http_date(modified);

    if let Some(if_modified_since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
    {
        if modified <= if_modified_since {
            return StatusCode::NOT_MODIFIED.into_response();
        }
    }

    let bytes = match tokio::fs::read(&resolved).await {
        Ok(b) => b,
        Err(_) => return WikiError::NotFound(resolved).into_response(),
    };

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/css".to_string()),
            (header::LAST_MODIFIED, http_date),
            (
                header::CACHE_CONTROL,
                "public, max-age=60, must-revalidate".to_string(),
            ),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff".to_string()),
            (header::X_FRAME_OPTIONS, "DENY".to_string()),
        ],
        Body::from(bytes),
    )
        .into_response()
}

fn dirs_home_wikimd_css() -> Option<std::path::PathBuf> {
    std::env::var_os("HOME").map(|home| {
        std::path::PathBuf::from(home)
            .join(".wikimd")
            .join("custom.css")
    })
}

fn percent_decode(input: &str) -> String {
    percent_encoding::percent_decode_str(input)
        .decode_utf8_lossy()
        .trim()
        .to_string()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn to_rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true)
}
