//! HTTP Router & Handlers wiring (component H): builds the axum `Router`
//! from the handlers in `handlers.rs`, applies the CSRF gate and the
//! panic-recovery / request-logging middleware, and serves embedded
//! static assets and Jinja templates (spec §4.8, §7).

use crate::config::Config;
use crate::content::ContentService;
use crate::csrf;
use crate::handlers::{self, AppState};
use axum::{
    body::Body,
    extract::{Path as AxumPath, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use include_dir::{include_dir, Dir};
use minijinja::Environment;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;

/// Embedded template sources, compiled into the Jinja environment at
/// startup. `--assets` overrides only the static asset directory, not
/// these, since templates are part of the application shell rather
/// than themable content.
static TEMPLATES_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/templates");
static STATIC_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/static");

/// Approximates the write-phase timeout from spec §5; axum's `serve`
/// does not expose hyper's separate read-header/read/idle phases, so a
/// single whole-request timeout stands in for all of them.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_templates() -> Environment<'static> {
    let mut env = Environment::new();
    for file in TEMPLATES_DIR.files() {
        if let (Some(name), Some(contents)) = (file.path().to_str(), file.contents_utf8()) {
            env.add_template_owned(name.to_string(), contents.to_string())
                .expect("embedded template must parse");
        }
    }
    env
}

pub fn build_router(service: Arc<ContentService>, config: &Config) -> Router {
    let state = AppState {
        service,
        templates: Arc::new(build_templates()),
        dark_theme: config.dark,
    };

    let mut router = Router::new()
        .route("/", get(handlers::landing))
        .route("/page/*path", get(handlers::page))
        .route("/api/tree", get(handlers::api_tree))
        .route("/api/page", post(handlers::create_page))
        .route("/api/page/rename", post(handlers::rename_page))
        .route(
            "/api/page/*path",
            get(handlers::api_page)
                .put(handlers::save_page)
                .delete(handlers::delete_page),
        )
        .route("/api/search", get(handlers::search_handler))
        .route("/events", get(handlers::events_stream))
        .route("/media/*path", get(handlers::media))
        .route("/custom-theme/:index", get(handlers::custom_theme))
        .route("/healthz", get(handlers::healthz));

    router = match &config.assets {
        Some(dir) => router.nest_service("/static", ServeDir::new(dir)),
        None => router.route("/static/*path", get(static_asset)),
    };

    let mut app = router.with_state(state);

    if config.verbose {
        app = app.layer(middleware::from_fn(log_requests));
    }

    app.layer(middleware::from_fn(csrf::guard))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}

async fn static_asset(AxumPath(requested): AxumPath<String>) -> Response {
    match STATIC_DIR.get_file(&requested) {
        Some(file) => {
            let mime = guess_static_mime(&requested);
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, mime)],
                Body::from(file.contents()),
            )
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn guess_static_mime(path: &str) -> &'static str {
    if path.ends_with(".css") {
        "text/css"
    } else if path.ends_with(".js") {
        "application/javascript"
    } else if path.ends_with(".svg") {
        "image/svg+xml"
    } else {
        "application/octet-stream"
    }
}

async fn log_requests(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(req).await;
    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %message, "handler panicked");
    crate::error::WikiError::Internal("internal error".to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_compile() {
        let env = build_templates();
        assert!(env.get_template("page.html.jinja").is_ok());
        assert!(env.get_template("tree_fragment.html.jinja").is_ok());
        assert!(env.get_template("search_fragment.html.jinja").is_ok());
    }

    #[test]
    fn static_assets_are_embedded() {
        assert!(STATIC_DIR.get_file("wiki.css").is_some());
    }
}
