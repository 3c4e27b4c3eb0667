//! CSRF Gate (component G): Origin/Referer validation for mutating
//! requests, applied as axum middleware ahead of routing.

use axum::{
    extract::Request,
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

const BYPASS_PATHS: &[&str] = &["/healthz"];
const BYPASS_PREFIXES: &[&str] = &["/static/"];

pub async fn guard(request: Request, next: Next) -> Response {
    if is_safe(&request) {
        return next.run(request).await;
    }

    let Some(host) = request_host(&request) else {
        return forbidden();
    };

    let candidate = request
        .headers()
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| {
            request
                .headers()
                .get(axum::http::header::REFERER)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        });

    match candidate.as_deref().and_then(header_host) {
        Some(header_host) if hosts_equivalent(&header_host, &host) => next.run(request).await,
        _ => forbidden(),
    }
}

fn is_safe(request: &Request) -> bool {
    if matches!(request.method(), &Method::GET | &Method::HEAD | &Method::OPTIONS) {
        return true;
    }
    let path = request.uri().path();
    BYPASS_PATHS.contains(&path) || BYPASS_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

fn request_host(request: &Request) -> Option<String> {
    request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(strip_port)
}

/// Extracts the host (port stripped) from an `Origin` or `Referer`
/// header value, which may be a full URL or bare `scheme://host[:port]`.
fn header_host(value: &str) -> Option<String> {
    let without_scheme = value.split("://").nth(1).unwrap_or(value);
    let host_and_port = without_scheme.split(['/', '?', '#']).next()?;
    Some(strip_port(host_and_port))
}

fn strip_port(host_and_port: &str) -> String {
    if host_and_port.starts_with('[') {
        // IPv6 literal, e.g. [::1]:8080
        host_and_port
            .split("]:")
            .next()
            .unwrap_or(host_and_port)
            .trim_end_matches(']')
            .trim_start_matches('[')
            .to_lowercase()
    } else {
        host_and_port
            .split(':')
            .next()
            .unwrap_or(host_and_port)
            .to_lowercase()
    }
}

fn hosts_equivalent(a: &str, b: &str) -> bool {
    a == b || (is_loopback(a) && is_loopback(b))
}

fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "Forbidden: Invalid origin").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_port_from_plain_host() {
        assert_eq!(strip_port("127.0.0.1:8080"), "127.0.0.1");
    }

    #[test]
    fn strips_port_from_ipv6_literal() {
        assert_eq!(strip_port("[::1]:8080"), "::1");
    }

    #[test]
    fn extracts_host_from_full_origin() {
        assert_eq!(header_host("http://localhost:8080").as_deref(), Some("localhost"));
    }

    #[test]
    fn loopback_hosts_are_equivalent() {
        assert!(hosts_equivalent("localhost", "127.0.0.1"));
        assert!(hosts_equivalent("127.0.0.1", "::1"));
        assert!(!hosts_equivalent("localhost", "example.com"));
    }
}
