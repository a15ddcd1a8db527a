//! Request guard for protected routes.

use alloc::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use super::AuthRuntime;
use crate::http::api::api_error;

/// Lets the request through with a valid session cookie or bearer password,
/// answers 401 otherwise.
pub async fn require(
    State(auth): State<Arc<AuthRuntime>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if auth.is_authorized(req.headers()) {
        return next.run(req).await;
    }
    tracing::info!(method = %req.method(), uri = %req.uri(), "require: no valid credentials");
    api_error(StatusCode::UNAUTHORIZED, "authentication required")
}

/// Whether the client reached us over HTTPS: directly when `tls_enabled`, or through
/// a proxy reporting it in `X-Forwarded-Proto`, `Forwarded` or `X-Forwarded-Ssl`.
pub fn request_is_secure(headers: &HeaderMap, tls_enabled: bool) -> bool {
    if tls_enabled {
        return true;
    }
    if let Some(p) = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        && p.eq_ignore_ascii_case("https")
    {
        return true;
    }
    if let Some(fwd) = headers.get("forwarded").and_then(|v| v.to_str().ok())
        && fwd.to_lowercase().contains("proto=https")
    {
        return true;
    }
    headers
        .get("x-forwarded-ssl")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|x| x.eq_ignore_ascii_case("on"))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn forwarded_headers_mark_requests_secure() {
        let mut headers = HeaderMap::new();
        assert!(!request_is_secure(&headers, false), "plain request");
        assert!(request_is_secure(&headers, true), "direct TLS");

        headers.insert("forwarded", HeaderValue::from_static("for=1.2.3.4;Proto=HTTPS"));
        assert!(request_is_secure(&headers, false), "RFC 7239 header");

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        assert!(!request_is_secure(&headers, false), "proxy says plain");
    }
}
