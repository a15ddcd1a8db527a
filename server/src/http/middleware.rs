use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Sets security headers on all responses.
///
/// No CSP and no `X-Frame-Options`; the API is consumed cross-origin by the desktop UI.
pub(crate) async fn secure_headers_middleware(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    response.headers_mut().insert(
        HeaderName::from_static("cross-origin-opener-policy"),
        HeaderValue::from_static("same-origin"),
    );
    response.headers_mut().insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    response
}

/// Fallback for every route nobody claimed.
pub(crate) async fn not_found(req: Request<Body>) -> impl IntoResponse {
    tracing::warn!(method = %req.method(), uri = %req.uri(), "Unhandled request");
    StatusCode::NOT_FOUND
}
